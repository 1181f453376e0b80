use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::domain::{ColorPreference, GameVariant};
use crate::remote::server::{ChallengeRequest, SeekRequest};
use crate::remote::session::SessionConfig;
use crate::retry::RetryPolicy;
use crate::time_control::TimeControlSpec;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigFile {
    pub server: ServerConfig,
    pub game: GameConfig,
    pub retry: RetryConfig,
    pub coordinator: CoordinatorSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Environment variable holding the token when `token` is not set.
    pub token_env: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://lichess.org".to_string(),
            token: None,
            token_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub time_control: TimeControlSpec,
    pub variant: GameVariant,
    pub rated: bool,
    pub color: ColorPreference,
    pub seek_timeout_secs: u64,
    pub challenge_timeout_secs: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            time_control: TimeControlSpec::symmetric(Duration::from_secs(300), Duration::from_secs(3)),
            variant: GameVariant::Standard,
            rated: false,
            color: ColorPreference::Random,
            seek_timeout_secs: 30,
            challenge_timeout_secs: 120,
        }
    }
}

/// Partial retry budget; unset keys keep the defaults of the section.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct RetryOverrides {
    pub max_calls: Option<u32>,
    pub window_secs: Option<u64>,
    pub initial_backoff_millis: Option<u64>,
    pub max_backoff_millis: Option<u64>,
}

impl RetryOverrides {
    pub fn apply(&self, base: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_calls: self.max_calls.unwrap_or(base.max_calls),
            window: self.window_secs.map(Duration::from_secs).unwrap_or(base.window),
            initial_backoff: self
                .initial_backoff_millis
                .map(Duration::from_millis)
                .unwrap_or(base.initial_backoff),
            max_backoff: self
                .max_backoff_millis
                .map(Duration::from_millis)
                .unwrap_or(base.max_backoff),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub request: RetryOverrides,
    pub stream: RetryOverrides,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub tick_millis: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self { tick_millis: 1000 }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("server base_url is empty")]
    EmptyBaseUrl,

    #[error("no api token configured (set server.token or server.token_env)")]
    MissingToken,

    #[error("environment variable {0} is not set")]
    TokenEnvUnset(String),

    #[error("{0} retry budget allows no attempts")]
    ZeroRetryBudget(&'static str),

    #[error("{0} retry window is zero")]
    ZeroRetryWindow(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

impl SessionConfigFile {
    pub fn from_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.base_url.trim().is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }

        if self.server.token.is_none() && self.server.token_env.is_none() {
            return Err(ConfigError::MissingToken);
        }

        for (name, policy) in [
            ("request", self.request_retry()),
            ("stream", self.stream_retry()),
        ] {
            if policy.max_calls == 0 {
                return Err(ConfigError::ZeroRetryBudget(name));
            }
            if policy.window.is_zero() {
                return Err(ConfigError::ZeroRetryWindow(name));
            }
        }

        if self.game.seek_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("seek_timeout_secs"));
        }
        if self.game.challenge_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("challenge_timeout_secs"));
        }
        if self.coordinator.tick_millis == 0 {
            return Err(ConfigError::ZeroTimeout("tick_millis"));
        }

        Ok(())
    }

    /// The configured token, read from the environment when only
    /// `token_env` is given.
    pub fn token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.server.token {
            return Ok(token.trim().to_string());
        }
        let name = self
            .server
            .token_env
            .as_deref()
            .ok_or(ConfigError::MissingToken)?;
        env::var(name)
            .map(|token| token.trim().to_string())
            .map_err(|_| ConfigError::TokenEnvUnset(name.to_string()))
    }

    pub fn request_retry(&self) -> RetryPolicy {
        self.retry.request.apply(RetryPolicy::requests())
    }

    pub fn stream_retry(&self) -> RetryPolicy {
        self.retry.stream.apply(RetryPolicy::streams())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.request_retry(), self.stream_retry())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tick: Duration::from_millis(self.coordinator.tick_millis),
        }
    }

    pub fn seek_request(&self) -> SeekRequest {
        SeekRequest {
            time_control: self.game.time_control,
            rated: self.game.rated,
            color: self.game.color,
            variant: self.game.variant,
        }
    }

    pub fn challenge_request(&self, opponent: &str) -> ChallengeRequest {
        ChallengeRequest {
            opponent: opponent.to_string(),
            time_control: self.game.time_control,
            rated: self.game.rated,
            color: self.game.color,
            variant: self.game.variant,
        }
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_secs(self.game.seek_timeout_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.game.challenge_timeout_secs)
    }
}
