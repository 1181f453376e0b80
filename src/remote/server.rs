use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::domain::{ColorPreference, GameVariant};
use crate::error::SessionError;
use crate::remote::ndjson;
use crate::remote::wire::{Account, ChallengeCreated, ChallengeRef, UserStatus};
use crate::time_control::TimeControlSpec;

pub type LineStream = BoxStream<'static, Result<String, SessionError>>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekRequest {
    pub time_control: TimeControlSpec,
    pub rated: bool,
    pub color: ColorPreference,
    pub variant: GameVariant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub opponent: String,
    pub time_control: TimeControlSpec,
    pub rated: bool,
    pub color: ColorPreference,
    pub variant: GameVariant,
}

/// Per-game commands sent on behalf of the local player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameCommand {
    Move { uci: String, offering_draw: bool },
    Resign,
    Abort,
    Draw { accept: bool },
    Chat { text: String },
}

impl GameCommand {
    pub fn name(&self) -> &'static str {
        match self {
            GameCommand::Move { .. } => "move",
            GameCommand::Resign => "resign",
            GameCommand::Abort => "abort",
            GameCommand::Draw { .. } => "draw",
            GameCommand::Chat { .. } => "chat",
        }
    }
}

/// Transport seam between the session state machine and a concrete game
/// server. Streams yield raw NDJSON lines; decoding happens in the session.
pub trait ChessServer: Send + Sync + 'static {
    fn account(&self) -> BoxFuture<'_, Result<Account, SessionError>>;

    fn stream_events(&self) -> BoxFuture<'_, Result<LineStream, SessionError>>;

    fn stream_game(&self, game_id: String) -> BoxFuture<'_, Result<LineStream, SessionError>>;

    fn user_online(&self, username: String) -> BoxFuture<'_, Result<bool, SessionError>>;

    fn create_challenge(
        &self,
        request: ChallengeRequest,
    ) -> BoxFuture<'_, Result<ChallengeRef, SessionError>>;

    /// Resolves once the seek has been placed. Some servers hold the request
    /// open until an opponent is found; dropping the future cancels the seek.
    fn create_seek(&self, request: SeekRequest) -> BoxFuture<'_, Result<(), SessionError>>;

    fn send_command(
        &self,
        game_id: String,
        command: GameCommand,
    ) -> BoxFuture<'_, Result<(), SessionError>>;
}

/// Lichess board API over HTTPS.
#[derive(Debug, Clone)]
pub struct LichessHttp {
    client: Client,
    base_url: String,
    token: String,
}

impl LichessHttp {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SessionError> {
        let client = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| SessionError::connection_from("cannot build http client", err))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path)).bearer_auth(&self.token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SessionError> {
        let response = request
            .send()
            .await
            .map_err(|err| SessionError::connection_from("request failed", err))?;
        check_status(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SessionError> {
        let response = self.send(request.timeout(REQUEST_TIMEOUT)).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| SessionError::Protocol(format!("cannot decode response: {err}")))
    }

    async fn open_stream(&self, path: &str) -> Result<LineStream, SessionError> {
        let response = self.send(self.get(path)).await?;
        Ok(ndjson::lines(response.bytes_stream()).boxed())
    }
}

async fn check_status(response: Response) -> Result<Response, SessionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::debug!(status = status.as_u16(), body = %body, "server rejected request");
    let err = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        SessionError::Authentication {
            reason: status.to_string(),
        }
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        SessionError::connection("rate limited")
    } else if status.is_server_error() {
        SessionError::connection(format!("server error {status}"))
    } else {
        SessionError::Protocol(format!("{status}: {body}"))
    };
    Err(err)
}

fn clock_fields(time_control: &TimeControlSpec) -> Option<(u64, u64)> {
    time_control
        .base_and_increment()
        .map(|(base, increment)| (base.as_secs(), increment.as_secs()))
}

impl ChessServer for LichessHttp {
    fn account(&self) -> BoxFuture<'_, Result<Account, SessionError>> {
        async move { self.send_json(self.get("api/account")).await }.boxed()
    }

    fn stream_events(&self) -> BoxFuture<'_, Result<LineStream, SessionError>> {
        async move { self.open_stream("api/stream/event").await }.boxed()
    }

    fn stream_game(&self, game_id: String) -> BoxFuture<'_, Result<LineStream, SessionError>> {
        async move {
            self.open_stream(&format!("api/board/game/stream/{game_id}"))
                .await
        }
        .boxed()
    }

    fn user_online(&self, username: String) -> BoxFuture<'_, Result<bool, SessionError>> {
        async move {
            let statuses: Vec<UserStatus> = self
                .send_json(self.get("api/users/status").query(&[("ids", username.as_str())]))
                .await?;
            Ok(statuses
                .iter()
                .find(|status| status.id.eq_ignore_ascii_case(&username))
                .is_some_and(|status| status.online))
        }
        .boxed()
    }

    fn create_challenge(
        &self,
        request: ChallengeRequest,
    ) -> BoxFuture<'_, Result<ChallengeRef, SessionError>> {
        async move {
            let mut form: Vec<(&str, String)> = vec![
                ("rated", request.rated.to_string()),
                ("color", request.color.as_str().to_string()),
                ("variant", request.variant.key().to_string()),
            ];
            if let Some((limit, increment)) = clock_fields(&request.time_control) {
                form.push(("clock.limit", limit.to_string()));
                form.push(("clock.increment", increment.to_string()));
            }

            let created: ChallengeCreated = self
                .send_json(self.post(&format!("api/challenge/{}", request.opponent)).form(&form))
                .await?;
            created
                .into_ref()
                .ok_or_else(|| SessionError::Protocol("challenge response has no id".to_string()))
        }
        .boxed()
    }

    fn create_seek(&self, request: SeekRequest) -> BoxFuture<'_, Result<(), SessionError>> {
        async move {
            let mut form: Vec<(&str, String)> = vec![
                ("rated", request.rated.to_string()),
                ("color", request.color.as_str().to_string()),
                ("variant", request.variant.key().to_string()),
            ];
            match request.time_control.base_and_increment() {
                Some((base, increment)) => {
                    form.push(("time", format!("{}", base.as_secs_f64() / 60.0)));
                    form.push(("increment", increment.as_secs().to_string()));
                }
                None => form.push(("days", "1".to_string())),
            }

            // Held open by the server until the seek is matched or dropped.
            let response = self.send(self.post("api/board/seek").form(&form)).await?;
            response
                .bytes()
                .await
                .map_err(|err| SessionError::connection_from("seek connection dropped", err))?;
            Ok(())
        }
        .boxed()
    }

    fn send_command(
        &self,
        game_id: String,
        command: GameCommand,
    ) -> BoxFuture<'_, Result<(), SessionError>> {
        async move {
            let base = format!("api/board/game/{game_id}");
            let request = match command {
                GameCommand::Move { uci, offering_draw } => {
                    let request = self.post(&format!("{base}/move/{uci}"));
                    if offering_draw {
                        request.query(&[("offeringDraw", "true")])
                    } else {
                        request
                    }
                }
                GameCommand::Resign => self.post(&format!("{base}/resign")),
                GameCommand::Abort => self.post(&format!("{base}/abort")),
                GameCommand::Draw { accept } => {
                    let answer = if accept { "yes" } else { "no" };
                    self.post(&format!("{base}/draw/{answer}"))
                }
                GameCommand::Chat { text } => self
                    .post(&format!("{base}/chat"))
                    .form(&[("room", "player"), ("text", text.as_str())]),
            };
            self.send(request.timeout(REQUEST_TIMEOUT)).await?;
            Ok(())
        }
        .boxed()
    }
}
