//! JSON shapes exchanged with the game server.
//!
//! Incoming events are closed, internally tagged enums; unknown `type` values
//! land in `Other` so new server events never break the stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Side, Termination};

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GameRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChallengeRef {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Events from the account-wide stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IncomingEvent {
    GameStart { game: GameRef },
    GameFinish { game: GameRef },
    Challenge { challenge: ChallengeRef },
    ChallengeCanceled { challenge: ChallengeRef },
    ChallengeDeclined { challenge: ChallengeRef },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rating: Option<u32>,
    #[serde(default, rename = "aiLevel")]
    pub ai_level: Option<u8>,
}

impl PlayerPayload {
    pub fn display_name(&self) -> String {
        match (&self.name, self.ai_level) {
            (Some(name), _) => name.clone(),
            (None, Some(level)) => format!("Stockfish level {level}"),
            (None, None) => "Anonymous".to_string(),
        }
    }

    pub fn is(&self, username: &str) -> bool {
        let matches = |value: &Option<String>| {
            value
                .as_deref()
                .is_some_and(|value| value.eq_ignore_ascii_case(username))
        };
        matches(&self.name) || matches(&self.id)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClockPayload {
    pub initial: u64,
    pub increment: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantPayload {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameFullPayload {
    pub id: String,
    #[serde(default)]
    pub variant: Option<VariantPayload>,
    #[serde(default)]
    pub clock: Option<ClockPayload>,
    #[serde(default)]
    pub white: PlayerPayload,
    #[serde(default)]
    pub black: PlayerPayload,
    #[serde(default)]
    pub initial_fen: Option<String>,
    pub state: GameStatePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameStatePayload {
    #[serde(default)]
    pub moves: String,
    #[serde(default)]
    pub wtime: u64,
    #[serde(default)]
    pub btime: u64,
    #[serde(default)]
    pub winc: u64,
    #[serde(default)]
    pub binc: u64,
    #[serde(default = "started")]
    pub status: String,
    #[serde(default)]
    pub winner: Option<Side>,
    #[serde(default)]
    pub wdraw: bool,
    #[serde(default)]
    pub bdraw: bool,
}

fn started() -> String {
    "started".to_string()
}

impl GameStatePayload {
    pub fn move_list(&self) -> Vec<String> {
        self.moves.split_whitespace().map(str::to_string).collect()
    }

    pub fn white_time(&self) -> Duration {
        Duration::from_millis(self.wtime)
    }

    pub fn black_time(&self) -> Duration {
        Duration::from_millis(self.btime)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatLinePayload {
    pub username: String,
    pub text: String,
    #[serde(default)]
    pub room: Option<String>,
}

/// Events from a single game's stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameStreamEvent {
    GameFull(GameFullPayload),
    GameState(GameStatePayload),
    ChatLine(ChatLinePayload),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserStatus {
    pub id: String,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeCreated {
    #[serde(default)]
    pub challenge: Option<ChallengeRef>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl ChallengeCreated {
    /// The server answers either with the challenge nested under
    /// `challenge` or at the top level.
    pub fn into_ref(self) -> Option<ChallengeRef> {
        match self.challenge {
            Some(challenge) => Some(challenge),
            None => self.id.map(|id| ChallengeRef {
                id,
                status: self.status,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    #[serde(default)]
    pub ok: bool,
}

/// Terminal and non-terminal values of `gameState.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Created,
    Started,
    Aborted,
    Mate,
    Resign,
    Stalemate,
    Timeout,
    Draw,
    OutOfTime,
    Cheat,
    NoStart,
    VariantEnd,
    Unknown,
}

impl RemoteStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "created" => RemoteStatus::Created,
            "started" => RemoteStatus::Started,
            "aborted" => RemoteStatus::Aborted,
            "mate" => RemoteStatus::Mate,
            "resign" => RemoteStatus::Resign,
            "stalemate" => RemoteStatus::Stalemate,
            "timeout" => RemoteStatus::Timeout,
            "draw" => RemoteStatus::Draw,
            "outoftime" => RemoteStatus::OutOfTime,
            "cheat" => RemoteStatus::Cheat,
            "noStart" => RemoteStatus::NoStart,
            "variantEnd" => RemoteStatus::VariantEnd,
            _ => RemoteStatus::Unknown,
        }
    }

    pub fn is_ongoing(self) -> bool {
        matches!(self, RemoteStatus::Created | RemoteStatus::Started)
    }

    /// How a finished game ended. `None` while the game is still running.
    pub fn termination(self) -> Option<Termination> {
        let termination = match self {
            RemoteStatus::Created | RemoteStatus::Started => return None,
            RemoteStatus::Mate => Termination::Checkmate,
            RemoteStatus::Resign => Termination::Resignation,
            RemoteStatus::Stalemate => Termination::Stalemate,
            RemoteStatus::Timeout | RemoteStatus::OutOfTime => Termination::Timeout,
            RemoteStatus::Draw => Termination::Draw,
            RemoteStatus::Aborted | RemoteStatus::NoStart => Termination::Aborted,
            RemoteStatus::VariantEnd => Termination::VariantEnd,
            RemoteStatus::Cheat | RemoteStatus::Unknown => Termination::Error,
        };
        Some(termination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_incoming_events() {
        let start: IncomingEvent =
            serde_json::from_str(r#"{"type":"gameStart","game":{"id":"abc123","gameId":"abc123","color":"white"}}"#)
                .unwrap();
        assert_eq!(
            start,
            IncomingEvent::GameStart {
                game: GameRef { id: "abc123".into() }
            }
        );

        let declined: IncomingEvent =
            serde_json::from_str(r#"{"type":"challengeDeclined","challenge":{"id":"c1","status":"declined"}}"#)
                .unwrap();
        assert!(matches!(declined, IncomingEvent::ChallengeDeclined { challenge } if challenge.id == "c1"));

        let other: IncomingEvent = serde_json::from_str(r#"{"type":"somethingNew","x":1}"#).unwrap();
        assert_eq!(other, IncomingEvent::Other);
    }

    #[test]
    fn parses_game_full() {
        let line = r#"{"type":"gameFull","id":"g1","variant":{"key":"standard"},
            "clock":{"initial":300000,"increment":3000},
            "white":{"id":"alice","name":"Alice","rating":1500},
            "black":{"aiLevel":3},
            "initialFen":"startpos",
            "state":{"type":"gameState","moves":"e2e4 e7e5","wtime":299000,"btime":298500,"winc":3000,"binc":3000,"status":"started"}}"#;
        let GameStreamEvent::GameFull(full) = serde_json::from_str(line).unwrap() else {
            panic!("expected gameFull");
        };
        assert_eq!(full.id, "g1");
        assert_eq!(full.clock.unwrap().initial, 300000);
        assert!(full.white.is("alice"));
        assert_eq!(full.black.display_name(), "Stockfish level 3");
        assert_eq!(full.state.move_list(), vec!["e2e4", "e7e5"]);
        assert_eq!(full.state.black_time(), Duration::from_millis(298500));
        assert_eq!(RemoteStatus::parse(&full.state.status), RemoteStatus::Started);
    }

    #[test]
    fn parses_terminal_state_and_chat() {
        let state: GameStreamEvent = serde_json::from_str(
            r#"{"type":"gameState","moves":"e2e4","wtime":1,"btime":0,"winc":0,"binc":0,"status":"outoftime","winner":"white"}"#,
        )
        .unwrap();
        let GameStreamEvent::GameState(state) = state else {
            panic!("expected gameState");
        };
        assert_eq!(state.winner, Some(Side::White));
        assert!(!RemoteStatus::parse(&state.status).is_ongoing());
        assert_eq!(
            RemoteStatus::parse(&state.status).termination(),
            Some(Termination::Timeout)
        );
        assert_eq!(RemoteStatus::Started.termination(), None);

        let chat: GameStreamEvent =
            serde_json::from_str(r#"{"type":"chatLine","room":"player","username":"bob","text":"gl hf"}"#)
                .unwrap();
        assert!(matches!(chat, GameStreamEvent::ChatLine(line) if line.text == "gl hf"));
    }

    #[test]
    fn challenge_created_accepts_both_shapes() {
        let nested: ChallengeCreated =
            serde_json::from_str(r#"{"challenge":{"id":"c9","status":"created"}}"#).unwrap();
        assert_eq!(nested.into_ref().unwrap().id, "c9");

        let flat: ChallengeCreated = serde_json::from_str(r#"{"id":"c8","status":"created"}"#).unwrap();
        let flat = flat.into_ref().unwrap();
        assert_eq!(flat.id, "c8");
        assert_eq!(flat.status.as_deref(), Some("created"));
    }
}
