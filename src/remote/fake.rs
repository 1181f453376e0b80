//! Scriptable in-memory server used by session and coordinator tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SessionError;
use crate::remote::server::{ChallengeRequest, ChessServer, GameCommand, LineStream, SeekRequest};
use crate::remote::wire::{Account, ChallengeRef};

type LineSender = mpsc::UnboundedSender<Result<String, SessionError>>;

#[derive(Default)]
pub struct FakeState {
    pub username: String,
    pub reject_auth: bool,
    pub account_failures: u32,
    pub refuse_streams: bool,
    pub online: HashSet<String>,
    pub challenge_id: String,
    pub challenges: Vec<ChallengeRequest>,
    pub seeks: Vec<SeekRequest>,
    pub failing_seeks: u32,
    pub commands: Vec<(String, GameCommand)>,
    pub failing_commands: u32,
    pub hold_commands: bool,
    pub event_opens: u32,
    pub game_opens: HashMap<String, u32>,
    event_tx: Option<LineSender>,
    game_tx: HashMap<String, LineSender>,
}

pub struct FakeServer {
    state: Mutex<FakeState>,
}

fn channel_stream() -> (LineSender, LineStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let lines = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) });
    (tx, lines.boxed())
}

impl FakeServer {
    pub fn new(username: &str) -> Self {
        Self {
            state: Mutex::new(FakeState {
                username: username.to_string(),
                challenge_id: "chal1".to_string(),
                ..FakeState::default()
            }),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn push_event(&self, event: Value) {
        self.with(|state| {
            let tx = state.event_tx.as_ref().expect("event stream is not open");
            let _ = tx.send(Ok(event.to_string()));
        });
    }

    pub fn push_game(&self, game_id: &str, event: Value) {
        self.with(|state| {
            let tx = state.game_tx.get(game_id).expect("game stream is not open");
            let _ = tx.send(Ok(event.to_string()));
        });
    }

    pub fn push_raw_game_line(&self, game_id: &str, line: &str) {
        self.with(|state| {
            let tx = state.game_tx.get(game_id).expect("game stream is not open");
            let _ = tx.send(Ok(line.to_string()));
        });
    }

    /// Fail the open event stream with a transport error.
    pub fn break_event_stream(&self) {
        self.with(|state| {
            if let Some(tx) = state.event_tx.take() {
                let _ = tx.send(Err(SessionError::connection("connection reset")));
            }
        });
    }

    pub fn break_game_stream(&self, game_id: &str) {
        self.with(|state| {
            if let Some(tx) = state.game_tx.remove(game_id) {
                let _ = tx.send(Err(SessionError::connection("connection reset")));
            }
        });
    }

    pub fn commands(&self) -> Vec<(String, GameCommand)> {
        self.with(|state| state.commands.clone())
    }

    pub fn event_opens(&self) -> u32 {
        self.with(|state| state.event_opens)
    }

    pub fn game_opens(&self, game_id: &str) -> u32 {
        self.with(|state| state.game_opens.get(game_id).copied().unwrap_or(0))
    }

    pub async fn wait_until(&self, what: &str, check: impl Fn(&FakeState) -> bool) {
        for _ in 0..400 {
            if self.with(|state| check(state)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    pub async fn wait_for_event_stream(&self, opens: u32) {
        self.wait_until("event stream", |state| {
            state.event_opens >= opens && state.event_tx.is_some()
        })
        .await;
    }

    pub async fn wait_for_game_stream(&self, game_id: &str, opens: u32) {
        self.wait_until("game stream", |state| {
            state.game_opens.get(game_id).copied().unwrap_or(0) >= opens
                && state.game_tx.contains_key(game_id)
        })
        .await;
    }

    pub async fn wait_for_commands(&self, count: usize) {
        self.wait_until("commands", |state| state.commands.len() >= count)
            .await;
    }
}

impl ChessServer for FakeServer {
    fn account(&self) -> BoxFuture<'_, Result<Account, SessionError>> {
        let result = self.with(|state| {
            if state.reject_auth {
                return Err(SessionError::Authentication {
                    reason: "401 Unauthorized".into(),
                });
            }
            if state.account_failures > 0 {
                state.account_failures -= 1;
                return Err(SessionError::connection("connection refused"));
            }
            Ok(Account {
                username: state.username.clone(),
            })
        });
        async move { result }.boxed()
    }

    fn stream_events(&self) -> BoxFuture<'_, Result<LineStream, SessionError>> {
        let result = self.with(|state| {
            state.event_opens += 1;
            if state.refuse_streams {
                return Err(SessionError::connection("connection refused"));
            }
            let (tx, lines) = channel_stream();
            state.event_tx = Some(tx);
            Ok(lines)
        });
        async move { result }.boxed()
    }

    fn stream_game(&self, game_id: String) -> BoxFuture<'_, Result<LineStream, SessionError>> {
        let result = self.with(|state| {
            *state.game_opens.entry(game_id.clone()).or_default() += 1;
            if state.refuse_streams {
                return Err(SessionError::connection("connection refused"));
            }
            let (tx, lines) = channel_stream();
            state.game_tx.insert(game_id, tx);
            Ok(lines)
        });
        async move { result }.boxed()
    }

    fn user_online(&self, username: String) -> BoxFuture<'_, Result<bool, SessionError>> {
        let online = self.with(|state| state.online.contains(&username));
        async move { Ok(online) }.boxed()
    }

    fn create_challenge(
        &self,
        request: ChallengeRequest,
    ) -> BoxFuture<'_, Result<ChallengeRef, SessionError>> {
        let id = self.with(|state| {
            state.challenges.push(request);
            state.challenge_id.clone()
        });
        async move {
            Ok(ChallengeRef {
                id,
                status: Some("created".into()),
            })
        }
        .boxed()
    }

    fn create_seek(&self, request: SeekRequest) -> BoxFuture<'_, Result<(), SessionError>> {
        let result = self.with(|state| {
            state.seeks.push(request);
            if state.failing_seeks > 0 {
                state.failing_seeks -= 1;
                return Err(SessionError::connection("connection reset"));
            }
            Ok(())
        });
        async move { result }.boxed()
    }

    fn send_command(
        &self,
        game_id: String,
        command: GameCommand,
    ) -> BoxFuture<'_, Result<(), SessionError>> {
        let (hold, fail) = self.with(|state| {
            state.commands.push((game_id, command));
            let fail = state.failing_commands > 0;
            if fail {
                state.failing_commands -= 1;
            }
            (state.hold_commands, fail)
        });
        async move {
            if hold {
                futures::future::pending::<()>().await;
            }
            if fail {
                return Err(SessionError::Protocol("400 Bad Request".into()));
            }
            Ok(())
        }
        .boxed()
    }
}
