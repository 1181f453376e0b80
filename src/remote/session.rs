//! Connection lifecycle against a game server.
//!
//! A [`RemoteSession`] owns the account event stream and, once a game is
//! running, that game's stream. Both are read on the network worker and
//! translated into [`SessionEvent`]s for the coordinator. At most one seek or
//! challenge is outstanding at a time.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::domain::{GameInfo, GameVariant, PlayerInfo, Side};
use crate::error::SessionError;
use crate::remote::ndjson;
use crate::remote::server::{ChallengeRequest, ChessServer, GameCommand, SeekRequest};
use crate::remote::wire::{
    GameFullPayload, GameStatePayload, GameStreamEvent, IncomingEvent, PlayerPayload, RemoteStatus,
};
use crate::retry::{RetryPolicy, retry};

const RECENT_STARTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Idle,
    Seeking,
    Challenging,
    InGame,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Seeking,
    Challenging,
    InGame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Seek,
    Challenge,
}

impl RequestKind {
    fn operation(self) -> &'static str {
        match self {
            RequestKind::Seek => "seek",
            RequestKind::Challenge => "challenge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameHandle {
    pub game_id: String,
}

type Resolution = Result<GameHandle, SessionError>;

struct PendingRequest {
    kind: RequestKind,
    correlation_id: Uuid,
    challenge_id: Option<String>,
    deadline: Instant,
    resolver: oneshot::Sender<Resolution>,
}

/// Game state as last reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteGameState {
    pub moves: Vec<String>,
    pub white_time: Duration,
    pub black_time: Duration,
    pub status: RemoteStatus,
    pub winner: Option<Side>,
    pub white_offers_draw: bool,
    pub black_offers_draw: bool,
}

impl RemoteGameState {
    pub fn is_ongoing(&self) -> bool {
        self.status.is_ongoing()
    }

    pub fn offers_draw(&self, side: Side) -> bool {
        match side {
            Side::White => self.white_offers_draw,
            Side::Black => self.black_offers_draw,
        }
    }
}

impl From<&GameStatePayload> for RemoteGameState {
    fn from(payload: &GameStatePayload) -> Self {
        Self {
            moves: payload.move_list(),
            white_time: payload.white_time(),
            black_time: payload.black_time(),
            status: RemoteStatus::parse(&payload.status),
            winner: payload.winner,
            white_offers_draw: payload.wdraw,
            black_offers_draw: payload.bdraw,
        }
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    GameFull {
        info: GameInfo,
        /// Base time and increment, absent for untimed games.
        clock: Option<(Duration, Duration)>,
        state: RemoteGameState,
    },
    GameState(RemoteGameState),
    ChatLine {
        username: String,
        text: String,
    },
    GameFinished {
        game_id: String,
    },
    /// The session gave up on the connection. No further events follow
    /// until a new `connect`.
    Fatal(SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionConfig {
    pub request_retry: RetryPolicy,
    pub stream_retry: RetryPolicy,
}

impl SessionConfig {
    pub fn new(request_retry: RetryPolicy, stream_retry: RetryPolicy) -> Self {
        Self {
            request_retry,
            stream_retry,
        }
    }
}

struct Shared {
    link: Link,
    phase: Phase,
    username: Option<String>,
    pending: Option<PendingRequest>,
    /// Game whose stream is routed to the coordinator. Kept after the game
    /// finishes so the final state is still delivered.
    active_game: Option<String>,
    expired_challenges: HashSet<String>,
    recent_starts: VecDeque<String>,
    event_task: Option<JoinHandle<()>>,
    game_task: Option<JoinHandle<()>>,
    request_task: Option<JoinHandle<()>>,
}

impl Shared {
    fn abort_tasks(&mut self) {
        for task in [
            self.event_task.take(),
            self.game_task.take(),
            self.request_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    server: Arc<dyn ChessServer>,
    worker: Handle,
    config: SessionConfig,
    shared: Mutex<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    link_tx: watch::Sender<Link>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_tasks();
    }
}

/// Cheaply cloneable handle to one server connection.
#[derive(Clone)]
pub struct RemoteSession {
    inner: Arc<Inner>,
}

impl RemoteSession {
    /// `worker` is the runtime that performs all network I/O.
    pub fn new(
        server: Arc<dyn ChessServer>,
        worker: Handle,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (link_tx, _) = watch::channel(Link::Disconnected);
        let inner = Inner {
            server,
            worker,
            config,
            shared: Mutex::new(Shared {
                link: Link::Disconnected,
                phase: Phase::Idle,
                username: None,
                pending: None,
                active_game: None,
                expired_challenges: HashSet::new(),
                recent_starts: VecDeque::new(),
                event_task: None,
                game_task: None,
                request_task: None,
            }),
            events,
            link_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn state(&self) -> ConnectionState {
        let shared = self.inner.lock();
        match (shared.link, shared.phase) {
            (Link::Disconnected, _) => ConnectionState::Disconnected,
            (Link::Connecting, _) => ConnectionState::Connecting,
            (Link::Closed, _) => ConnectionState::Closed,
            (Link::Connected, Phase::Idle) => ConnectionState::Idle,
            (Link::Connected, Phase::Seeking) => ConnectionState::Seeking,
            (Link::Connected, Phase::Challenging) => ConnectionState::Challenging,
            (Link::Connected, Phase::InGame) => ConnectionState::InGame,
        }
    }

    pub fn username(&self) -> Option<String> {
        self.inner.lock().username.clone()
    }

    pub fn active_game(&self) -> Option<String> {
        self.inner.lock().active_game.clone()
    }

    /// Authenticate and open the account event stream. Calling it on an
    /// already connected session is a no-op.
    pub async fn connect(&self) -> Result<String, SessionError> {
        {
            let mut shared = self.inner.lock();
            match shared.link {
                Link::Connected => {
                    if let Some(username) = &shared.username {
                        return Ok(username.clone());
                    }
                }
                Link::Closed => return Err(SessionError::Cancelled),
                Link::Connecting => return Err(SessionError::RequestPending),
                Link::Disconnected => {}
            }
            shared.link = Link::Connecting;
        }
        self.inner.link_tx.send_replace(Link::Connecting);

        let server = self.inner.server.clone();
        let account = retry(self.inner.config.request_retry, "connect", || {
            let server = server.clone();
            async move { server.account().await }
        })
        .await;

        let mut shared = self.inner.lock();
        if shared.link == Link::Closed {
            return Err(SessionError::Cancelled);
        }
        match account {
            Ok(account) => {
                tracing::info!(username = %account.username, "connected");
                shared.link = Link::Connected;
                shared.phase = Phase::Idle;
                shared.username = Some(account.username.clone());
                shared.event_task = Some(Inner::spawn_event_loop(&self.inner));
                drop(shared);
                self.inner.link_tx.send_replace(Link::Connected);
                Ok(account.username)
            }
            Err(err) => {
                tracing::error!(error = %err, "cannot connect");
                shared.link = Link::Disconnected;
                drop(shared);
                self.inner.link_tx.send_replace(Link::Disconnected);
                Err(err)
            }
        }
    }

    /// Ask the server for a random opponent. Resolves when a game starts or
    /// after `timeout`, whichever comes first.
    pub async fn seek_game(&self, request: SeekRequest, timeout: Duration) -> Resolution {
        let (correlation_id, resolution) = self.inner.register(RequestKind::Seek, timeout)?;

        let server = self.inner.server.clone();
        let weak = Arc::downgrade(&self.inner);
        let policy = self.inner.config.request_retry;
        let link_rx = self.inner.link_tx.subscribe();
        let task = self.inner.worker.spawn(async move {
            let placed = retry(policy, "seek", || {
                let server = server.clone();
                let request = request.clone();
                let mut link_rx = link_rx.clone();
                async move {
                    link_ready(&mut link_rx).await?;
                    server.create_seek(request).await
                }
            })
            .await;
            if let (Err(err), Some(inner)) = (placed, weak.upgrade()) {
                inner.resolve(correlation_id, Err(err));
            }
        });
        self.inner.attach_task(correlation_id, task);

        self.await_resolution(correlation_id, resolution, timeout, RequestKind::Seek)
            .await
    }

    /// Challenge a specific user. Fails fast when the user is offline.
    pub async fn create_challenge(&self, request: ChallengeRequest, timeout: Duration) -> Resolution {
        let (correlation_id, resolution) = self.inner.register(RequestKind::Challenge, timeout)?;

        let server = self.inner.server.clone();
        let weak = Arc::downgrade(&self.inner);
        let policy = self.inner.config.request_retry;
        let link_rx = self.inner.link_tx.subscribe();
        let task = self.inner.worker.spawn(async move {
            let created = issue_challenge(server, policy, link_rx, request).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match created {
                Ok(challenge_id) => inner.attach_challenge(correlation_id, challenge_id),
                Err(err) => inner.resolve(correlation_id, Err(err)),
            }
        });
        self.inner.attach_task(correlation_id, task);

        self.await_resolution(correlation_id, resolution, timeout, RequestKind::Challenge)
            .await
    }

    async fn await_resolution(
        &self,
        correlation_id: Uuid,
        mut resolution: oneshot::Receiver<Resolution>,
        timeout: Duration,
        kind: RequestKind,
    ) -> Resolution {
        match tokio::time::timeout(timeout, &mut resolution).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                self.inner.expire(correlation_id);
                // Resolved between the deadline and the expiry.
                if let Ok(result) = resolution.try_recv() {
                    return result;
                }
                Err(SessionError::OperationTimeout {
                    operation: kind.operation().to_string(),
                })
            }
        }
    }

    pub async fn make_move(&self, uci: &str, offering_draw: bool) -> Result<(), SessionError> {
        self.command(GameCommand::Move {
            uci: uci.to_string(),
            offering_draw,
        })
        .await
    }

    pub async fn resign(&self) -> Result<(), SessionError> {
        self.command(GameCommand::Resign).await
    }

    pub async fn abort(&self) -> Result<(), SessionError> {
        self.command(GameCommand::Abort).await
    }

    pub async fn offer_draw(&self) -> Result<(), SessionError> {
        self.command(GameCommand::Draw { accept: true }).await
    }

    pub async fn respond_to_draw(&self, accept: bool) -> Result<(), SessionError> {
        self.command(GameCommand::Draw { accept }).await
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), SessionError> {
        self.command(GameCommand::Chat {
            text: text.to_string(),
        })
        .await
    }

    /// Send one per-game command. Commands are never retried: if the link
    /// drops while one is in flight it fails and the caller must not assume
    /// it was applied.
    async fn command(&self, command: GameCommand) -> Result<(), SessionError> {
        let (game_id, mut link_rx) = {
            let shared = self.inner.lock();
            match shared.link {
                Link::Connected => {}
                Link::Closed => return Err(SessionError::Cancelled),
                Link::Disconnected | Link::Connecting => return Err(SessionError::NotConnected),
            }
            if shared.phase != Phase::InGame {
                return Err(SessionError::NoActiveGame);
            }
            let Some(game_id) = shared.active_game.clone() else {
                return Err(SessionError::NoActiveGame);
            };
            (game_id, self.inner.link_tx.subscribe())
        };

        tracing::debug!(game_id = %game_id, command = command.name(), "sending command");
        let server = self.inner.server.clone();
        let task = self.inner.worker.spawn(async move {
            tokio::select! {
                result = server.send_command(game_id, command) => result,
                err = link_lost(&mut link_rx) => Err(err),
            }
        });
        task.await.map_err(|_| SessionError::Cancelled)?
    }

    /// Tear the session down. Pending requests resolve with `Cancelled`;
    /// repeated calls are no-ops.
    pub fn close(&self) {
        let pending = {
            let mut shared = self.inner.lock();
            if shared.link == Link::Closed {
                return;
            }
            shared.link = Link::Closed;
            shared.phase = Phase::Idle;
            shared.abort_tasks();
            shared.pending.take()
        };
        self.inner.link_tx.send_replace(Link::Closed);
        if let Some(pending) = pending {
            let _ = pending.resolver.send(Err(SessionError::Cancelled));
        }
        tracing::info!("session closed");
    }
}

async fn issue_challenge(
    server: Arc<dyn ChessServer>,
    policy: RetryPolicy,
    link_rx: watch::Receiver<Link>,
    request: ChallengeRequest,
) -> Result<String, SessionError> {
    let opponent = request.opponent.clone();
    let online = retry(policy, "user status", || {
        let server = server.clone();
        let opponent = opponent.clone();
        let mut link_rx = link_rx.clone();
        async move {
            link_ready(&mut link_rx).await?;
            server.user_online(opponent).await
        }
    })
    .await?;
    if !online {
        return Err(SessionError::ChallengedUserIsOffline { username: opponent });
    }

    let created = retry(policy, "create challenge", || {
        let server = server.clone();
        let request = request.clone();
        let mut link_rx = link_rx.clone();
        async move {
            link_ready(&mut link_rx).await?;
            server.create_challenge(request).await
        }
    })
    .await?;
    match created.status.as_deref() {
        None | Some("created") => Ok(created.id),
        Some(_) => Err(SessionError::ChallengeRejected {
            challenge_id: Some(created.id),
        }),
    }
}

/// Hold an outgoing request while the streams reconnect. Nothing is sent
/// unless the link is connected.
async fn link_ready(link_rx: &mut watch::Receiver<Link>) -> Result<(), SessionError> {
    loop {
        let link = *link_rx.borrow_and_update();
        match link {
            Link::Connected => return Ok(()),
            Link::Closed => return Err(SessionError::Cancelled),
            Link::Disconnected => return Err(SessionError::NotConnected),
            Link::Connecting => {}
        }
        if link_rx.changed().await.is_err() {
            return Err(SessionError::Cancelled);
        }
    }
}

async fn link_lost(link_rx: &mut watch::Receiver<Link>) -> SessionError {
    loop {
        if link_rx.changed().await.is_err() {
            return SessionError::Cancelled;
        }
        match *link_rx.borrow_and_update() {
            Link::Connected => continue,
            Link::Closed => return SessionError::Cancelled,
            Link::Disconnected | Link::Connecting => {
                return SessionError::connection("connection lost while a command was in flight");
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("session event dropped, no receiver");
        }
    }

    fn register(
        &self,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<(Uuid, oneshot::Receiver<Resolution>), SessionError> {
        let mut shared = self.lock();
        match shared.link {
            Link::Connected => {}
            Link::Closed => return Err(SessionError::Cancelled),
            Link::Disconnected | Link::Connecting => return Err(SessionError::NotConnected),
        }
        if shared.pending.is_some() {
            return Err(SessionError::RequestPending);
        }
        if shared.phase == Phase::InGame {
            return Err(SessionError::GameInProgress);
        }

        let (resolver, resolution) = oneshot::channel();
        let correlation_id = Uuid::new_v4();
        shared.pending = Some(PendingRequest {
            kind,
            correlation_id,
            challenge_id: None,
            deadline: Instant::now() + timeout,
            resolver,
        });
        shared.phase = match kind {
            RequestKind::Seek => Phase::Seeking,
            RequestKind::Challenge => Phase::Challenging,
        };
        tracing::info!(%correlation_id, operation = kind.operation(), "request registered");
        Ok((correlation_id, resolution))
    }

    fn attach_task(&self, correlation_id: Uuid, task: JoinHandle<()>) {
        let mut shared = self.lock();
        let still_pending = shared
            .pending
            .as_ref()
            .is_some_and(|pending| pending.correlation_id == correlation_id);
        if still_pending && shared.link != Link::Closed {
            if let Some(previous) = shared.request_task.replace(task) {
                previous.abort();
            }
        } else if shared.phase != Phase::InGame {
            task.abort();
        }
    }

    fn attach_challenge(self: &Arc<Self>, correlation_id: Uuid, challenge_id: String) {
        let mut shared = self.lock();
        let still_pending = shared
            .pending
            .as_ref()
            .is_some_and(|pending| pending.correlation_id == correlation_id);
        if !still_pending {
            // Timed out before the server answered.
            shared.expired_challenges.insert(challenge_id);
            return;
        }
        tracing::info!(challenge_id = %challenge_id, "challenge created");
        if let Some(pending) = shared.pending.as_mut() {
            pending.challenge_id = Some(challenge_id.clone());
        }

        // The game may have started before the create call returned.
        if let Some(index) = shared.recent_starts.iter().position(|id| *id == challenge_id) {
            shared.recent_starts.remove(index);
            self.start_game(&mut shared, challenge_id);
        }
    }

    /// Resolve the pending request if it is still the one identified by
    /// `correlation_id`.
    fn resolve(&self, correlation_id: Uuid, result: Resolution) {
        let pending = {
            let mut shared = self.lock();
            let Some(pending) = shared
                .pending
                .take_if(|pending| pending.correlation_id == correlation_id)
            else {
                return;
            };
            if shared.phase != Phase::InGame {
                shared.phase = Phase::Idle;
            }
            if let Some(task) = shared.request_task.take() {
                task.abort();
            }
            pending
        };
        if let Err(err) = &result {
            tracing::warn!(operation = pending.kind.operation(), error = %err, "request failed");
        }
        let _ = pending.resolver.send(result);
    }

    fn expire(&self, correlation_id: Uuid) {
        let mut shared = self.lock();
        let Some(pending) = shared
            .pending
            .take_if(|pending| pending.correlation_id == correlation_id)
        else {
            return;
        };
        tracing::warn!(
            operation = pending.kind.operation(),
            overdue_ms = Instant::now().saturating_duration_since(pending.deadline).as_millis() as u64,
            "request timed out"
        );
        if let Some(challenge_id) = pending.challenge_id {
            shared.expired_challenges.insert(challenge_id);
        }
        if shared.phase != Phase::InGame {
            shared.phase = Phase::Idle;
        }
        if let Some(task) = shared.request_task.take() {
            task.abort();
        }
    }

    /// Move to `InGame`, open the game stream and resolve the pending
    /// request, all under the caller's lock.
    fn start_game(self: &Arc<Self>, shared: &mut Shared, game_id: String) {
        tracing::info!(game_id = %game_id, "game started");
        shared.phase = Phase::InGame;
        shared.active_game = Some(game_id.clone());
        if let Some(task) = shared.game_task.replace(Inner::spawn_game_loop(self, game_id.clone())) {
            task.abort();
        }
        if let Some(task) = shared.request_task.take() {
            task.abort();
        }
        if let Some(pending) = shared.pending.take() {
            let _ = pending.resolver.send(Ok(GameHandle { game_id }));
        }
    }

    fn spawn_event_loop(this: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(this);
        let server = this.server.clone();
        let policy = this.config.stream_retry;
        this.worker.spawn(async move {
            let result = retry(policy, "event stream", || {
                read_events(server.clone(), weak.clone())
            })
            .await;
            if let (Err(err), Some(inner)) = (result, weak.upgrade()) {
                inner.fail(err);
            }
        })
    }

    fn spawn_game_loop(this: &Arc<Self>, game_id: String) -> JoinHandle<()> {
        let weak = Arc::downgrade(this);
        let server = this.server.clone();
        let policy = this.config.stream_retry;
        this.worker.spawn(async move {
            let result = retry(policy, "game stream", || {
                read_game(server.clone(), weak.clone(), game_id.clone())
            })
            .await;
            match (result, weak.upgrade()) {
                (Ok(()), _) => tracing::debug!(game_id = %game_id, "game stream finished"),
                (Err(err), Some(inner)) => inner.fail(err),
                (Err(_), None) => {}
            }
        })
    }

    /// Stream retries are exhausted: the connection is gone for good.
    fn fail(&self, err: SessionError) {
        let pending = {
            let mut shared = self.lock();
            if shared.link == Link::Closed {
                return;
            }
            tracing::error!(error = %err, "session connection lost");
            shared.link = Link::Disconnected;
            shared.abort_tasks();
            shared.pending.take()
        };
        self.link_tx.send_replace(Link::Disconnected);
        if let Some(pending) = pending {
            let _ = pending
                .resolver
                .send(Err(SessionError::connection(format!("connection lost: {err}"))));
        }
        self.emit(SessionEvent::Fatal(err));
    }

    fn link_lost(&self) {
        let mut shared = self.lock();
        if shared.link == Link::Connected {
            tracing::warn!("stream interrupted, reconnecting");
            shared.link = Link::Connecting;
            drop(shared);
            self.link_tx.send_replace(Link::Connecting);
        }
    }

    fn link_restored(&self) {
        let mut shared = self.lock();
        if shared.link == Link::Connecting {
            tracing::info!("stream restored");
            shared.link = Link::Connected;
            drop(shared);
            self.link_tx.send_replace(Link::Connected);
        }
    }

    fn dispatch_incoming(self: &Arc<Self>, event: IncomingEvent) {
        let mut shared = self.lock();
        match event {
            IncomingEvent::GameStart { game } => {
                if shared.expired_challenges.remove(&game.id) {
                    tracing::info!(game_id = %game.id, "ignoring game start for an expired request");
                    return;
                }
                let claimed = shared.pending.as_ref().map(|pending| match pending.kind {
                    RequestKind::Seek => true,
                    RequestKind::Challenge => pending.challenge_id.as_deref() == Some(game.id.as_str()),
                });
                match claimed {
                    Some(true) => self.start_game(&mut shared, game.id),
                    Some(false) => {
                        // Challenge id not known yet.
                        if shared.recent_starts.len() == RECENT_STARTS {
                            shared.recent_starts.pop_front();
                        }
                        shared.recent_starts.push_back(game.id);
                    }
                    None if shared.active_game.as_deref() == Some(game.id.as_str()) => {
                        tracing::debug!(game_id = %game.id, "repeated game start");
                    }
                    None => tracing::debug!(game_id = %game.id, "discarding start of unrelated game"),
                }
            }
            IncomingEvent::GameFinish { game } => {
                if shared.pending_challenge_is(&game.id) {
                    drop(shared);
                    self.reject_challenge(game.id);
                } else if shared.active_game.as_deref() == Some(game.id.as_str()) {
                    tracing::info!(game_id = %game.id, "game finished");
                    if shared.phase == Phase::InGame {
                        shared.phase = Phase::Idle;
                    }
                    drop(shared);
                    self.emit(SessionEvent::GameFinished { game_id: game.id });
                } else {
                    tracing::debug!(game_id = %game.id, "discarding finish of unrelated game");
                }
            }
            IncomingEvent::ChallengeDeclined { challenge }
            | IncomingEvent::ChallengeCanceled { challenge } => {
                if shared.pending_challenge_is(&challenge.id) {
                    drop(shared);
                    self.reject_challenge(challenge.id);
                } else {
                    shared.expired_challenges.remove(&challenge.id);
                    tracing::debug!(challenge_id = %challenge.id, "discarding unrelated challenge update");
                }
            }
            IncomingEvent::Challenge { .. } | IncomingEvent::Other => {}
        }
    }

    fn reject_challenge(&self, challenge_id: String) {
        let correlation_id = self.lock().pending.as_ref().map(|pending| pending.correlation_id);
        if let Some(correlation_id) = correlation_id {
            self.resolve(
                correlation_id,
                Err(SessionError::ChallengeRejected {
                    challenge_id: Some(challenge_id),
                }),
            );
        }
    }

    /// Returns `true` once the game has reached a terminal status.
    fn dispatch_game(&self, game_id: &str, event: GameStreamEvent) -> bool {
        let username = {
            let shared = self.lock();
            if shared.active_game.as_deref() != Some(game_id) {
                tracing::debug!(game_id, "discarding event for inactive game");
                return false;
            }
            shared.username.clone().unwrap_or_default()
        };

        match event {
            GameStreamEvent::GameFull(full) => {
                let state = RemoteGameState::from(&full.state);
                let finished = !state.is_ongoing();
                let (info, clock) = game_info(&full, &username);
                self.emit(SessionEvent::GameFull { info, clock, state });
                finished
            }
            GameStreamEvent::GameState(payload) => {
                let state = RemoteGameState::from(&payload);
                let finished = !state.is_ongoing();
                self.emit(SessionEvent::GameState(state));
                finished
            }
            GameStreamEvent::ChatLine(line) => {
                if !line.username.eq_ignore_ascii_case(&username) {
                    self.emit(SessionEvent::ChatLine {
                        username: line.username,
                        text: line.text,
                    });
                }
                false
            }
            GameStreamEvent::Other => false,
        }
    }
}

impl Shared {
    fn pending_challenge_is(&self, challenge_id: &str) -> bool {
        self.pending.as_ref().is_some_and(|pending| {
            pending.kind == RequestKind::Challenge
                && pending.challenge_id.as_deref() == Some(challenge_id)
        })
    }
}

fn player_info(player: &PlayerPayload) -> PlayerInfo {
    PlayerInfo {
        name: player.display_name(),
        rating: player.rating,
    }
}

fn game_info(full: &GameFullPayload, username: &str) -> (GameInfo, Option<(Duration, Duration)>) {
    let user_side = if full.white.is(username) {
        Some(Side::White)
    } else if full.black.is(username) {
        Some(Side::Black)
    } else {
        None
    };
    let variant = full
        .variant
        .as_ref()
        .and_then(|variant| variant.key.parse::<GameVariant>().ok())
        .unwrap_or_default();
    let initial_fen = full
        .initial_fen
        .clone()
        .filter(|fen| fen != "startpos" && !fen.is_empty());
    let clock = full.clock.map(|clock| {
        (
            Duration::from_millis(clock.initial),
            Duration::from_millis(clock.increment),
        )
    });

    let info = GameInfo {
        game_id: Some(full.id.clone()),
        variant,
        white: player_info(&full.white),
        black: player_info(&full.black),
        user_side,
        initial_fen,
    };
    (info, clock)
}

async fn read_events(server: Arc<dyn ChessServer>, weak: Weak<Inner>) -> Result<(), SessionError> {
    let result = pump_events(&server, &weak).await;
    if result.is_err() {
        if let Some(inner) = weak.upgrade() {
            inner.link_lost();
        }
    }
    result
}

async fn pump_events(server: &Arc<dyn ChessServer>, weak: &Weak<Inner>) -> Result<(), SessionError> {
    let mut lines = server.stream_events().await?;
    match weak.upgrade() {
        Some(inner) => inner.link_restored(),
        None => return Ok(()),
    }

    while let Some(line) = lines.next().await {
        let line = line?;
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        match ndjson::decode::<IncomingEvent>(&line) {
            Ok(event) => inner.dispatch_incoming(event),
            Err(err) => tracing::warn!(error = %err, "skipping undecodable event"),
        }
    }
    Err(SessionError::connection("event stream closed by server"))
}

async fn read_game(
    server: Arc<dyn ChessServer>,
    weak: Weak<Inner>,
    game_id: String,
) -> Result<(), SessionError> {
    let mut lines = server.stream_game(game_id.clone()).await?;
    while let Some(line) = lines.next().await {
        let line = line?;
        let Some(inner) = weak.upgrade() else {
            return Ok(());
        };
        match ndjson::decode::<GameStreamEvent>(&line) {
            Ok(event) => {
                if inner.dispatch_game(&game_id, event) {
                    return Ok(());
                }
            }
            Err(err) => tracing::warn!(game_id = %game_id, error = %err, "skipping undecodable game event"),
        }
    }
    Err(SessionError::connection("game stream closed by server"))
}
