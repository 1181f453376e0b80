//! The single serialization point of a game.
//!
//! [`GameCoordinator::run`] consumes one queue of [`Input`]s. Local commands
//! arrive through a [`CoordinatorHandle`], remote events are forwarded from
//! the session, clock ticks come from a timer task and move acknowledgements
//! from the tasks awaiting them. Only the loop touches the `GameState` and
//! `TimeControl`, so observers see transitions in exactly the order they were
//! applied.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::{GameInfo, GameOutcome, GameSnapshot, Side, Termination};
use crate::error::{CoordinatorError, GameError, SessionError};
use crate::game_state::{GameState, PlayedMove};
use crate::notification::{Notification, Observers, Subscription, SubscriptionId};
use crate::remote::session::{RemoteGameState, RemoteSession, SessionEvent};
use crate::time_control::{PerSide, TimeControl};

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How often local clocks are checked for forfeits and reported.
    pub tick: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

enum Input {
    PlayMove {
        uci: String,
        reply: Reply<u32>,
    },
    MoveAcknowledged {
        sequence: u32,
        uci: String,
        result: Result<(), SessionError>,
        reply: Reply<u32>,
    },
    Resign {
        reply: Reply<()>,
    },
    OfferDraw {
        reply: Reply<()>,
    },
    RespondToDraw {
        accept: bool,
        reply: Reply<()>,
    },
    SendChat {
        text: String,
        reply: Reply<()>,
    },
    Abort {
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<GameSnapshot>,
    },
    Subscribe {
        reply: Reply<Subscription>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Remote(SessionEvent),
    Tick,
    Shutdown,
}

/// Cloneable entry point for local intents. Every call is queued behind the
/// inputs already admitted.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Input>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, input: impl FnOnce(Reply<T>) -> Input) -> Result<T, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(input(reply))
            .map_err(|_| CoordinatorError::Closed)?;
        response.await.map_err(|_| CoordinatorError::Closed)?
    }

    /// Play a move in coordinate notation. In a remote game the move only
    /// counts once the server acknowledged it. Returns its sequence number.
    pub async fn play_move(&self, uci: &str) -> Result<u32, CoordinatorError> {
        let uci = uci.trim().to_string();
        self.request(|reply| Input::PlayMove { uci, reply }).await
    }

    pub async fn resign(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Input::Resign { reply }).await
    }

    pub async fn offer_draw(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Input::OfferDraw { reply }).await
    }

    pub async fn respond_to_draw(&self, accept: bool) -> Result<(), CoordinatorError> {
        self.request(|reply| Input::RespondToDraw { accept, reply })
            .await
    }

    pub async fn send_chat(&self, text: &str) -> Result<(), CoordinatorError> {
        let text = text.to_string();
        self.request(|reply| Input::SendChat { text, reply }).await
    }

    pub async fn abort(&self) -> Result<(), CoordinatorError> {
        self.request(|reply| Input::Abort { reply }).await
    }

    pub async fn snapshot(&self) -> Result<GameSnapshot, CoordinatorError> {
        self.request(|reply| Input::Snapshot { reply }).await
    }

    pub async fn subscribe(&self) -> Result<Subscription, CoordinatorError> {
        self.request(|reply| Input::Subscribe { reply }).await
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.tx.send(Input::Unsubscribe { id });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Input::Shutdown);
    }
}

enum Mode {
    Local {
        /// Side that offered a draw in a hot-seat game. The offer stands
        /// through the offering side's next move and lapses once the
        /// opponent moves instead of answering.
        draw_offer: Option<Side>,
    },
    Remote {
        session: RemoteSession,
        events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
        started: bool,
        failed: bool,
        draw_flags: PerSide<bool>,
    },
}

struct InFlight {
    sequence: u32,
    uci: String,
}

pub struct GameCoordinator {
    game: GameState,
    clocks: TimeControl,
    info: GameInfo,
    mode: Mode,
    in_flight: Option<InFlight>,
    finished: bool,
    observers: Observers,
    inputs: mpsc::UnboundedReceiver<Input>,
    sender: mpsc::WeakUnboundedSender<Input>,
    tasks: Vec<JoinHandle<()>>,
    config: CoordinatorConfig,
}

impl GameCoordinator {
    /// A game where both sides are played through the handle.
    pub fn local(
        game: GameState,
        clocks: TimeControl,
        info: GameInfo,
        config: CoordinatorConfig,
    ) -> (Self, CoordinatorHandle) {
        Self::build(game, clocks, info, Mode::Local { draw_offer: None }, config)
    }

    /// A game mirrored from a server. Board and clocks are set up from the
    /// first game snapshot the session delivers.
    pub fn remote(
        session: RemoteSession,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        config: CoordinatorConfig,
    ) -> (Self, CoordinatorHandle) {
        let info = GameInfo {
            game_id: session.active_game(),
            ..GameInfo::default()
        };
        let mode = Mode::Remote {
            session,
            events: Some(events),
            started: false,
            failed: false,
            draw_flags: PerSide::default(),
        };
        Self::build(GameState::new(info.variant), TimeControl::unlimited(), info, mode, config)
    }

    fn build(
        game: GameState,
        clocks: TimeControl,
        info: GameInfo,
        mode: Mode,
        config: CoordinatorConfig,
    ) -> (Self, CoordinatorHandle) {
        let (tx, inputs) = mpsc::unbounded_channel();
        let coordinator = Self {
            game,
            clocks,
            info,
            mode,
            in_flight: None,
            finished: false,
            observers: Observers::new(),
            inputs,
            sender: tx.downgrade(),
            tasks: Vec::new(),
            config,
        };
        (coordinator, CoordinatorHandle { tx })
    }

    /// Register an observer before the loop starts, so nothing is missed.
    pub fn subscribe(&mut self) -> Subscription {
        self.observers.subscribe()
    }

    /// Process inputs until shutdown or until every handle is dropped.
    /// Returns the final game for persistence.
    pub async fn run(mut self) -> GameState {
        self.spawn_helpers();
        if let Mode::Local { .. } = self.mode {
            self.start_local();
        }

        while let Some(input) = self.inputs.recv().await {
            if let Input::Shutdown = input {
                tracing::info!("coordinator shutdown requested");
                break;
            }
            self.handle(input);
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Mode::Remote { session, .. } = &self.mode {
            session.close();
        }
        self.game
    }

    fn spawn_helpers(&mut self) {
        match &mut self.mode {
            Mode::Remote { events, .. } => {
                if let Some(mut events) = events.take() {
                    let sender = self.sender.clone();
                    self.tasks.push(tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            let Some(tx) = sender.upgrade() else {
                                break;
                            };
                            if tx.send(Input::Remote(event)).is_err() {
                                break;
                            }
                        }
                    }));
                }
            }
            Mode::Local { .. } if self.clocks.is_enabled() => {
                let sender = self.sender.clone();
                let period = self.config.tick;
                self.tasks.push(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                        let Some(tx) = sender.upgrade() else {
                            break;
                        };
                        if tx.send(Input::Tick).is_err() {
                            break;
                        }
                    }
                }));
            }
            Mode::Local { .. } => {}
        }
    }

    fn start_local(&mut self) {
        if let Err(err) = self.clocks.start_game(self.game.side_to_move()) {
            tracing::warn!(error = %err, "clock already started");
        }
        tracing::info!(fen = %self.game.fen(), "local game started");
        self.observers
            .notify(Notification::GameStarted(self.info.clone()));
        if let Some(outcome) = self.game.outcome() {
            self.finish(outcome);
        }
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::PlayMove { uci, reply } => self.on_play_move(uci, reply),
            Input::MoveAcknowledged {
                sequence,
                uci,
                result,
                reply,
            } => self.on_move_acknowledged(sequence, uci, result, reply),
            Input::Resign { reply } => self.on_resign(reply),
            Input::OfferDraw { reply } => self.on_offer_draw(reply),
            Input::RespondToDraw { accept, reply } => self.on_respond_to_draw(accept, reply),
            Input::SendChat { text, reply } => match &self.mode {
                Mode::Remote { session, .. } => {
                    self.spawn_command(reply, session.clone(), move |session| async move {
                        session.send_chat(&text).await
                    })
                }
                Mode::Local { .. } => {
                    let _ = reply.send(Err(SessionError::NotConnected.into()));
                }
            },
            Input::Abort { reply } => self.on_abort(reply),
            Input::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            Input::Subscribe { reply } => {
                let _ = reply.send(Ok(self.observers.subscribe()));
            }
            Input::Unsubscribe { id } => {
                self.observers.unsubscribe(id);
            }
            Input::Remote(event) => self.on_remote(event),
            Input::Tick => self.on_tick(),
            Input::Shutdown => {}
        }
    }

    fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            game_id: self.info.game_id.clone(),
            variant: self.game.variant(),
            start_fen: self.game.start_fen(),
            current_fen: self.game.fen(),
            moves: self.game.uci_moves(),
            sequence: self.game.ply(),
            side_to_move: self.game.side_to_move(),
            clocks: self.clocks.snapshot(),
            outcome: self.game.outcome(),
        }
    }

    fn ensure_playing(&mut self) -> Result<(), CoordinatorError> {
        if let Mode::Local { .. } = self.mode {
            self.check_forfeit();
        }
        if self.finished || self.game.is_over() {
            return Err(GameError::GameOver.into());
        }
        match &self.mode {
            Mode::Remote { started: false, .. } => Err(CoordinatorError::NotStarted),
            Mode::Remote { failed: true, .. } => Err(SessionError::NotConnected.into()),
            _ => Ok(()),
        }
    }

    fn on_play_move(&mut self, uci: String, reply: Reply<u32>) {
        if let Err(err) = self.ensure_playing() {
            let _ = reply.send(Err(err));
            return;
        }

        let session = match &self.mode {
            Mode::Local { .. } => {
                let result = self.apply_local(&uci);
                let _ = reply.send(result);
                return;
            }
            Mode::Remote { session, .. } => session.clone(),
        };

        if self.info.user_side != Some(self.game.side_to_move()) {
            let _ = reply.send(Err(CoordinatorError::NotYourTurn));
            return;
        }
        if self.in_flight.is_some() {
            let _ = reply.send(Err(CoordinatorError::MoveInFlight));
            return;
        }
        let checked = self
            .game
            .parse_move(&uci)
            .and_then(|mv| self.game.fork_for_preview(&mv));
        if let Err(err) = checked {
            let _ = reply.send(Err(err.into()));
            return;
        }

        let sequence = self.game.ply() + 1;
        tracing::debug!(sequence, uci = %uci, "sending move");
        self.in_flight = Some(InFlight {
            sequence,
            uci: uci.clone(),
        });
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = session.make_move(&uci, false).await;
            if let Some(tx) = sender.upgrade() {
                let _ = tx.send(Input::MoveAcknowledged {
                    sequence,
                    uci,
                    result,
                    reply,
                });
            }
        });
    }

    fn apply_local(&mut self, uci: &str) -> Result<u32, CoordinatorError> {
        let played = self.game.play_uci(uci)?;
        if let Err(err) = self.clocks.record_move(played.mover) {
            tracing::warn!(error = %err, "clock rejected move");
        }
        if let Mode::Local { draw_offer } = &mut self.mode {
            if *draw_offer != Some(played.mover) {
                *draw_offer = None;
            }
        }
        let sequence = played.sequence;
        self.announce(played);
        Ok(sequence)
    }

    fn on_move_acknowledged(
        &mut self,
        sequence: u32,
        uci: String,
        result: Result<(), SessionError>,
        reply: Reply<u32>,
    ) {
        self.in_flight = None;
        if let Err(err) = result {
            tracing::warn!(sequence, uci = %uci, error = %err, "move not accepted by the server");
            let _ = reply.send(Err(err.into()));
            return;
        }

        let applied = self.game.ply();
        let result = if applied >= sequence {
            // The stream delivered the move before the acknowledgement.
            match self.game.uci_at(sequence) {
                Some(recorded) if recorded == uci => Ok(sequence),
                _ => Err(CoordinatorError::Desync { ply: sequence }),
            }
        } else if applied + 1 == sequence {
            self.apply_sequenced(sequence, &uci)
                .map(|()| sequence)
        } else {
            Err(CoordinatorError::Desync { ply: applied })
        };
        let _ = reply.send(result);
    }

    /// Apply the move with the given 1-based sequence number. Anything but the
    /// next expected number is rejected.
    fn apply_sequenced(&mut self, sequence: u32, uci: &str) -> Result<(), CoordinatorError> {
        let expected = self.game.ply() + 1;
        if sequence != expected {
            return Err(CoordinatorError::Desync { ply: expected });
        }
        let played = self.game.play_uci(uci)?;
        self.announce(played);
        Ok(())
    }

    fn announce(&mut self, played: PlayedMove) {
        tracing::debug!(sequence = played.sequence, uci = %played.uci, "move applied");
        let check = played.check;
        let outcome = played.outcome;
        self.observers.notify(Notification::MoveApplied {
            uci: played.uci,
            san: played.san,
            mover: played.mover,
            sequence: played.sequence,
        });
        if let Some(side) = check {
            self.observers.notify(Notification::Check { side });
        }
        if let Some(outcome) = outcome {
            self.finish(outcome);
        }
    }

    /// Freeze clocks and flag the game once. Later terminal signals are
    /// dropped.
    fn finish(&mut self, outcome: GameOutcome) {
        if self.finished {
            tracing::debug!(%outcome, "ignoring repeated terminal signal");
            return;
        }
        self.finished = true;
        let outcome = if self.game.force_terminal(outcome) {
            outcome
        } else {
            self.game.outcome().unwrap_or(outcome)
        };
        self.clocks.stop();
        tracing::info!(game_id = ?self.info.game_id, %outcome, "game over");
        self.observers.notify(Notification::GameOver(outcome));
    }

    /// The local side a resignation or draw offer is made for.
    fn local_side(&self) -> Side {
        self.info.user_side.unwrap_or(self.game.side_to_move())
    }

    fn on_resign(&mut self, reply: Reply<()>) {
        if let Err(err) = self.ensure_playing() {
            let _ = reply.send(Err(err));
            return;
        }
        match &self.mode {
            Mode::Remote { session, .. } => {
                self.spawn_command(reply, session.clone(), |session| async move {
                    session.resign().await
                })
            }
            Mode::Local { .. } => {
                let loser = self.local_side();
                self.finish(GameOutcome::decisive(loser.opponent(), Termination::Resignation));
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn on_offer_draw(&mut self, reply: Reply<()>) {
        if let Err(err) = self.ensure_playing() {
            let _ = reply.send(Err(err));
            return;
        }
        let by = self.local_side();
        match &mut self.mode {
            Mode::Remote { session, .. } => {
                let session = session.clone();
                self.spawn_command(reply, session, |session| async move {
                    session.offer_draw().await
                })
            }
            Mode::Local { draw_offer } => {
                *draw_offer = Some(by);
                self.observers.notify(Notification::DrawOffered { by });
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn on_respond_to_draw(&mut self, accept: bool, reply: Reply<()>) {
        if let Err(err) = self.ensure_playing() {
            let _ = reply.send(Err(err));
            return;
        }
        match &mut self.mode {
            Mode::Remote { session, .. } => {
                let session = session.clone();
                self.spawn_command(reply, session, move |session| async move {
                    session.respond_to_draw(accept).await
                })
            }
            Mode::Local { draw_offer } => {
                // Only the side to move can answer, and never its own offer.
                let to_move = self.game.side_to_move();
                match *draw_offer {
                    Some(by) if by != to_move => {
                        *draw_offer = None;
                        if accept {
                            self.finish(GameOutcome::drawn(Termination::Draw));
                        }
                        let _ = reply.send(Ok(()));
                    }
                    _ => {
                        let _ = reply.send(Err(CoordinatorError::NoDrawOffer));
                    }
                }
            }
        }
    }

    fn on_abort(&mut self, reply: Reply<()>) {
        if let Err(err) = self.ensure_playing() {
            let _ = reply.send(Err(err));
            return;
        }
        match &self.mode {
            Mode::Remote { session, .. } => {
                self.spawn_command(reply, session.clone(), |session| async move {
                    session.abort().await
                })
            }
            Mode::Local { .. } => {
                self.finish(GameOutcome::drawn(Termination::Aborted));
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Run a session command off the loop and answer the caller when it
    /// completes. Effects on the game arrive later through the stream.
    fn spawn_command<F, Fut>(&self, reply: Reply<()>, session: RemoteSession, command: F)
    where
        F: FnOnce(RemoteSession) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        tokio::spawn(async move {
            let result = command(session).await.map_err(CoordinatorError::from);
            let _ = reply.send(result);
        });
    }

    fn check_forfeit(&mut self) {
        if self.finished {
            return;
        }
        if let Some(side) = self.clocks.forfeited_side() {
            tracing::info!(%side, "flag fell");
            self.finish(GameOutcome::decisive(side.opponent(), Termination::Timeout));
        }
    }

    fn on_tick(&mut self) {
        if self.finished {
            return;
        }
        self.check_forfeit();
        if self.finished {
            return;
        }
        if let (Some(side), Some(remaining)) = (self.clocks.running_side(), self.clocks.remaining()) {
            self.observers.notify(Notification::ClockTick {
                side,
                remaining: *remaining.get(side),
            });
        }
    }

    fn on_remote(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::GameFull { info, clock, state } => {
                let Mode::Remote { started, .. } = &mut self.mode else {
                    return;
                };
                if *started {
                    tracing::debug!("game snapshot received again");
                } else {
                    *started = true;
                    self.begin_remote(info, clock);
                }
                self.apply_remote_state(state);
            }
            SessionEvent::GameState(state) => {
                if let Mode::Remote { started: false, .. } = self.mode {
                    tracing::warn!("game state before game snapshot, ignoring");
                    return;
                }
                self.apply_remote_state(state);
            }
            SessionEvent::ChatLine { username, text } => {
                self.observers
                    .notify(Notification::ChatReceived { from: username, text });
            }
            SessionEvent::GameFinished { game_id } => {
                tracing::debug!(game_id = %game_id, "server reports game finished");
            }
            SessionEvent::Fatal(err) => {
                if let Mode::Remote { failed, .. } = &mut self.mode {
                    *failed = true;
                }
                tracing::error!(error = %err, "session failed");
                self.observers
                    .notify(Notification::ConnectionError(err.kind()));
            }
        }
    }

    fn begin_remote(&mut self, info: GameInfo, clock: Option<(Duration, Duration)>) {
        let game = match info.initial_fen.as_deref() {
            Some(fen) => GameState::from_fen(info.variant, fen),
            None => Ok(GameState::new(info.variant)),
        };
        match game {
            Ok(game) => self.game = game,
            Err(err) => tracing::error!(error = %err, "cannot set up starting position"),
        }
        self.clocks = match clock {
            Some((base, increment)) => TimeControl::new(base, increment),
            None => TimeControl::unlimited(),
        };
        tracing::info!(game_id = ?info.game_id, user_side = ?info.user_side, "remote game started");
        self.info = info.clone();
        self.observers.notify(Notification::GameStarted(info));
    }

    fn apply_remote_state(&mut self, state: RemoteGameState) {
        self.apply_remote_moves(&state.moves);

        let running = (state.is_ongoing() && state.moves.len() >= 2 && !self.finished)
            .then(|| self.game.side_to_move());
        if self.clocks.is_enabled() && !self.clocks.is_stopped() {
            self.clocks
                .sync_remote(state.white_time, state.black_time, running);
            for (side, remaining) in [(Side::White, state.white_time), (Side::Black, state.black_time)] {
                self.observers
                    .notify(Notification::ClockTick { side, remaining });
            }
        }

        let user_side = self.info.user_side;
        let mut offered = Vec::new();
        if let Mode::Remote { draw_flags, .. } = &mut self.mode {
            for side in Side::ALL {
                let now = state.offers_draw(side);
                if now && !*draw_flags.get(side) && user_side != Some(side) {
                    offered.push(side);
                }
                *draw_flags.get_mut(side) = now;
            }
        }
        for by in offered {
            self.observers.notify(Notification::DrawOffered { by });
        }

        if let Some(termination) = state.status.termination() {
            let outcome = match state.winner {
                Some(winner) => GameOutcome::decisive(winner, termination),
                None => GameOutcome::drawn(termination),
            };
            self.finish(outcome);
        }
    }

    /// Bring local history in line with the server's full move list. Moves
    /// already recorded are skipped, a strict prefix of local history is
    /// stale and a differing move triggers a rebuild.
    fn apply_remote_moves(&mut self, moves: &[String]) {
        let applied = self.game.ply() as usize;
        let diverged = moves
            .iter()
            .take(applied)
            .enumerate()
            .any(|(index, uci)| self.game.uci_at(index as u32 + 1) != Some(uci.as_str()));
        if diverged {
            self.resynchronize(moves);
            return;
        }
        if moves.len() < applied {
            // Report sent before our acknowledged move reached the server.
            tracing::debug!(local_ply = applied, remote_ply = moves.len(), "stale server move list");
            return;
        }

        for (index, uci) in moves.iter().enumerate().skip(applied) {
            let sequence = index as u32 + 1;
            if let Err(err) = self.apply_sequenced(sequence, uci) {
                tracing::warn!(sequence, uci = %uci, error = %err, "cannot apply server move");
                self.resynchronize(moves);
                return;
            }
        }
    }

    fn resynchronize(&mut self, moves: &[String]) {
        tracing::warn!(
            local_ply = self.game.ply(),
            remote_ply = moves.len(),
            "local history diverged from the server, rebuilding"
        );
        match GameState::from_uci_moves(self.game.variant(), self.info.initial_fen.as_deref(), moves) {
            Ok(game) => {
                self.game = game;
                self.observers.notify(Notification::Resynchronized {
                    ply: self.game.ply(),
                });
                if let Some(outcome) = self.game.outcome() {
                    self.finish(outcome);
                }
            }
            Err(err) => tracing::error!(error = %err, "server move list is not playable"),
        }
    }
}
