use std::fmt;

/// Rejections from the state machine of a single clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("clock can only be started once")]
    AlreadyStarted,

    #[error("clock is not ticking")]
    NotTicking,

    #[error("clock is not paused")]
    NotPaused,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("cannot parse move {0:?}")]
    InvalidMove(String),

    #[error("illegal move {0}")]
    IllegalMove(String),

    #[error("invalid fen {fen:?}: {reason}")]
    InvalidFen { fen: String, reason: String },

    #[error("invalid pgn: {0}")]
    InvalidPgn(String),

    #[error("game is already over")]
    GameOver,
}

/// Coarse category of a session failure, distinguishable enough for a user
/// to decide whether retrying makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    Unreachable,
    Authentication,
    Timeout,
    Rejected,
    Offline,
    Cancelled,
    Protocol,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ConnectionErrorKind::Unreachable => "the server could not be reached",
            ConnectionErrorKind::Authentication => "the server rejected the credentials",
            ConnectionErrorKind::Timeout => "the operation timed out",
            ConnectionErrorKind::Rejected => "the challenge was rejected",
            ConnectionErrorKind::Offline => "the challenged user is offline",
            ConnectionErrorKind::Cancelled => "the operation was cancelled",
            ConnectionErrorKind::Protocol => "the server sent an unexpected response",
        };
        f.write_str(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("connection error: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },

    #[error("challenge {challenge_id:?} was rejected")]
    ChallengeRejected { challenge_id: Option<String> },

    #[error("user {username} is offline")]
    ChallengedUserIsOffline { username: String },

    #[error("{operation} timed out")]
    OperationTimeout { operation: String },

    #[error("a seek or challenge is already pending")]
    RequestPending,

    #[error("a game is already in progress")]
    GameInProgress,

    #[error("session is not connected")]
    NotConnected,

    #[error("no active game")]
    NoActiveGame,

    #[error("operation cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn connection(reason: impl Into<String>) -> Self {
        SessionError::Connection {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn connection_from<E>(reason: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SessionError::Connection {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Only transport-level failures are worth another attempt; semantic
    /// answers from the server are final.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SessionError::Connection { .. })
    }

    pub fn kind(&self) -> ConnectionErrorKind {
        match self {
            SessionError::Authentication { .. } => ConnectionErrorKind::Authentication,
            SessionError::Connection { .. }
            | SessionError::RetriesExhausted { .. }
            | SessionError::NotConnected => ConnectionErrorKind::Unreachable,
            SessionError::ChallengeRejected { .. } => ConnectionErrorKind::Rejected,
            SessionError::ChallengedUserIsOffline { .. } => ConnectionErrorKind::Offline,
            SessionError::OperationTimeout { .. } => ConnectionErrorKind::Timeout,
            SessionError::Cancelled => ConnectionErrorKind::Cancelled,
            SessionError::RequestPending
            | SessionError::GameInProgress
            | SessionError::NoActiveGame
            | SessionError::Protocol(_) => ConnectionErrorKind::Protocol,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Game(#[from] GameError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("a move is already awaiting acknowledgement")]
    MoveInFlight,

    #[error("it is not your turn")]
    NotYourTurn,

    #[error("game has not started yet")]
    NotStarted,

    #[error("local history diverged from the server at ply {ply}")]
    Desync { ply: u32 },

    #[error("there is no draw offer to answer")]
    NoDrawOffer,

    #[error("coordinator is closed")]
    Closed,
}
