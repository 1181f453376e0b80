pub mod clock;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod game_state;
pub mod notification;
pub mod remote;
pub mod retry;
pub mod time_control;
pub mod worker;

pub use clock::{Clock, ClockState};
pub use coordinator::{CoordinatorHandle, GameCoordinator};
pub use domain::{GameOutcome, GameSnapshot, GameVariant, Side, Termination};
pub use error::{ClockError, CoordinatorError, GameError, SessionError};
pub use game_state::GameState;
pub use notification::Notification;
pub use remote::session::RemoteSession;
pub use time_control::TimeControl;
