pub mod session_controller;
pub mod session_machine;

pub use session_controller::{
    Navigator, NoopNavigator, SendOutcome, SessionController, SessionUpdate,
};
pub use session_machine::{SessionPhase, SessionState, StreamStatus};
