pub mod cleanup;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod process;
pub mod session;
pub mod util;

pub use error::{Error, Result};
pub use orchestration::{RunOutcome, RunReport, Scheduler};
pub use session::{Session, SessionId, SessionManager, SessionStatus};
