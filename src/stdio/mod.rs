//! Stdio subprocess supervision: one supervised process per C4
//! ([`process`]) multiplexed across sessions by C5 ([`session_manager`]).

pub mod process;
pub mod session_manager;

pub use process::{ProcessState, StdioProcess};
pub use session_manager::StdioSessionManager;
