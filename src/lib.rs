pub mod builds;
pub mod capacity;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod events;
pub mod process;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use error::{DaemonError, Result};
pub use supervisor::{ShutdownReason, Supervisor};
