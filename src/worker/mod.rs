//! Locally spawned worker processes.
//!
//! - [`LaunchPlan`]: builds the worker command line and spawns the process
//! - [`WorkerInstance`]: one tracked process, its output queue and remote record
//! - [`HeartbeatCheck`]: staleness test for the heartbeat a worker reports remotely
//!
//! # Output capture
//!
//! Each spawned process gets one detached reader task that forwards stdout
//! lines into a bounded queue owned by its [`WorkerInstance`]. The supervisor
//! is the only consumer. When stdout closes the task pushes
//! [`OutputEvent::Exited`] and ends; it is never joined.

pub mod heartbeat;
pub mod instance;
pub mod launch;

pub use heartbeat::HeartbeatCheck;
pub use instance::WorkerInstance;
pub use launch::LaunchPlan;

use serde::Serialize;

/// Lines buffered per worker before the reader starts dropping them.
pub const OUTPUT_QUEUE_CAPACITY: usize = 1024;

/// Local lifecycle of a worker process.
///
/// `AbnormalExit` and `Killed` are terminal; the instance is then dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Started,
    AbnormalExit,
    Killed,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::AbnormalExit | WorkerStatus::Killed)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Started => write!(f, "started"),
            WorkerStatus::AbnormalExit => write!(f, "abnormalexit"),
            WorkerStatus::Killed => write!(f, "killed"),
        }
    }
}

/// One item read from a worker's output queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Line(String),
    /// The worker's stdout closed
    Exited,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!WorkerStatus::Starting.is_terminal());
        assert!(!WorkerStatus::Started.is_terminal());
        assert!(WorkerStatus::AbnormalExit.is_terminal());
        assert!(WorkerStatus::Killed.is_terminal());
    }

    #[test]
    fn worker_status_display() {
        assert_eq!(WorkerStatus::Started.to_string(), "started");
        assert_eq!(WorkerStatus::AbnormalExit.to_string(), "abnormalexit");
    }
}
