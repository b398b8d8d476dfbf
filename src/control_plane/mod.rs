//! Control plane REST client.
//!
//! Every remote object (a worker record, a machine record, a pending command)
//! is a [`RestResource`] bound to a URL and sharing one authenticated
//! [`Session`]. Requests that fail with an invalid/expired token are retried
//! exactly once after re-authenticating; any other unexpected status code is
//! returned to the caller as [`ControlPlaneError::UnexpectedStatus`].
//!
//! - [`Session`]: HTTP client, API key and the current access token
//! - [`RestResource`]: get/put/patch against a stored location
//! - [`WorkerResource`]: typed worker record with a cached status
//! - [`MachineResource`]: this machine's record, looked up or created once

pub mod machine;
pub mod resource;
pub mod session;
pub mod worker;

pub use machine::{MachineInfo, MachineResource};
pub use resource::RestResource;
pub use session::{Role, Session};
pub use worker::{NewWorker, PendingCommand, RemoteStatus, WorkerRecord, WorkerResource};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Can't {method} to {url}, status={status}, text={body}")]
    UnexpectedStatus {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed with status {status}: {body}")]
    AuthRejected { status: u16, body: String },

    #[error("Response from {url} has no Location header")]
    MissingLocation { url: String },

    #[error("Cannot decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl ControlPlaneError {
    /// Status code of an unexpected response, if that is what this error is.
    pub fn status(&self) -> Option<u16> {
        match self {
            ControlPlaneError::UnexpectedStatus { status, .. }
            | ControlPlaneError::AuthRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
