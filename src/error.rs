use std::path::PathBuf;

use thiserror::Error;

use crate::control_plane::ControlPlaneError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Build index has not been synced: {0} is missing")]
    IndexNotSynced(PathBuf),

    #[error("Build not found for ref '{0}'")]
    BuildNotFound(String),

    #[error("Unable to read manifest {path}: {reason}")]
    ManifestUnreadable { path: PathBuf, reason: String },

    #[error("Executable '{0}' not found. Build might not be installed")]
    BuildNotInstalled(PathBuf),

    #[error("Ref '{reference}' for tenant '{tenant}' is not registered on this machine")]
    NotRegistered { reference: String, tenant: String },

    #[error("Exhausted trying to find an available UDP port in the range {min} to {max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
