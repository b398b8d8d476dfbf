use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{DaemonError, Result};

/// Target platform the supervisor runs builds for.
pub const DEFAULT_TARGET_PLATFORM: &str = "WindowsServer";

/// Line a worker prints on stdout once its engine is up.
pub const DEFAULT_READY_MARKER: &str = "Game Engine Initialized.";

/// Worker UDP port range, scanned linearly.
pub const MIN_PORT: u16 = 7777;
pub const MAX_PORT: u16 = 8000;

/// Login credentials for the control plane auth endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    "user+pass".to_string()
}

/// Where and how to reach the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Root endpoint, e.g. `https://tenant.example.com/api`
    pub root_endpoint: String,
    /// Product API key sent with every request
    pub api_key: String,
    /// Credentials the daemon authenticates with
    pub credentials: Credentials,
    /// Credentials used to mint the token handed to workers.
    /// Falls back to `credentials` when unset.
    pub worker_credentials: Option<Credentials>,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            root_endpoint: "http://127.0.0.1:8080".to_string(),
            api_key: String::new(),
            credentials: Credentials::default(),
            worker_credentials: None,
            request_timeout_secs: 10,
        }
    }
}

impl ControlPlaneConfig {
    pub fn worker_credentials(&self) -> &Credentials {
        self.worker_credentials.as_ref().unwrap_or(&self.credentials)
    }
}

/// Facts about this machine reported to the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub group_name: Option<String>,
    pub public_ip: Option<String>,
}

/// Daemon configuration, loaded from a JSON file.
///
/// Every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Root folder holding installed builds and logs
    pub storage_root: PathBuf,
    /// Folder holding the synced `index.json` and manifest files
    pub index_dir: PathBuf,
    /// Desired-capacity table, re-read every supervisor tick
    pub instances_file: PathBuf,
    /// Custom arguments placed right after the worker executable
    pub command_line: Vec<String>,
    pub target_platform: String,
    pub ready_marker: String,
    pub control_plane: ControlPlaneConfig,
    pub machine: MachineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            index_dir: PathBuf::from("config/index"),
            instances_file: PathBuf::from("config/instances.json"),
            command_line: Vec::new(),
            target_platform: DEFAULT_TARGET_PLATFORM.to_string(),
            ready_marker: DEFAULT_READY_MARKER.to_string(),
            control_plane: ControlPlaneConfig::default(),
            machine: MachineConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load the configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        // Parse through Value first so a non-list command line gets a clear message
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if let Some(cmd) = value.get("command_line") {
            if !cmd.is_array() {
                return Err(DaemonError::Config(
                    "'command_line' must be a list".to_string(),
                ));
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Installed build images live here, one folder per build.
    pub fn builds_dir(&self) -> PathBuf {
        self.storage_root.join("builds")
    }

    /// Worker log files, scoped by tenant.
    pub fn worker_logs_dir(&self) -> PathBuf {
        self.storage_root.join("logs").join("workers")
    }

    /// Daemon logs and the structured event log.
    pub fn daemon_logs_dir(&self) -> PathBuf {
        self.storage_root.join("logs").join("daemon")
    }
}

/// How the start timeout of a `Starting` worker is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartTimeoutPolicy {
    /// Measured from when the supervisor loop started. A worker spawned
    /// late inherits whatever budget is left.
    #[default]
    FromLoopStart,
    /// Measured from when the worker itself was spawned.
    FromSpawn,
}

impl StartTimeoutPolicy {
    /// How long a worker spawned at `spawned_at` has been starting at `now`.
    pub fn elapsed(&self, loop_started: Instant, spawned_at: Instant, now: Instant) -> Duration {
        let since = match self {
            StartTimeoutPolicy::FromLoopStart => loop_started,
            StartTimeoutPolicy::FromSpawn => spawned_at,
        };
        now.saturating_duration_since(since)
    }
}

/// Timeouts and cadences of the supervisor loop.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    pub start_timeout: Duration,
    pub start_timeout_policy: StartTimeoutPolicy,
    pub heartbeat_timeout: Duration,
    /// Pause after every scale action and before respawning an exited worker
    pub settle_delay: Duration,
    /// Per-read timeout when draining a worker's output queue
    pub read_timeout: Duration,
    /// Pause when no worker produced output during a drain round
    pub idle_sleep: Duration,
    /// Pause between capacity polls while the desired capacity is zero
    pub zero_capacity_sleep: Duration,
    /// Remote status and commands are polled every this many ticks
    pub poll_every_ticks: u64,
    /// Bounded wait for a terminated process to go away
    pub terminate_wait: Duration,
    pub port_range: RangeInclusive<u16>,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            start_timeout_policy: StartTimeoutPolicy::default(),
            heartbeat_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(5),
            read_timeout: Duration::from_millis(100),
            idle_sleep: Duration::from_secs(1),
            zero_capacity_sleep: Duration::from_secs(10),
            poll_every_ticks: 10,
            terminate_wait: Duration::from_secs(10),
            port_range: MIN_PORT..=MAX_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_policy_default() {
        let policy = SupervisorPolicy::default();
        assert_eq!(policy.start_timeout, Duration::from_secs(60));
        assert_eq!(policy.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(policy.settle_delay, Duration::from_secs(5));
        assert_eq!(policy.read_timeout, Duration::from_millis(100));
        assert_eq!(policy.poll_every_ticks, 10);
        assert_eq!(policy.start_timeout_policy, StartTimeoutPolicy::FromLoopStart);
        assert_eq!(policy.port_range, 7777..=8000);
    }

    #[test]
    fn start_timeout_measured_from_loop_or_spawn() {
        let loop_started = Instant::now();
        let spawned_at = loop_started + Duration::from_secs(40);
        let now = loop_started + Duration::from_secs(70);

        assert_eq!(
            StartTimeoutPolicy::FromLoopStart.elapsed(loop_started, spawned_at, now),
            Duration::from_secs(70)
        );
        assert_eq!(
            StartTimeoutPolicy::FromSpawn.elapsed(loop_started, spawned_at, now),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn daemon_config_default() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.target_platform, "WindowsServer");
        assert_eq!(cfg.ready_marker, "Game Engine Initialized.");
        assert!(cfg.command_line.is_empty());
        assert_eq!(cfg.builds_dir(), PathBuf::from("storage/builds"));
        assert_eq!(cfg.worker_logs_dir(), PathBuf::from("storage/logs/workers"));
        assert_eq!(cfg.daemon_logs_dir(), PathBuf::from("storage/logs/daemon"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg = DaemonConfig::from_json(
            r#"{
                "storage_root": "/srv/fleet",
                "command_line": ["-log", "-nomcp"],
                "control_plane": {"root_endpoint": "https://acme.example.com/api", "api_key": "k"}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.storage_root, PathBuf::from("/srv/fleet"));
        assert_eq!(cfg.command_line, vec!["-log", "-nomcp"]);
        assert_eq!(cfg.control_plane.root_endpoint, "https://acme.example.com/api");
        assert_eq!(cfg.control_plane.request_timeout_secs, 10);
        assert_eq!(cfg.target_platform, DEFAULT_TARGET_PLATFORM);
    }

    #[test]
    fn command_line_must_be_a_list() {
        let err = DaemonConfig::from_json(r#"{"command_line": "-log -nomcp"}"#).unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
        assert!(err.to_string().contains("must be a list"));
    }

    #[test]
    fn worker_credentials_fall_back_to_daemon_credentials() {
        let mut cfg = ControlPlaneConfig {
            credentials: Credentials {
                username: "daemon".to_string(),
                password: "pw".to_string(),
                provider: default_provider(),
            },
            ..Default::default()
        };
        assert_eq!(cfg.worker_credentials().username, "daemon");

        cfg.worker_credentials = Some(Credentials {
            username: "worker".to_string(),
            password: "pw2".to_string(),
            provider: default_provider(),
        });
        assert_eq!(cfg.worker_credentials().username, "worker");
    }

    #[test]
    fn credentials_provider_defaults() {
        let creds: Credentials =
            serde_json::from_str(r#"{"username": "u", "password": "p"}"#).unwrap();
        assert_eq!(creds.provider, "user+pass");
    }
}
