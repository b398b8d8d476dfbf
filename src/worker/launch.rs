use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use super::instance::OutputQueue;
use super::OUTPUT_QUEUE_CAPACITY;
use crate::process::tenant_arg;

/// Where a worker writes its own log: `<logs>/<tenant>/server_<id>.log`.
pub fn worker_log_path(worker_logs_dir: &Path, tenant: &str, server_id: &str) -> PathBuf {
    worker_logs_dir
        .join(tenant)
        .join(format!("server_{}.log", server_id))
}

/// Everything needed to start one worker process.
///
/// The remote record is created before the process starts, so the record
/// fields (`server_url`, `server_token`, `log_path`) are filled in between
/// [`base_command`](Self::base_command) being reported and
/// [`command`](Self::command) being run.
#[derive(Debug, Clone, Default)]
pub struct LaunchPlan {
    pub executable: PathBuf,
    pub custom_args: Vec<String>,
    pub public_ip: Option<String>,
    pub api_url: String,
    pub server_url: String,
    pub server_token: String,
    pub port: u16,
    pub tenant: String,
    /// Access token handed to the worker for its own API calls
    pub jti: String,
    pub log_path: PathBuf,
    /// Stdout text the worker prints once it is ready to serve
    pub ready_marker: String,
}

impl LaunchPlan {
    /// Executable, custom arguments and public IP; what is known before the
    /// remote record exists.
    pub fn base_command(&self) -> Vec<String> {
        let mut cmd = vec![self.executable.to_string_lossy().into_owned()];
        cmd.extend(self.custom_args.iter().cloned());
        if let Some(ip) = &self.public_ip {
            cmd.push(format!("-publicIP={}", ip));
        }
        cmd
    }

    /// The full command line, executable first.
    pub fn command(&self) -> Vec<String> {
        let mut cmd = self.base_command();
        cmd.extend([
            format!("-api_url={}", self.api_url),
            format!("-server_url={}", self.server_url),
            format!("-token={}", self.server_token),
            "-server".to_string(),
            format!("-port={}", self.port),
            "-FORCELOGFLUSH".to_string(),
            "-unattended".to_string(),
            tenant_arg(&self.tenant),
            format!("-jti={}", self.jti),
            format!("-abslog={}", self.log_path.display()),
            "-CrashForUAT".to_string(),
        ]);
        cmd
    }

    pub fn command_line(&self) -> String {
        self.command().join(" ")
    }

    pub fn custom_command_line(&self) -> String {
        self.custom_args.join(" ")
    }

    /// Start the process with stdout captured and attach its reader task.
    pub fn spawn(&self) -> std::io::Result<(Child, OutputQueue)> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let args = self.command();
        tracing::debug!(command = %args.join(" "), "Spawning worker");

        let mut child = Command::new(&self.executable)
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdout was not captured"))?;
        let output = OutputQueue::attach(stdout, OUTPUT_QUEUE_CAPACITY, self.ready_marker.clone());
        Ok((child, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> LaunchPlan {
        LaunchPlan {
            executable: PathBuf::from("/srv/builds/game.main.41/Server/Game"),
            custom_args: vec!["-log".to_string(), "-nomcp".to_string()],
            public_ip: Some("203.0.113.7".to_string()),
            api_url: "https://acme.example.com/api".to_string(),
            server_url: "https://acme.example.com/api/servers/12".to_string(),
            server_token: "srv-token".to_string(),
            port: 7779,
            tenant: "acme".to_string(),
            jti: "worker-jti".to_string(),
            log_path: worker_log_path(Path::new("/srv/logs/workers"), "acme", "12"),
            ready_marker: "Game Engine Initialized.".to_string(),
        }
    }

    #[test]
    fn base_command_stops_before_record_fields() {
        assert_eq!(
            plan().base_command(),
            vec![
                "/srv/builds/game.main.41/Server/Game",
                "-log",
                "-nomcp",
                "-publicIP=203.0.113.7"
            ]
        );
    }

    #[test]
    fn full_command_line_order() {
        assert_eq!(
            plan().command(),
            vec![
                "/srv/builds/game.main.41/Server/Game",
                "-log",
                "-nomcp",
                "-publicIP=203.0.113.7",
                "-api_url=https://acme.example.com/api",
                "-server_url=https://acme.example.com/api/servers/12",
                "-token=srv-token",
                "-server",
                "-port=7779",
                "-FORCELOGFLUSH",
                "-unattended",
                "-tenant=acme",
                "-jti=worker-jti",
                "-abslog=/srv/logs/workers/acme/server_12.log",
                "-CrashForUAT",
            ]
        );
        assert_eq!(plan().custom_command_line(), "-log -nomcp");
    }

    #[test]
    fn public_ip_is_optional() {
        let plan = LaunchPlan {
            public_ip: None,
            ..plan()
        };
        assert!(!plan.command().iter().any(|a| a.starts_with("-publicIP=")));
    }

    #[tokio::test]
    async fn spawn_missing_executable_fails() {
        let dir = tempfile::tempdir().unwrap();
        let plan = LaunchPlan {
            executable: dir.path().join("missing"),
            log_path: dir.path().join("logs/server_1.log"),
            ..plan()
        };
        let err = plan.spawn().map(|_| ()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
