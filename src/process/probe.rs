use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{
    Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, Signal, System, UpdateKind,
};

/// Poll interval while waiting for a terminated process to go away.
const TERMINATE_POLL: Duration = Duration::from_millis(100);

/// A process as seen by the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Executable path, lower-cased with forward slashes
    pub exe: String,
    pub cmd: Vec<String>,
}

impl ProcessInfo {
    /// True when the executable path (or, for interpreted workers, any
    /// command-line element) contains `path_fragment` and the arguments
    /// contain `required_arg` verbatim.
    pub fn matches(&self, path_fragment: &str, required_arg: &str) -> bool {
        let fragment = normalize_path(path_fragment);
        let path_hit = self.exe.contains(&fragment)
            || self
                .cmd
                .iter()
                .any(|arg| normalize_path(arg).contains(&fragment));
        path_hit && self.cmd.iter().any(|arg| arg == required_arg)
    }
}

/// Lower-cased, forward-slash form used for path comparisons.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

fn lossy<S: AsRef<OsStr>>(s: S) -> String {
    s.as_ref().to_string_lossy().into_owned()
}

/// OS-level process introspection.
pub struct ProcessProbe {
    system: System,
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProbe").finish_non_exhaustive()
    }
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn refresh(&mut self, which: ProcessesToUpdate<'_>) {
        self.system.refresh_processes_specifics(
            which,
            true,
            ProcessRefreshKind::new()
                .with_exe(UpdateKind::OnlyIfNotSet)
                .with_cmd(UpdateKind::OnlyIfNotSet),
        );
    }

    /// Snapshot of every process the probe can inspect.
    ///
    /// Processes whose executable cannot be read (access denied) are skipped.
    pub fn processes(&mut self) -> Vec<ProcessInfo> {
        self.refresh(ProcessesToUpdate::All);
        self.system
            .processes()
            .iter()
            .filter(|(_, p)| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .filter_map(|(pid, p)| {
                let exe = p.exe()?;
                Some(ProcessInfo {
                    pid: pid.as_u32(),
                    name: lossy(p.name()),
                    exe: normalize_path(&exe.to_string_lossy()),
                    cmd: p.cmd().iter().map(lossy).collect(),
                })
            })
            .collect()
    }

    /// Processes matching an executable path fragment and a required argument.
    pub fn find(&mut self, path_fragment: &str, required_arg: &str) -> Vec<ProcessInfo> {
        self.processes()
            .into_iter()
            .filter(|p| p.matches(path_fragment, required_arg))
            .collect()
    }

    /// Processes whose executable (or script, for interpreted workers)
    /// lives under `root`.
    pub fn find_under(&mut self, root: &Path) -> Vec<ProcessInfo> {
        let root = normalize_path(&root.to_string_lossy());
        self.processes()
            .into_iter()
            .filter(|p| {
                p.exe.starts_with(&root)
                    || p.cmd.iter().any(|arg| normalize_path(arg).starts_with(&root))
            })
            .collect()
    }

    /// Whether `pid` refers to a running process. Zombies count as dead.
    pub fn is_alive(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.refresh(ProcessesToUpdate::Some(&[pid]));
        self.system
            .process(pid)
            .map(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    /// Ask `pid` to terminate. Returns false when there is no such process.
    pub fn signal_terminate(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.refresh(ProcessesToUpdate::Some(&[pid]));
        match self.system.process(pid) {
            // Platforms without SIGTERM fall back to a hard kill
            Some(p) => p.kill_with(Signal::Term).unwrap_or_else(|| p.kill()),
            None => false,
        }
    }

    fn force_kill(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.refresh(ProcessesToUpdate::Some(&[pid]));
        self.system.process(pid).map(|p| p.kill()).unwrap_or(false)
    }

    /// Terminate `pid` and wait up to `wait` for it to exit, escalating to a
    /// hard kill afterwards. Returns false when the process was already gone.
    pub async fn terminate(&mut self, pid: u32, wait: Duration) -> bool {
        if !self.signal_terminate(pid) {
            return false;
        }

        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }

        if self.is_alive(pid) {
            tracing::warn!(pid, wait_ms = wait.as_millis() as u64, "Process ignored SIGTERM, killing");
            self.force_kill(pid);
        }
        true
    }
}
