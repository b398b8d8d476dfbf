//! The worker supervisor loop.
//!
//! One [`Supervisor`] keeps the configured number of worker processes
//! running for a single (reference, tenant) pair on this machine. Every
//! tick it:
//!
//! 1. Re-reads the desired capacity and kills excess workers
//! 2. Spawns workers up to the desired capacity
//! 3. Reconciles workers whose process is gone
//! 4. Reloads the build index and stops if the build changed
//! 5. Drains worker output, promoting workers that print the ready marker
//! 6. Stops if a worker is still starting past the start timeout
//! 7. Every few ticks, polls started workers for commands and heartbeats
//!
//! Fatal conditions end the loop with a [`ShutdownReason`]. Shutdown marks
//! every remote record `killed`, then kills every tracked and stray process.
//! Recovery is left to whatever restarts the daemon.
//!
//! Cancellation is only observed between scale actions and during pauses,
//! so a worker is never half spawned or half killed when shutdown starts.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::builds::{BuildChange, BuildIndex, BuildManifest, BuildWatch};
use crate::capacity::CapacitySource;
use crate::config::{DaemonConfig, SupervisorPolicy};
use crate::control_plane::worker::status_reason;
use crate::control_plane::{
    MachineInfo, MachineResource, NewWorker, RemoteStatus, Role, Session, WorkerResource,
};
use crate::error::{DaemonError, Result};
use crate::events::{EventLog, Severity};
use crate::process::{kill_workers, PortAllocator, ProcessProbe};
use crate::worker::launch::worker_log_path;
use crate::worker::{HeartbeatCheck, LaunchPlan, OutputEvent, WorkerInstance, WorkerStatus};

/// Upper bound on output drain rounds per tick, so a chatty worker cannot
/// keep the loop from polling.
const MAX_DRAIN_ROUNDS: usize = 64;

/// Why the supervisor loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A worker never printed the ready marker in time
    StartTimeout { pid: u32, waited: Duration },
    /// The build index points at a different manifest
    BuildChanged(BuildChange),
    /// The control plane queued a `kill` command
    KillCommand { pid: u32 },
    /// SIGINT / SIGTERM
    Interrupted,
    /// An error escaped a tick
    Fatal(String),
}

impl ShutdownReason {
    /// Process exit code for this reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::StartTimeout { .. } => -1,
            _ => 1,
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::StartTimeout { pid, waited } => write!(
                f,
                "Server {} still hasn't started after {:.0} seconds",
                pid,
                waited.as_secs_f64()
            ),
            ShutdownReason::BuildChanged(_) => write!(f, "New build is available"),
            ShutdownReason::KillCommand { .. } => write!(f, "Received command to kill all"),
            ShutdownReason::Interrupted => write!(f, "User exit"),
            ShutdownReason::Fatal(e) => {
                write!(f, "Fatal error, '{}' occurred in supervisor loop", e)
            }
        }
    }
}

/// Index of the worker to kill when scaling down: the first one whose remote
/// status is not `running`, otherwise the first one.
pub fn pick_scale_down_victim(statuses: &[RemoteStatus]) -> Option<usize> {
    if statuses.is_empty() {
        return None;
    }
    Some(
        statuses
            .iter()
            .position(|s| *s != RemoteStatus::Running)
            .unwrap_or(0),
    )
}

/// Keeps N workers running for one (reference, tenant).
pub struct Supervisor {
    reference: String,
    tenant: String,
    config: DaemonConfig,
    policy: SupervisorPolicy,
    session: Arc<Session>,
    capacity: Box<dyn CapacitySource>,
    events: EventLog,
    probe: ProcessProbe,
    ports: PortAllocator,
    heartbeat: HeartbeatCheck,
    index: BuildIndex,
    watch: BuildWatch,
    manifest: BuildManifest,
    machine: Option<MachineResource>,
    instances: Vec<WorkerInstance>,
    desired: usize,
    loop_started: Instant,
    ticks: u64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("reference", &self.reference)
            .field("tenant", &self.tenant)
            .field("desired", &self.desired)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Prepare a supervisor and kill any workers left over from a previous run.
    pub async fn new(
        reference: &str,
        tenant: &str,
        config: DaemonConfig,
        policy: SupervisorPolicy,
        session: Arc<Session>,
        capacity: Box<dyn CapacitySource>,
        events: EventLog,
    ) -> Result<Self> {
        let index = BuildIndex::load(&config.index_dir, &config.target_platform)?;
        let manifest = index.manifest(reference).await?;
        let watch = BuildWatch::new(reference, &index);
        let desired = capacity.desired(reference, tenant)?;

        let mut probe = ProcessProbe::new();
        kill_workers(&mut probe, &manifest, tenant, policy.terminate_wait, &events).await;

        tracing::info!(
            reference,
            tenant,
            processes = desired,
            build = %manifest.build,
            "Supervisor starting"
        );

        Ok(Self {
            reference: reference.to_string(),
            tenant: tenant.to_string(),
            ports: PortAllocator::new(policy.port_range.clone()),
            heartbeat: HeartbeatCheck::new(policy.heartbeat_timeout),
            config,
            policy,
            session,
            capacity,
            events,
            probe,
            index,
            watch,
            manifest,
            machine: None,
            instances: Vec::new(),
            desired,
            loop_started: Instant::now(),
            ticks: 0,
            cancel: CancellationToken::new(),
        })
    }

    pub fn instances(&self) -> &[WorkerInstance] {
        &self.instances
    }

    /// Desired capacity as of the last read.
    pub fn desired(&self) -> usize {
        self.desired
    }

    /// Run until a fatal condition or cancellation, then shut everything down.
    pub async fn run(&mut self, cancel: CancellationToken) -> ShutdownReason {
        let span = tracing::info_span!("supervisor", reference = %self.reference, tenant = %self.tenant);
        self.run_loop(cancel).instrument(span).await
    }

    async fn run_loop(&mut self, cancel: CancellationToken) -> ShutdownReason {
        self.cancel = cancel;
        self.loop_started = Instant::now();

        let reason = loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Supervisor interrupted");
                break ShutdownReason::Interrupted;
            }

            match self.tick().await {
                Ok(Some(reason)) => break reason,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Fatal error in supervisor loop");
                    self.events.record_with(
                        "exception",
                        e.to_string(),
                        json!({"source": "supervisor"}),
                        Severity::Error,
                        None,
                    );
                    break ShutdownReason::Fatal(e.to_string());
                }
            }
        };

        if let Err(e) = self.shutdown(&reason).await {
            tracing::error!(error = %e, "Shutdown did not complete cleanly");
        }
        reason
    }

    /// Sleep for `duration`, returning early on cancellation.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self) -> Result<Option<ShutdownReason>> {
        self.ticks += 1;

        let desired = self.capacity.desired(&self.reference, &self.tenant)?;
        if desired != self.desired {
            let text = format!(
                "Number of processes for ref '{}' has changed from {} to {}",
                self.reference, self.desired, desired
            );
            tracing::warn!(from = self.desired, to = desired, "Desired capacity changed");
            self.events.record("num_processes_changed", text, Severity::Info);
            self.desired = desired;
        }

        self.scale_down().await?;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        if self.desired == 0 {
            if let Some(reason) = self.check_build()? {
                return Ok(Some(reason));
            }
            tracing::info!("Running zero processes");
            self.pause(self.policy.zero_capacity_sleep).await;
            return Ok(None);
        }

        self.scale_up().await?;
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        self.reap_dead().await?;

        if let Some(reason) = self.check_build()? {
            return Ok(Some(reason));
        }

        self.drain_output().await?;
        self.promote_ready();

        if let Some(reason) = self.check_start_timeout() {
            return Ok(Some(reason));
        }

        if self.ticks % self.policy.poll_every_ticks.max(1) == 0 {
            if let Some(reason) = self.poll_remote().await? {
                return Ok(Some(reason));
            }
        }

        Ok(None)
    }

    async fn scale_down(&mut self) -> Result<()> {
        if self.instances.len() <= self.desired {
            return Ok(());
        }

        let mut killed = Vec::new();
        while self.instances.len() > self.desired && !self.cancel.is_cancelled() {
            tracing::info!(
                running = self.instances.len(),
                desired = self.desired,
                "Too many workers, killing one"
            );

            let mut statuses = Vec::with_capacity(self.instances.len());
            for instance in &mut self.instances {
                statuses.push(instance.remote_mut().status().await?);
            }
            let Some(victim) = pick_scale_down_victim(&statuses) else {
                break;
            };
            if statuses[victim] == RemoteStatus::Running {
                tracing::warn!("No worker outside 'running' to kill, killing a running one");
            }

            killed.push(self.kill_instance(victim, "scaling down").await?);
            self.pause(self.policy.settle_delay).await;
        }

        let pids: Vec<String> = killed.iter().map(u32::to_string).collect();
        self.events.record(
            "servers_killed",
            format!(
                "Done killing servers for ref '{}'. Killed servers {} and am now running {} servers",
                self.reference,
                pids.join(", "),
                self.instances.len()
            ),
            Severity::Info,
        );
        Ok(())
    }

    async fn scale_up(&mut self) -> Result<()> {
        if self.instances.len() >= self.desired {
            return Ok(());
        }

        let mut added = 0;
        while self.instances.len() < self.desired && !self.cancel.is_cancelled() {
            tracing::info!(
                running = self.instances.len(),
                desired = self.desired,
                "Too few workers, adding one"
            );
            let instance = self.spawn_worker().await?;
            self.instances.push(instance);
            added += 1;
            self.pause(self.policy.settle_delay).await;
        }

        let pids: Vec<String> = self.instances.iter().map(|i| i.pid().to_string()).collect();
        tracing::info!(instances = %pids.join(","), "Done adding workers");
        self.events.record(
            "servers_added",
            format!(
                "Done adding servers for ref '{}'. Added {} servers and am now running {} servers",
                self.reference,
                added,
                self.instances.len()
            ),
            Severity::Info,
        );
        Ok(())
    }

    /// Create the remote record, then start the process.
    async fn spawn_worker(&mut self) -> Result<WorkerInstance> {
        let manifest = self.index.manifest(&self.reference).await?;
        let builds_dir = self.config.builds_dir();
        let executable = manifest.executable(&builds_dir);
        if !executable.exists() {
            return Err(DaemonError::BuildNotInstalled(executable));
        }

        let machine = match self.machine.take() {
            Some(machine) => machine,
            None => {
                let info = MachineInfo::local(&self.config.machine);
                MachineResource::get_or_create(self.session.clone(), &info).await?
            }
        };
        let machine_id = machine.machine_id();
        let public_ip = machine.public_ip();
        self.machine = Some(machine);

        let jti = self.session.issue_token(Role::Worker).await?;
        let port = self.ports.allocate()?;

        let mut plan = LaunchPlan {
            executable,
            custom_args: self.config.command_line.clone(),
            public_ip: public_ip.clone(),
            api_url: self.session.root_endpoint().to_string(),
            port,
            tenant: self.tenant.clone(),
            jti,
            ready_marker: self.config.ready_marker.clone(),
            ..Default::default()
        };

        let info = NewWorker {
            status: RemoteStatus::Pending,
            image_name: manifest.build.clone(),
            command_line: plan.base_command().join(" "),
            command_line_custom: plan.custom_command_line(),
            machine_id,
            public_ip,
            port,
        };
        let mut remote = WorkerResource::create(self.session.clone(), &info).await?;

        let server_id = remote
            .record()
            .server_id()
            .unwrap_or_else(|| "unknown".to_string());
        plan.server_url = remote.location().to_string();
        plan.server_token = remote.record().token.clone().unwrap_or_default();
        plan.log_path = worker_log_path(&self.config.worker_logs_dir(), &self.tenant, &server_id);
        remote
            .put(&json!({"status": RemoteStatus::Pending, "command_line": plan.command_line()}))
            .await?;

        let (child, output) = match plan.spawn() {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(error = %e, executable = %plan.executable.display(), "Spawning worker failed");
                if let Err(status_err) = remote
                    .set_status(RemoteStatus::AbnormalExit, json!({"error": e.to_string()}))
                    .await
                {
                    tracing::warn!(error = %status_err, "Could not record spawn failure");
                }
                return Err(DaemonError::Spawn(e));
            }
        };
        let pid = child
            .id()
            .ok_or_else(|| DaemonError::Internal("spawned worker has no pid".to_string()))?;

        remote
            .put(&json!({
                "status": RemoteStatus::Starting,
                "pid": pid,
                "ref": self.reference,
                "build": manifest.build,
                "build_number": manifest.build_number,
                "target_platform": manifest.target_platform,
                "details": {
                    "ref": self.reference,
                    "repository": builds_dir.display().to_string(),
                    "build_path": manifest.build,
                },
            }))
            .await?;

        tracing::info!(pid, port, url = %remote.location(), "Spawned worker");
        Ok(WorkerInstance::new(pid, port, child, output, remote))
    }

    /// Remove the instance at `idx`: mark it killed remotely, then terminate it.
    async fn kill_instance(&mut self, idx: usize, reason: &str) -> Result<u32> {
        let mut instance = self.instances.remove(idx);
        let pid = instance.pid();
        tracing::info!(pid, reason, "Killing worker");

        let outcome = instance
            .remote_mut()
            .set_status(RemoteStatus::Killed, status_reason(reason))
            .await;
        if !instance.terminate(&mut self.probe, self.policy.terminate_wait).await {
            tracing::info!(pid, "Cannot kill worker because it's already dead");
        }
        instance.set_status(WorkerStatus::Killed);
        outcome?;
        Ok(pid)
    }

    /// Retire the instance with `pid` whose process exited on its own.
    async fn retire_exited(&mut self, pid: u32) -> Result<()> {
        let Some(idx) = self.instances.iter().position(|i| i.pid() == pid) else {
            return Ok(());
        };
        let mut instance = self.instances.remove(idx);
        tracing::info!(pid, url = %instance.remote().location(), dropped_lines = instance.dropped_lines(), "Worker has died");

        let remote_status = instance.remote_mut().status().await?;
        if remote_status.is_live() {
            let reason = match instance.status() {
                WorkerStatus::Starting => "failed to start",
                _ => "died prematurely",
            };
            instance
                .remote_mut()
                .set_status(RemoteStatus::AbnormalExit, status_reason(reason))
                .await?;
        }
        instance.set_status(WorkerStatus::AbnormalExit);

        // stdout can close before the process is gone
        instance.terminate(&mut self.probe, self.policy.terminate_wait).await;
        self.pause(self.policy.settle_delay).await;
        tracing::info!(pid, "Worker removed, will be replaced");
        Ok(())
    }

    async fn reap_dead(&mut self) -> Result<()> {
        let dead: Vec<u32> = self
            .instances
            .iter_mut()
            .filter_map(|i| (!i.is_alive()).then(|| i.pid()))
            .collect();
        for pid in dead {
            self.retire_exited(pid).await?;
        }
        Ok(())
    }

    fn check_build(&mut self) -> Result<Option<ShutdownReason>> {
        let fresh = self.index.reload()?;
        if let Some(change) = self.watch.observe(&fresh) {
            tracing::info!(
                previous = ?change.previous,
                current = ?change.current,
                "Build index changed"
            );
            return Ok(Some(ShutdownReason::BuildChanged(change)));
        }
        self.index = fresh;
        Ok(None)
    }

    /// Read worker output until a round produces nothing.
    async fn drain_output(&mut self) -> Result<()> {
        for _ in 0..MAX_DRAIN_ROUNDS {
            if self.instances.is_empty() {
                return Ok(());
            }

            let mut got_output = false;
            let mut exited = Vec::new();
            for instance in &mut self.instances {
                match instance.next_output(self.policy.read_timeout).await {
                    Some(OutputEvent::Line(line)) => {
                        got_output = true;
                        tracing::debug!(pid = instance.pid(), line = %line, "stdout");
                    }
                    Some(OutputEvent::Exited) => {
                        tracing::info!(pid = instance.pid(), "Worker output closed");
                        exited.push(instance.pid());
                    }
                    None => {}
                }
            }

            for pid in &exited {
                self.retire_exited(*pid).await?;
            }
            if !exited.is_empty() {
                return Ok(());
            }
            if !got_output {
                self.pause(self.policy.idle_sleep).await;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Move workers that printed the ready marker from Starting to Started.
    fn promote_ready(&mut self) {
        for instance in &mut self.instances {
            if instance.status() == WorkerStatus::Starting && instance.printed_ready_marker() {
                tracing::info!(pid = instance.pid(), "Worker has started up");
                instance.set_status(WorkerStatus::Started);
            }
        }
    }

    fn start_elapsed(&self, instance: &WorkerInstance) -> Duration {
        self.policy.start_timeout_policy.elapsed(
            self.loop_started,
            instance.spawned_at(),
            Instant::now(),
        )
    }

    fn check_start_timeout(&self) -> Option<ShutdownReason> {
        self.instances
            .iter()
            .filter(|i| i.status() == WorkerStatus::Starting)
            .map(|i| (i.pid(), self.start_elapsed(i)))
            .find(|(_, waited)| *waited > self.policy.start_timeout)
            .map(|(pid, waited)| {
                tracing::error!(pid, waited_secs = waited.as_secs(), "Worker still hasn't started");
                ShutdownReason::StartTimeout { pid, waited }
            })
    }

    /// Handle pending commands, remote start status and heartbeats of started workers.
    async fn poll_remote(&mut self) -> Result<Option<ShutdownReason>> {
        let started: Vec<u32> = self
            .instances
            .iter()
            .filter(|i| i.status() == WorkerStatus::Started)
            .map(WorkerInstance::pid)
            .collect();

        for pid in started {
            let Some(idx) = self.instances.iter().position(|i| i.pid() == pid) else {
                continue;
            };
            let waited = self.start_elapsed(&self.instances[idx]);
            let record = self.instances[idx].remote_mut().refresh().await?.clone();

            for command in &record.pending_commands {
                tracing::warn!(pid, command = %command.command, "Executing remote command");
                self.instances[idx].remote().acknowledge(command).await?;
                if command.is_kill() {
                    tracing::error!(pid, "External command to kill servers");
                    return Ok(Some(ShutdownReason::KillCommand { pid }));
                }
            }

            if record.status == RemoteStatus::Starting && waited > self.policy.start_timeout {
                tracing::error!(pid, status = %record.status, waited_secs = waited.as_secs(), "Worker never reported running");
                self.kill_instance(idx, "failed to reach 'started' status").await?;
                self.pause(self.policy.settle_delay).await;
            } else if self
                .heartbeat
                .is_stale(record.heartbeat_date.as_deref(), Utc::now())
            {
                tracing::error!(pid, heartbeat_date = ?record.heartbeat_date, "Worker heartbeat is stale, the process must be frozen");
                self.kill_instance(idx, "heartbeat timeout").await?;
                self.pause(self.policy.settle_delay).await;
            }
        }
        Ok(None)
    }

    /// Mark every remote record killed, then kill every worker for this reference.
    ///
    /// Best effort: every step runs even if an earlier one failed; the first
    /// error is returned.
    pub async fn shutdown(&mut self, reason: &ShutdownReason) -> Result<()> {
        let message = reason.to_string();
        tracing::warn!(reason = %message, "Shutting down");
        self.events.record_with(
            "shutdown_servers",
            format!("Shutting down all servers because: '{}'", message),
            json!({"reason": message, "exit_code": reason.exit_code()}),
            Severity::Warning,
            None,
        );

        let mut first_error = None;
        for instance in &mut self.instances {
            let pid = instance.pid();
            if let Err(e) = instance
                .remote_mut()
                .set_status(RemoteStatus::Killed, status_reason(&message))
                .await
            {
                tracing::warn!(pid, error = %e, "Could not mark worker killed");
                if first_error.is_none() {
                    first_error = Some(DaemonError::from(e));
                }
            }
        }

        for mut instance in self.instances.drain(..) {
            instance
                .terminate(&mut self.probe, self.policy.terminate_wait)
                .await;
            instance.set_status(WorkerStatus::Killed);
        }
        kill_workers(
            &mut self.probe,
            &self.manifest,
            &self.tenant,
            self.policy.terminate_wait,
            &self.events,
        )
        .await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
