//! Host process plumbing: inspection, termination and port allocation.

pub mod ports;
pub mod probe;

use std::time::Duration;

use serde_json::json;

use crate::builds::BuildManifest;
use crate::events::{EventContext, EventLog, Severity};

pub use ports::PortAllocator;
pub use probe::{normalize_path, ProcessInfo, ProcessProbe};

/// The argument that scopes a worker process to one tenant.
pub fn tenant_arg(tenant: &str) -> String {
    format!("-tenant={}", tenant)
}

/// Terminate every process running any installed version of `manifest`'s
/// reference for `tenant`, waiting up to `wait` for each.
///
/// Emits a `processes_killed` event when anything was killed.
pub async fn kill_workers(
    probe: &mut ProcessProbe,
    manifest: &BuildManifest,
    tenant: &str,
    wait: Duration,
    events: &EventLog,
) -> Vec<ProcessInfo> {
    let partial = manifest.partial_build_path();
    tracing::info!(reference = %manifest.reference, tenant, partial = %partial, "Killing workers by ref");

    let me = std::process::id();
    let targets: Vec<ProcessInfo> = probe
        .find(&partial, &tenant_arg(tenant))
        .into_iter()
        .filter(|p| p.pid != me)
        .collect();

    let mut killed = Vec::with_capacity(targets.len());
    for target in targets {
        tracing::info!(pid = target.pid, exe = %target.exe, "Killing worker process");
        if probe.terminate(target.pid, wait).await {
            killed.push(target);
        }
    }

    if !killed.is_empty() {
        let ctx = EventContext::default()
            .with_reference(manifest.reference.clone())
            .with_tenant(tenant);
        events.record_with(
            "processes_killed",
            format!("Killed {} processes", killed.len()),
            json!({ "processes": killed }),
            Severity::Warning,
            Some(&ctx),
        );
    }

    tracing::info!(
        reference = %manifest.reference,
        tenant,
        count = killed.len(),
        "Done killing workers"
    );
    killed
}
