//! Process probe and stray sweep against real processes.

#![cfg(unix)]


use std::process::{Child, Command, Stdio};
use std::time::Duration;

use fleetd::builds::BuildIndex;
use fleetd::config::ControlPlaneConfig;
use fleetd::events::{EventContext, EventLog};
use fleetd::process::{kill_workers, tenant_arg, ProcessProbe};
use test_harness::{write_script, TestSite, WorkerScript};

fn spawn_worker(site: &TestSite, tenant: &str) -> Child {
    Command::new(site.executable())
        .arg("-server")
        .arg(tenant_arg(tenant))
        .stdout(Stdio::null())
        .spawn()
        .unwrap()
}

/// Let the shell exec so its command line is visible.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn find_matches_build_path_and_tenant() {
    let site = TestSite::new(ControlPlaneConfig::default(), WorkerScript::Ready);
    let mut worker = spawn_worker(&site, &site.tenant);
    settle().await;

    let index = BuildIndex::load(&site.config.index_dir, "LinuxServer").unwrap();
    let manifest = index.manifest(&site.reference).await.unwrap();

    let mut probe = ProcessProbe::new();
    let found = probe.find(&manifest.partial_build_path(), &tenant_arg(&site.tenant));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].pid, worker.id());

    assert!(probe
        .find(&manifest.partial_build_path(), &tenant_arg("someone-else"))
        .is_empty());

    worker.kill().unwrap();
    let _ = worker.wait();
}

#[tokio::test]
async fn sweep_kills_only_the_given_tenant() {
    let site = TestSite::new(ControlPlaneConfig::default(), WorkerScript::Ready);
    let mut mine = spawn_worker(&site, &site.tenant);
    let mut theirs = spawn_worker(&site, &format!("{}x", site.tenant));
    settle().await;

    let index = BuildIndex::load(&site.config.index_dir, "LinuxServer").unwrap();
    let manifest = index.manifest(&site.reference).await.unwrap();
    let events = EventLog::new(&site.config.daemon_logs_dir(), EventContext::new("kill"));

    let mut probe = ProcessProbe::new();
    let killed = kill_workers(
        &mut probe,
        &manifest,
        &site.tenant,
        Duration::from_secs(3),
        &events,
    )
    .await;

    assert_eq!(killed.len(), 1);
    assert_eq!(killed[0].pid, mine.id());
    assert!(!probe.is_alive(mine.id()));
    assert!(probe.is_alive(theirs.id()));

    let recorded = events.read_all().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0]["event"], "processes_killed");
    assert_eq!(recorded[0]["severity"], "WARNING");
    assert_eq!(recorded[0]["tenant"], serde_json::json!(site.tenant));
    assert_eq!(recorded[0]["ref"], serde_json::json!(site.reference));

    theirs.kill().unwrap();
    let _ = theirs.wait();
    let _ = mine.wait();
}

#[tokio::test]
async fn terminate_escalates_when_sigterm_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("stubborn.sh");
    write_script(&script, "#!/bin/sh\ntrap '' TERM\nwhile :; do sleep 1; done\n");
    let mut child = Command::new(&script).stdout(Stdio::null()).spawn().unwrap();
    settle().await;

    let mut probe = ProcessProbe::new();
    assert!(probe.terminate(child.id(), Duration::from_millis(500)).await);

    let status = tokio::task::spawn_blocking(move || child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!status.success());
}

#[tokio::test]
async fn processes_under_builds_dir_are_listed() {
    let site = TestSite::new(ControlPlaneConfig::default(), WorkerScript::Ready);
    let mut worker = spawn_worker(&site, &site.tenant);
    settle().await;

    let mut probe = ProcessProbe::new();
    let listed = probe.find_under(&site.config.builds_dir());
    assert!(listed.iter().any(|p| p.pid == worker.id()));
    assert!(listed.iter().all(|p| p.pid != std::process::id()));

    worker.kill().unwrap();
    let _ = worker.wait();
}
