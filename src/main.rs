use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fleetd::builds::BuildIndex;
use fleetd::capacity::InstanceTable;
use fleetd::config::{DaemonConfig, SupervisorPolicy};
use fleetd::control_plane::Session;
use fleetd::events::{EventContext, EventLog, Severity};
use fleetd::process::{kill_workers, ProcessInfo, ProcessProbe};
use fleetd::shutdown::install_shutdown_handler;
use fleetd::{DaemonError, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version)]
#[command(about = "Keeps a fleet of game server workers running on this machine")]
#[command(propagate_version = true)]
struct Args {
    /// Daemon configuration file
    #[arg(long, global = true, default_value = "config/config.json")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Supervise workers for a ref and tenant until a fatal condition
    Run(TargetArgs),

    /// Kill every worker process of a ref and tenant
    Kill(TargetArgs),

    /// List processes running from the builds folder
    Processes {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Print the current build manifest of a ref
    Manifest {
        /// Build reference
        #[arg(long = "ref")]
        reference: String,
    },
}

#[derive(Parser, Debug)]
struct TargetArgs {
    /// Build reference
    #[arg(long = "ref")]
    reference: String,

    /// Tenant the workers serve
    #[arg(long, default_value = "default")]
    tenant: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct ProcessListOutput {
    processes: Vec<ProcessInfo>,
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match args.command {
        Commands::Run(target) => run(config, target).await,
        Commands::Kill(target) => kill(config, target).await,
        Commands::Processes { output } => list_processes(&config, &output),
        Commands::Manifest { reference } => print_manifest(&config, &reference).await,
    };
    std::process::exit(code);
}

// =============================================================================
// Run
// =============================================================================

async fn run(config: DaemonConfig, target: TargetArgs) -> i32 {
    let events = EventLog::new(
        &config.daemon_logs_dir(),
        EventContext::new("run")
            .with_reference(target.reference.clone())
            .with_tenant(target.tenant.clone()),
    );

    match supervise(config, &target, &events).await {
        Ok(code) => code,
        Err(DaemonError::BuildNotInstalled(executable)) => {
            tracing::warn!(executable = %executable.display(), "Build not installed, cannot start");
            events.record(
                "build_not_installed",
                format!(
                    "Build '{}' not installed. Cannot start daemon.",
                    executable.display()
                ),
                Severity::Warning,
            );
            1
        }
        Err(e) => {
            tracing::error!(error = %e, "Supervisor failed to start");
            events.record_with(
                "exception",
                e.to_string(),
                json!({"command": "run"}),
                Severity::Error,
                None,
            );
            1
        }
    }
}

async fn supervise(config: DaemonConfig, target: &TargetArgs, events: &EventLog) -> fleetd::Result<i32> {
    let index = BuildIndex::load(&config.index_dir, &config.target_platform)?;
    let manifest = index.manifest(&target.reference).await?;
    let executable = manifest.executable(&config.builds_dir());
    if !executable.exists() {
        return Err(DaemonError::BuildNotInstalled(executable));
    }

    let session = Arc::new(Session::connect(config.control_plane.clone()).await?);
    let capacity = Box::new(InstanceTable::new(config.instances_file.clone()));

    tracing::info!(
        reference = %target.reference,
        tenant = %target.tenant,
        build = %manifest.build,
        root_endpoint = %session.root_endpoint(),
        "Starting fleetd supervisor"
    );

    let mut supervisor = Supervisor::new(
        &target.reference,
        &target.tenant,
        config,
        SupervisorPolicy::default(),
        session,
        capacity,
        events.clone(),
    )
    .await?;

    let cancel = install_shutdown_handler()?;
    let reason = supervisor.run(cancel).await;
    tracing::warn!(reason = %reason, exit_code = reason.exit_code(), "Supervisor stopped");
    Ok(reason.exit_code())
}

// =============================================================================
// Maintenance commands
// =============================================================================

async fn kill(config: DaemonConfig, target: TargetArgs) -> i32 {
    let events = EventLog::new(
        &config.daemon_logs_dir(),
        EventContext::new("kill")
            .with_reference(target.reference.clone())
            .with_tenant(target.tenant.clone()),
    );

    let manifest = match BuildIndex::load(&config.index_dir, &config.target_platform) {
        Ok(index) => index.manifest(&target.reference).await,
        Err(e) => Err(e),
    };
    let manifest = match manifest {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let mut probe = ProcessProbe::new();
    let killed = kill_workers(
        &mut probe,
        &manifest,
        &target.tenant,
        SupervisorPolicy::default().terminate_wait,
        &events,
    )
    .await;
    println!("Killed {} processes", killed.len());
    0
}

fn list_processes(config: &DaemonConfig, output: &OutputFormat) -> i32 {
    let mut probe = ProcessProbe::new();
    let mut processes = probe.find_under(&config.builds_dir());
    processes.sort_by_key(|p| p.pid);

    match output {
        OutputFormat::Json => {
            let out = ProcessListOutput { processes };
            match serde_json::to_string_pretty(&out) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return 1;
                }
            }
        }
        OutputFormat::Table => {
            if processes.is_empty() {
                println!("No worker processes found.");
                return 0;
            }
            println!("{:<8} {:<48} COMMAND", "PID", "EXECUTABLE");
            println!("{}", "-".repeat(78));
            for p in &processes {
                let args = p.cmd.iter().skip(1).cloned().collect::<Vec<_>>().join(" ");
                println!("{:<8} {:<48} {}", p.pid, truncate(&p.exe, 48), args);
            }
            println!();
            println!("{} processes", processes.len());
        }
    }
    0
}

async fn print_manifest(config: &DaemonConfig, reference: &str) -> i32 {
    let manifest = match BuildIndex::load(&config.index_dir, &config.target_platform) {
        Ok(index) => index.manifest(reference).await,
        Err(e) => Err(e),
    };
    match manifest.and_then(|m| serde_json::to_string_pretty(&m).map_err(DaemonError::from)) {
        Ok(text) => {
            println!("{}", text);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
