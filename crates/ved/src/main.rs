//! ved - orchestrator daemon entry point.

use clap::Parser;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;
use ve_core::project::orchestrator_log_path;
use ved::{Daemon, DaemonConfig};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Orchestrator daemon for ve projects.
#[derive(Parser)]
#[command(name = "ved")]
#[command(about = "ve orchestrator daemon")]
#[command(version)]
struct Args {
    /// Project directory (must contain docs/trunk/GOAL.md)
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// TCP port for the control plane (0 = ephemeral)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Maximum concurrent agents
    #[arg(long)]
    max_agents: Option<usize>,

    /// Seconds between scheduler dispatch ticks
    #[arg(long)]
    dispatch_interval: Option<f64>,

    /// Retries before an unverified completion needs attention
    #[arg(long)]
    max_completion_retries: Option<i64>,

    /// Agent command to spawn per phase
    #[arg(long, default_value = "ve-agent")]
    agent_cmd: String,

    /// Log to stderr instead of .ve/orchestrator.log
    #[arg(long)]
    foreground: bool,
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.foreground {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }

    let log_path = orchestrator_log_path(&args.project_dir);
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            eprintln!("ved: cannot open {}: {e}; logging to stderr", log_path.display());
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

fn main() {
    let args = Args::parse();
    init_tracing(&args);

    let config = DaemonConfig {
        project_dir: args.project_dir.clone(),
        port: args.port,
        max_agents: args.max_agents,
        dispatch_interval_seconds: args.dispatch_interval,
        max_completion_retries: args.max_completion_retries,
        agent_program: args.agent_cmd.clone(),
        agent_args: Vec::new(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                let daemon = Arc::new(daemon);
                // The signal handler only flips the cancellation token;
                // run() unwinds through its own shutdown path.
                let signal_daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("received termination signal");
                        signal_daemon.shutdown();
                    }
                });

                if let Err(e) = daemon.run().await {
                    error!("daemon error: {e}");
                    eprintln!("ved: {e}");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                eprintln!("ved: {e}");
                std::process::exit(1);
            }
        }
    });
}
