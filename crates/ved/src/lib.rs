//! ved - orchestrator daemon for ve projects.
//!
//! Owns the SQLite state store, the scheduler loop, worktree lifecycle, and
//! the HTTP/WebSocket control plane. One instance per project, identified by
//! `.ve/orchestrator.pid`; the API is served on a Unix domain socket and a
//! localhost TCP port persisted to `.ve/orchestrator.port`.

pub mod agent;
pub mod broadcast;
pub mod dashboard;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod worktree;

use crate::agent::ProcessAgentLauncher;
use crate::broadcast::Broadcaster;
use crate::scheduler::Scheduler;
use crate::server::AppState;
use crate::storage::StateStore;
use crate::worktree::WorktreeManager;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use ve_core::project::{load_ve_config, orchestrator_db_path, orchestrator_sock_path};
use ve_core::{ArtifactStore, OrchestratorConfig};

/// Application-level result with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon configuration, resolved from CLI flags and the store's config
/// table (flags win; values are persisted back for the next start).
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub project_dir: PathBuf,
    /// TCP port; 0 binds an ephemeral port, persisted to the port file.
    pub port: u16,
    pub max_agents: Option<usize>,
    pub dispatch_interval_seconds: Option<f64>,
    pub max_completion_retries: Option<i64>,
    /// Agent command and fixed leading arguments.
    pub agent_program: String,
    pub agent_args: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            port: 0,
            max_agents: None,
            dispatch_interval_seconds: None,
            max_completion_retries: None,
            agent_program: "ve-agent".to_string(),
            agent_args: Vec::new(),
        }
    }
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<StateStore>,
    scheduler: Arc<Scheduler>,
    broadcaster: Arc<Broadcaster>,
    artifacts: ArtifactStore,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Daemon {
    /// Open the store, run migrations, and wire up the scheduler.
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        let store = Arc::new(StateStore::new(&orchestrator_db_path(&config.project_dir)).await?);
        store.migrate().await?;

        let orchestrator = resolve_orchestrator_config(&store, &config).await?;
        info!(
            max_agents = orchestrator.max_agents,
            dispatch_interval = orchestrator.dispatch_interval_seconds,
            max_completion_retries = orchestrator.max_completion_retries,
            "scheduler configuration"
        );

        let ve_config = load_ve_config(&config.project_dir)?;
        let artifacts = ArtifactStore::new(&config.project_dir, ve_config.hash_mode);
        let broadcaster = Arc::new(Broadcaster::new());
        let launcher = Arc::new(ProcessAgentLauncher::new(
            config.agent_program.clone(),
            config.agent_args.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            artifacts.clone(),
            WorktreeManager::new(&config.project_dir),
            launcher,
            Arc::clone(&broadcaster),
            orchestrator,
        ));

        Ok(Self {
            config,
            store,
            scheduler,
            broadcaster,
            artifacts,
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run until shutdown: serve the API on TCP + UDS and tick the
    /// scheduler.
    pub async fn run(&self) -> AppResult<()> {
        runtime::check_single_instance(&self.config.project_dir)?;

        // RUNNING units from a crashed daemon have no live sessions.
        let adopted = self.scheduler.adopt_orphans().await?;
        if !adopted.is_empty() {
            info!(count = adopted.len(), "adopted orphaned work units");
        }

        let state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            scheduler: Arc::clone(&self.scheduler),
            broadcaster: Arc::clone(&self.broadcaster),
            artifacts: self.artifacts.clone(),
            started_at: Utc::now(),
        });
        let router = server::create_router(state);

        // TCP: localhost only; port 0 resolves to an ephemeral port.
        let tcp = tokio::net::TcpListener::bind(("127.0.0.1", self.config.port)).await?;
        let port = tcp.local_addr()?.port();

        // UDS: primary local transport. A leftover socket file from a dead
        // daemon is replaced.
        let sock_path = orchestrator_sock_path(&self.config.project_dir);
        if sock_path.exists() {
            std::fs::remove_file(&sock_path)?;
        }
        if let Some(parent) = sock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let uds = tokio::net::UnixListener::bind(&sock_path)?;

        runtime::write_runtime_files(&self.config.project_dir, std::process::id(), port)?;
        info!(port, sock = %sock_path.display(), "control plane listening");

        let tcp_handle = tokio::spawn({
            let router = router.clone();
            async move {
                if let Err(e) = axum::serve(tcp, router).await {
                    error!(error = %e, "tcp server error");
                }
            }
        });
        let uds_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(uds, router).await {
                error!(error = %e, "unix socket server error");
            }
        });

        // The scheduler loop is the daemon's main thread of control.
        Arc::clone(&self.scheduler).run_loop().await;

        // Shutdown: record audit reasons, stop accepting connections, clean
        // runtime files.
        if let Err(e) = self.scheduler.record_shutdown().await {
            warn!(error = %e, "failed to record shutdown reasons");
        }
        tcp_handle.abort();
        uds_handle.abort();
        runtime::remove_runtime_files(&self.config.project_dir);
        info!("daemon stopped");
        Ok(())
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.scheduler.shutdown();
    }
}

/// Merge persisted scheduler settings with CLI overrides; overrides win and
/// are persisted for the next start.
async fn resolve_orchestrator_config(
    store: &StateStore,
    config: &DaemonConfig,
) -> AppResult<OrchestratorConfig> {
    let mut resolved = OrchestratorConfig::default();

    if let Some(raw) = store.get_config("max_agents").await? {
        if let Ok(v) = raw.parse() {
            resolved.max_agents = v;
        }
    }
    if let Some(raw) = store.get_config("dispatch_interval_seconds").await? {
        if let Ok(v) = raw.parse() {
            resolved.dispatch_interval_seconds = v;
        }
    }
    if let Some(raw) = store.get_config("max_completion_retries").await? {
        if let Ok(v) = raw.parse() {
            resolved.max_completion_retries = v;
        }
    }

    if let Some(v) = config.max_agents {
        resolved.max_agents = v;
    }
    if let Some(v) = config.dispatch_interval_seconds {
        resolved.dispatch_interval_seconds = v;
    }
    if let Some(v) = config.max_completion_retries {
        resolved.max_completion_retries = v;
    }

    store
        .set_config("max_agents", &resolved.max_agents.to_string())
        .await?;
    store
        .set_config(
            "dispatch_interval_seconds",
            &resolved.dispatch_interval_seconds.to_string(),
        )
        .await?;
    store
        .set_config(
            "max_completion_retries",
            &resolved.max_completion_retries.to_string(),
        )
        .await?;

    Ok(resolved)
}
