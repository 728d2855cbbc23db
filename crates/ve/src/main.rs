//! ve - engineering-workflow CLI.
//!
//! Sub-commands over the artifact store (chunks, narratives, subsystems,
//! investigations), cross-repository sync, and the orchestrator daemon.
//! Commands exit 0 on success and 1 on any user-visible failure.

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, CreateWorkUnitRequest};
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, ExitCode, Stdio};
use ve_core::overlap::detect_overlaps;
use ve_core::project::{
    self, detect_context, find_project_root, load_ve_config, Context,
};
use ve_core::resolve;
use ve_core::sync::{any_errors, sync_single_repo, sync_task_directory, SyncOptions};
use ve_core::{ArtifactKind, ArtifactStore, RepoCache};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Engineering-workflow substrate: artifact DAG plus agent orchestration.
#[derive(Parser)]
#[command(name = "ve")]
#[command(about = "Artifact workflow and orchestration CLI")]
#[command(version)]
struct Cli {
    /// Project or task directory (default: detected from the cwd)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize the project document layout
    Init,

    /// Chunk commands
    #[command(subcommand)]
    Chunk(ChunkCommand),

    /// Narrative commands
    #[command(subcommand)]
    Narrative(BasicCommand),

    /// Subsystem commands
    #[command(subcommand)]
    Subsystem(SubsystemCommand),

    /// Investigation commands
    #[command(subcommand)]
    Investigation(BasicCommand),

    /// Advance external reference pins to the referent repositories
    Sync {
        /// Resolve and report without writing
        #[arg(long)]
        dry_run: bool,

        /// Only sync these projects (task mode)
        #[arg(long = "project")]
        projects: Vec<String>,

        /// Only sync these chunk short names
        #[arg(long = "chunk")]
        chunks: Vec<String>,
    },

    /// Orchestrator daemon commands
    #[command(subcommand)]
    Orch(OrchCommand),
}

#[derive(Subcommand)]
enum BasicCommand {
    /// Create a new artifact
    Start { short_name: String },
    /// List artifacts in causal order
    List,
    /// Print or transition an artifact's status
    Status {
        short_name: String,
        new_status: Option<String>,
    },
}

#[derive(Subcommand)]
enum ChunkCommand {
    /// Create a new chunk
    Start { short_name: String },
    /// List chunks in causal order
    List,
    /// Print or transition a chunk's status
    Status {
        short_name: String,
        new_status: Option<String>,
    },
    /// Find earlier artifacts whose code references overlap this chunk's
    Overlap { short_name: String },
    /// Resolve an external chunk reference and print its goal
    Resolve {
        short_name: String,

        /// Read content at the pinned SHA instead of the referent's HEAD
        #[arg(long)]
        at_pinned: bool,

        /// Project to search (task mode)
        #[arg(long)]
        project: Option<String>,
    },
}

#[derive(Subcommand)]
enum SubsystemCommand {
    /// Create a new subsystem
    Start { short_name: String },
    /// List subsystems in causal order
    List,
    /// Print or transition a subsystem's status
    Status {
        short_name: String,
        new_status: Option<String>,
    },
    /// Check that code references resolve to real files and symbols
    Validate { short_name: String },
}

#[derive(Subcommand)]
enum OrchCommand {
    /// Start the daemon for this project
    Start {
        /// Maximum concurrent agents
        #[arg(long)]
        max_agents: Option<usize>,

        /// TCP port (0 = ephemeral)
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Agent command to spawn per phase
        #[arg(long)]
        agent_cmd: Option<String>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// List work units
    Units {
        /// Filter by status (READY, RUNNING, BLOCKED, NEEDS_ATTENTION, DONE)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show the prioritised attention queue
    Attention,
    /// Create a work unit for a chunk
    Add {
        chunk: String,

        #[arg(long)]
        priority: Option<i64>,

        /// Chunks that must finish first
        #[arg(long = "after")]
        blocked_by: Vec<String>,
    },
    /// Show one work unit
    Show { chunk: String },
    /// Update a work unit's phase, status, or blockers
    Set {
        chunk: String,

        #[arg(long)]
        phase: Option<String>,

        #[arg(long)]
        status: Option<String>,

        /// Replace the blocked-by list
        #[arg(long = "after")]
        blocked_by: Option<Vec<String>>,
    },
    /// Remove a work unit (and its worktree)
    Rm { chunk: String },
    /// Show a work unit's status history
    History { chunk: String },
    /// Answer a suspended work unit's question
    Answer { chunk: String, answer: String },
    /// Resolve an overlap conflict between two work units
    Resolve {
        chunk: String,

        #[arg(long)]
        other: String,

        /// parallelize or serialize
        #[arg(long)]
        verdict: String,
    },
}

/// User-visible failure: printed to stderr, exit 1.
struct CliFailure(String);

impl<E: std::fmt::Display> From<E> for CliFailure {
    fn from(e: E) -> Self {
        Self(e.to_string())
    }
}

type CliResult = Result<(), CliFailure>;

fn resolve_project_dir(explicit: Option<&PathBuf>) -> Result<PathBuf, CliFailure> {
    if let Some(dir) = explicit {
        return Ok(dir.clone());
    }
    let cwd = std::env::current_dir().map_err(|e| CliFailure(e.to_string()))?;
    find_project_root(&cwd).map_err(CliFailure::from)
}

fn open_store(project_dir: &Path) -> Result<ArtifactStore, CliFailure> {
    let config = load_ve_config(project_dir)?;
    Ok(ArtifactStore::new(project_dir, config.hash_mode))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliFailure(message)) => {
            eprintln!("Error: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult {
    let Cli {
        project_dir,
        command,
    } = cli;

    match command {
        Command::Init => {
            let dir = explicit_or_cwd(project_dir.as_ref())?;
            let result = project::init_project(&dir)?;
            for path in &result.created {
                println!("created {path}");
            }
            for path in &result.skipped {
                println!("skipped {path} (exists)");
            }
            Ok(())
        }

        Command::Chunk(chunk_command) => {
            match chunk_command {
                ChunkCommand::Start { short_name } => {
                    let dir = resolve_project_dir(project_dir.as_ref())?;
                    artifact_start(&dir, ArtifactKind::Chunk, &short_name)
                }
                ChunkCommand::List => {
                    let dir = resolve_project_dir(project_dir.as_ref())?;
                    artifact_list(&dir, ArtifactKind::Chunk)
                }
                ChunkCommand::Status {
                    short_name,
                    new_status,
                } => {
                    let dir = resolve_project_dir(project_dir.as_ref())?;
                    artifact_status(&dir, ArtifactKind::Chunk, &short_name, new_status.as_deref())
                }
                ChunkCommand::Overlap { short_name } => {
                    let dir = resolve_project_dir(project_dir.as_ref())?;
                    let store = open_store(&dir)?;
                    let hits = detect_overlaps(&store, &short_name)?;
                    for hit in hits {
                        println!("{} ({})", hit.short, hit.kind);
                        for (probe_ref, candidate_ref) in hit.overlapping {
                            println!("  {probe_ref} ~ {candidate_ref}");
                        }
                    }
                    Ok(())
                }
                ChunkCommand::Resolve {
                    short_name,
                    at_pinned,
                    project,
                } => chunk_resolve(
                    project_dir.as_ref(),
                    &short_name,
                    at_pinned,
                    project.as_deref(),
                ),
            }
        }

        Command::Narrative(basic) => {
            let dir = resolve_project_dir(project_dir.as_ref())?;
            basic_command(&dir, ArtifactKind::Narrative, basic)
        }

        Command::Investigation(basic) => {
            let dir = resolve_project_dir(project_dir.as_ref())?;
            basic_command(&dir, ArtifactKind::Investigation, basic)
        }

        Command::Subsystem(subsystem_command) => {
            let dir = resolve_project_dir(project_dir.as_ref())?;
            match subsystem_command {
                SubsystemCommand::Start { short_name } => {
                    artifact_start(&dir, ArtifactKind::Subsystem, &short_name)
                }
                SubsystemCommand::List => artifact_list(&dir, ArtifactKind::Subsystem),
                SubsystemCommand::Status {
                    short_name,
                    new_status,
                } => artifact_status(
                    &dir,
                    ArtifactKind::Subsystem,
                    &short_name,
                    new_status.as_deref(),
                ),
                SubsystemCommand::Validate { short_name } => {
                    let store = open_store(&dir)?;
                    let unresolved =
                        store.validate_references(ArtifactKind::Subsystem, &short_name)?;
                    if unresolved.is_empty() {
                        println!("{short_name}: all references resolve");
                        Ok(())
                    } else {
                        for r in &unresolved {
                            eprintln!("{short_name}: unresolved reference {r}");
                        }
                        Err(CliFailure(format!(
                            "{} unresolved reference(s) in subsystem '{short_name}'",
                            unresolved.len()
                        )))
                    }
                }
            }
        }

        Command::Sync {
            dry_run,
            projects,
            chunks,
        } => {
            let options = SyncOptions {
                dry_run,
                project_filter: projects,
                chunk_filter: chunks,
            };
            let start = explicit_or_cwd(project_dir.as_ref())?;
            let results = match detect_context(&start) {
                Some(Context::Task { task_dir }) => sync_task_directory(&task_dir, &options)?,
                Some(Context::SingleRepo { project_dir }) => {
                    sync_single_repo(&project_dir, &RepoCache::default(), &options)?
                }
                None => {
                    return Err(CliFailure(format!(
                        "no project or task directory found from {}",
                        start.display()
                    )))
                }
            };
            print!("{}", render::sync_report(&results));
            if any_errors(&results) {
                return Err(CliFailure("sync completed with errors".to_string()));
            }
            Ok(())
        }

        Command::Orch(orch) => {
            let dir = resolve_project_dir(project_dir.as_ref())?;
            orch_command(&dir, orch).await
        }
    }
}

fn explicit_or_cwd(explicit: Option<&PathBuf>) -> Result<PathBuf, CliFailure> {
    match explicit {
        Some(dir) => Ok(dir.clone()),
        None => std::env::current_dir().map_err(|e| CliFailure(e.to_string())),
    }
}

fn basic_command(dir: &Path, kind: ArtifactKind, command: BasicCommand) -> CliResult {
    match command {
        BasicCommand::Start { short_name } => artifact_start(dir, kind, &short_name),
        BasicCommand::List => artifact_list(dir, kind),
        BasicCommand::Status {
            short_name,
            new_status,
        } => artifact_status(dir, kind, &short_name, new_status.as_deref()),
    }
}

fn artifact_start(dir: &Path, kind: ArtifactKind, short_name: &str) -> CliResult {
    let store = open_store(dir)?;
    let path = store.create(kind, short_name)?;
    println!("created {}", path.display());
    Ok(())
}

fn artifact_list(dir: &Path, kind: ArtifactKind) -> CliResult {
    let store = open_store(dir)?;
    let rows = store.list(kind)?;
    if rows.is_empty() {
        return Err(CliFailure(format!("no {}s found", kind.as_str())));
    }
    print!("{}", render::artifact_list(&rows));
    Ok(())
}

fn artifact_status(
    dir: &Path,
    kind: ArtifactKind,
    short_name: &str,
    new_status: Option<&str>,
) -> CliResult {
    let store = open_store(dir)?;
    match new_status {
        None => {
            let status = store.status(kind, short_name)?;
            println!("{short_name}: {status}");
        }
        Some(new_status) => {
            let (old, new) = store.transition(kind, short_name, new_status)?;
            println!("{short_name}: {old} -> {new}");
        }
    }
    Ok(())
}

fn chunk_resolve(
    project_dir: Option<&PathBuf>,
    short_name: &str,
    at_pinned: bool,
    project: Option<&str>,
) -> CliResult {
    let start = explicit_or_cwd(project_dir)?;
    let result = match detect_context(&start) {
        Some(Context::Task { task_dir }) => {
            resolve::resolve_task_directory(&task_dir, short_name, at_pinned, project)?
        }
        Some(Context::SingleRepo { project_dir }) => {
            resolve::resolve_single_repo(&project_dir, &RepoCache::default(), short_name, at_pinned)?
        }
        None => {
            return Err(CliFailure(format!(
                "no project or task directory found from {}",
                start.display()
            )))
        }
    };

    println!(
        "# {}:{} @ {} (track {})",
        result.repo, result.artifact_id, &result.resolved_sha[..12], result.track
    );
    if let Some(goal) = &result.goal_content {
        print!("{goal}");
    }
    Ok(())
}

// --- Orchestrator commands ---

async fn orch_command(dir: &Path, command: OrchCommand) -> CliResult {
    match command {
        OrchCommand::Start {
            max_agents,
            port,
            agent_cmd,
        } => orch_start(dir, max_agents, port, agent_cmd),
        OrchCommand::Stop => orch_stop(dir),
        OrchCommand::Status => {
            let client = Client::from_project(dir)?;
            let status = client.status().await?;
            println!(
                "running at {} (pid {}), uptime {:.0}s, version {}",
                client.addr(),
                status.pid.unwrap_or(0),
                status.uptime_seconds.unwrap_or(0.0),
                status.version
            );
            if let Some(config) = &status.config {
                println!(
                    "max_agents {}, dispatch every {}s, completion retries {}",
                    config.max_agents,
                    config.dispatch_interval_seconds,
                    config.max_completion_retries
                );
            }
            for (status_name, count) in &status.work_unit_counts {
                println!("  {status_name}: {count}");
            }
            Ok(())
        }
        OrchCommand::Units { status } => {
            let client = Client::from_project(dir)?;
            let units = client.list_units(status.as_deref()).await?;
            print!("{}", render::work_unit_table(&units));
            Ok(())
        }
        OrchCommand::Attention => {
            let client = Client::from_project(dir)?;
            let items = client.attention().await?;
            print!("{}", render::attention_table(&items));
            Ok(())
        }
        OrchCommand::Add {
            chunk,
            priority,
            blocked_by,
        } => {
            let client = Client::from_project(dir)?;
            let unit = client
                .create_unit(&CreateWorkUnitRequest {
                    chunk,
                    phase: None,
                    priority,
                    blocked_by: if blocked_by.is_empty() {
                        None
                    } else {
                        Some(blocked_by)
                    },
                })
                .await?;
            println!("{}: {}", unit.chunk, unit.status.as_str());
            Ok(())
        }
        OrchCommand::Show { chunk } => {
            let client = Client::from_project(dir)?;
            let unit = client.get_unit(&chunk).await?;
            print!("{}", render::work_unit_table(std::slice::from_ref(&unit)));
            if let Some(reason) = &unit.attention_reason {
                println!("attention: {reason}");
            }
            if let Some(worktree) = &unit.worktree {
                println!("worktree: {worktree}");
            }
            Ok(())
        }
        OrchCommand::Set {
            chunk,
            phase,
            status,
            blocked_by,
        } => {
            let client = Client::from_project(dir)?;
            let unit = client
                .patch_unit(
                    &chunk,
                    &client::PatchWorkUnitRequest {
                        phase,
                        status,
                        blocked_by,
                        worktree: None,
                    },
                )
                .await?;
            println!("{}: {}", unit.chunk, unit.status.as_str());
            Ok(())
        }
        OrchCommand::Rm { chunk } => {
            let client = Client::from_project(dir)?;
            client.delete_unit(&chunk).await?;
            println!("{chunk}: removed");
            Ok(())
        }
        OrchCommand::History { chunk } => {
            let client = Client::from_project(dir)?;
            let history = client.history(&chunk).await?;
            print!("{}", render::history_table(&history));
            Ok(())
        }
        OrchCommand::Answer { chunk, answer } => {
            let client = Client::from_project(dir)?;
            let unit = client.answer(&chunk, &answer).await?;
            println!("{}: {}", unit.chunk, unit.status.as_str());
            Ok(())
        }
        OrchCommand::Resolve {
            chunk,
            other,
            verdict,
        } => {
            let client = Client::from_project(dir)?;
            let unit = client.resolve(&chunk, &other, &verdict).await?;
            println!("{}: {}", unit.chunk, unit.status.as_str());
            Ok(())
        }
    }
}

fn orch_start(
    dir: &Path,
    max_agents: Option<usize>,
    port: u16,
    agent_cmd: Option<String>,
) -> CliResult {
    // Refuse early when an instance is already up.
    if let Some(existing_port) = ved_port(dir) {
        return Err(CliFailure(format!(
            "orchestrator already running on port {existing_port}"
        )));
    }

    let ved_binary = find_ved_binary();
    let mut command = ProcessCommand::new(&ved_binary);
    command
        .arg("--project-dir")
        .arg(dir)
        .arg("--port")
        .arg(port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(max_agents) = max_agents {
        command.arg("--max-agents").arg(max_agents.to_string());
    }
    if let Some(agent_cmd) = agent_cmd {
        command.arg("--agent-cmd").arg(agent_cmd);
    }

    command
        .spawn()
        .map_err(|e| CliFailure(format!("failed to spawn {ved_binary}: {e}")))?;

    // Wait for the daemon to publish its port.
    for _ in 0..50 {
        std::thread::sleep(std::time::Duration::from_millis(100));
        if let Some(published) = ved_port(dir) {
            println!("orchestrator started on port {published}");
            return Ok(());
        }
    }
    Err(CliFailure(
        "daemon did not publish a port within 5s; check .ve/orchestrator.log".to_string(),
    ))
}

fn orch_stop(dir: &Path) -> CliResult {
    let pid_path = project::orchestrator_pid_path(dir);
    let content = std::fs::read_to_string(&pid_path)
        .map_err(|_| CliFailure("orchestrator daemon is not running".to_string()))?;
    let pid: u32 = content
        .trim()
        .parse()
        .map_err(|_| CliFailure("orchestrator pid file is corrupt".to_string()))?;

    let signalled = ProcessCommand::new("kill")
        .arg(pid.to_string())
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !signalled {
        return Err(CliFailure(format!("failed to signal daemon (pid {pid})")));
    }

    // The daemon removes its runtime files on the way out.
    for _ in 0..50 {
        std::thread::sleep(std::time::Duration::from_millis(100));
        if !pid_path.exists() {
            println!("orchestrator stopped");
            return Ok(());
        }
    }
    Err(CliFailure(format!(
        "daemon (pid {pid}) did not exit within 5s"
    )))
}

fn ved_port(dir: &Path) -> Option<u16> {
    std::fs::read_to_string(project::orchestrator_port_path(dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Prefer a `ved` binary next to the `ve` binary; fall back to PATH.
fn find_ved_binary() -> String {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let sibling = dir.join("ved");
            if sibling.exists() {
                return sibling.display().to_string();
            }
        }
    }
    "ved".to_string()
}
