//! Agent process launching.
//!
//! The daemon advances work units by spawning one local agent process per
//! phase. The agent contract is deliberately narrow:
//!
//! - exit 0: the phase completed;
//! - exit 75 (EX_TEMPFAIL): the agent suspended to ask the operator a
//!   question, reported as a JSON line `{"question": .., "session_id": ..}`
//!   on stdout;
//! - any other exit: failure, with stderr as the reason.
//!
//! A pending operator answer and a suspended session id are handed to the
//! process through `VE_PENDING_ANSWER` / `VE_SESSION_ID`.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use ve_core::{AgentOutcome, WorkUnitPhase};

/// Exit code an agent uses to signal suspension.
const SUSPEND_EXIT_CODE: i32 = 75;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Everything an agent needs to run one phase of one chunk.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub chunk: String,
    pub phase: WorkUnitPhase,
    /// Working directory for the agent (the unit's worktree).
    pub working_dir: PathBuf,
    /// Operator answer to inject when resuming a suspended session.
    pub pending_answer: Option<String>,
    /// Session to resume, when the unit was previously suspended.
    pub session_id: Option<String>,
}

/// Launches agents for the scheduler. The daemon wires in the process
/// implementation; tests substitute scripted outcomes.
pub trait AgentLauncher: Send + Sync + 'static {
    fn launch(&self, request: AgentRequest, cancel: CancellationToken) -> BoxFuture<AgentOutcome>;
}

/// Spawns a configured command per phase.
#[derive(Debug, Clone)]
pub struct ProcessAgentLauncher {
    program: String,
    args: Vec<String>,
}

impl ProcessAgentLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl AgentLauncher for ProcessAgentLauncher {
    fn launch(&self, request: AgentRequest, cancel: CancellationToken) -> BoxFuture<AgentOutcome> {
        let program = self.program.clone();
        let base_args = self.args.clone();
        Box::pin(async move {
            let mut command = Command::new(&program);
            command
                .args(&base_args)
                .arg("--chunk")
                .arg(&request.chunk)
                .arg("--phase")
                .arg(request.phase.as_str())
                .current_dir(&request.working_dir)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(answer) = &request.pending_answer {
                command.env("VE_PENDING_ANSWER", answer);
            }
            if let Some(session) = &request.session_id {
                command.env("VE_SESSION_ID", session);
            }

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    return AgentOutcome::Failed {
                        error: format!("failed to spawn agent '{program}': {e}"),
                    }
                }
            };

            // Drain pipes concurrently with wait() so a chatty agent can
            // never block on a full pipe.
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let stdout_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stdout) = stdout {
                    let _ = stdout.read_to_string(&mut buf).await;
                }
                buf
            });
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });

            let status = tokio::select! {
                status = child.wait() => status,
                () = cancel.cancelled() => {
                    // Daemon shutdown: signal the process and report failure;
                    // the scheduler leaves the unit RUNNING for audit.
                    if let Err(e) = child.kill().await {
                        warn!(chunk = %request.chunk, error = %e, "failed to kill agent");
                    }
                    return AgentOutcome::Failed {
                        error: "daemon_shutdown".to_string(),
                    };
                }
            };

            let out = stdout_task.await.unwrap_or_default();
            let err = stderr_task.await.unwrap_or_default();

            match status {
                Ok(status) if status.success() => AgentOutcome::Completed,
                Ok(status) if status.code() == Some(SUSPEND_EXIT_CODE) => {
                    parse_suspension(&request.chunk, &out)
                }
                Ok(status) => AgentOutcome::Failed {
                    error: format!(
                        "agent exited with {}: {}",
                        status.code().map_or_else(
                            || "signal".to_string(),
                            |c| c.to_string()
                        ),
                        err.trim()
                    ),
                },
                Err(e) => AgentOutcome::Failed {
                    error: format!("failed to wait for agent: {e}"),
                },
            }
        })
    }
}

/// Parse the suspension payload from the last JSON line of stdout.
fn parse_suspension(chunk: &str, stdout: &str) -> AgentOutcome {
    #[derive(serde::Deserialize)]
    struct Suspension {
        question: String,
        session_id: String,
    }

    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Suspension>(trimmed) {
            Ok(s) => {
                return AgentOutcome::Suspended {
                    question: s.question,
                    session_id: s.session_id,
                }
            }
            Err(_) => break,
        }
    }
    warn!(chunk, "agent signalled suspension without a parseable payload");
    AgentOutcome::Failed {
        error: "agent suspended without a question payload".to_string(),
    }
}
