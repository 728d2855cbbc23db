//! Scheduler: dispatch READY work units to agents under the concurrency cap.
//!
//! One cooperative loop owns every dispatch-driven transition. Each tick it
//! counts RUNNING units, pulls from the ready queue in `(priority DESC,
//! created_at ASC, chunk ASC)` order, claims a worktree, marks the unit
//! RUNNING, and spawns the agent for the unit's phase. Agent outcomes are
//! pattern-matched: completion advances the phase, suspension parks the unit
//! in the attention queue, failure does too.

use crate::agent::{AgentLauncher, AgentRequest};
use crate::broadcast::Broadcaster;
use crate::storage::{StateStore, StorageError};
use crate::worktree::{WorktreeError, WorktreeManager};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ve_core::artifacts::ArtifactStore;
use ve_core::{
    AgentOutcome, ArtifactKind, ChunkStatus, OrchestratorConfig, VeError, WorkUnit,
    WorkUnitPhase, WorkUnitStatus,
};

/// Attention reason when a COMPLETE phase exhausted its retries.
pub const REASON_COMPLETION_NOT_VERIFIED: &str = "completion_not_verified";
/// Attention reason for units orphaned by a daemon restart.
pub const REASON_ORPHANED: &str = "orphaned_after_shutdown";
/// Audit reason recorded on units interrupted by shutdown.
pub const REASON_DAEMON_SHUTDOWN: &str = "daemon_shutdown";
/// Attention reason for a failed fast-forward merge.
pub const REASON_MERGE_CONFLICT: &str = "merge_conflict";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error(transparent)]
    Core(#[from] VeError),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

pub struct Scheduler {
    store: Arc<StateStore>,
    artifacts: ArtifactStore,
    worktrees: WorktreeManager,
    launcher: Arc<dyn AgentLauncher>,
    broadcaster: Arc<Broadcaster>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<StateStore>,
        artifacts: ArtifactStore,
        worktrees: WorktreeManager,
        launcher: Arc<dyn AgentLauncher>,
        broadcaster: Arc<Broadcaster>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            worktrees,
            launcher,
            broadcaster,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal shutdown: cancels the loop and every in-flight agent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Adopt state left by a previous daemon: RUNNING units whose sessions
    /// died with the old process become NEEDS_ATTENTION.
    pub async fn adopt_orphans(&self) -> Result<Vec<String>> {
        let running = self.store.list_work_units(Some(WorkUnitStatus::Running)).await?;
        let mut adopted = Vec::new();
        for mut unit in running {
            warn!(chunk = %unit.chunk, "adopting orphaned RUNNING unit");
            unit.status = WorkUnitStatus::NeedsAttention;
            unit.attention_reason = Some(REASON_ORPHANED.to_string());
            let unit = self.store.update_work_unit(&unit).await?;
            self.broadcaster.work_unit_update(&unit);
            self.broadcaster
                .attention_update("added", &unit.chunk, Some(REASON_ORPHANED));
            adopted.push(unit.chunk);
        }
        Ok(adopted)
    }

    /// Record the shutdown reason on still-RUNNING units, without changing
    /// their status (they stay RUNNING for audit and restart adoption).
    pub async fn record_shutdown(&self) -> Result<()> {
        let running = self.store.list_work_units(Some(WorkUnitStatus::Running)).await?;
        for mut unit in running {
            unit.attention_reason = Some(REASON_DAEMON_SHUTDOWN.to_string());
            self.store.update_work_unit(&unit).await?;
        }
        Ok(())
    }

    /// Run dispatch ticks until shutdown.
    pub async fn run_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs_f64(
            self.config.dispatch_interval_seconds.max(0.05),
        );
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("scheduler loop cancelled");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = Arc::clone(&self).dispatch_once().await {
                error!(error = %e, "dispatch tick failed");
            }
        }
    }

    /// One dispatch pass: fill free agent slots from the ready queue.
    pub async fn dispatch_once(self: Arc<Self>) -> Result<usize> {
        let running = self.store.count_running().await?;
        let capacity = self.config.max_agents.saturating_sub(running as usize);
        if capacity == 0 {
            return Ok(0);
        }

        let candidates = self.store.ready_queue(Some(capacity as i64)).await?;
        let mut dispatched = 0;
        for candidate in candidates {
            // An operator PATCH may have intervened since the queue read.
            let Some(current) = self.store.try_get_work_unit(&candidate.chunk).await? else {
                continue;
            };
            if current.status != WorkUnitStatus::Ready {
                continue;
            }
            match self.start_unit(current).await {
                Ok((unit, answer)) => {
                    dispatched += 1;
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        scheduler.process_unit(unit, answer).await;
                    });
                }
                Err(e) => {
                    error!(chunk = %candidate.chunk, error = %e, "failed to start unit");
                }
            }
        }
        Ok(dispatched)
    }

    /// Claim a worktree and transition the unit to RUNNING.
    ///
    /// A stashed operator answer is consumed by this transition: it is
    /// cleared from the store and handed to the agent instead.
    async fn start_unit(&self, mut unit: WorkUnit) -> Result<(WorkUnit, Option<String>)> {
        // Git work runs off the event loop.
        let worktrees = self.worktrees.clone();
        let artifacts = self.artifacts.clone();
        let chunk = unit.chunk.clone();
        let claimed = tokio::task::spawn_blocking(move || worktrees.claim(&artifacts, &chunk))
            .await
            .map_err(|e| SchedulerError::InvalidOperation(format!("worktree task failed: {e}")))??;
        unit.worktree = Some(claimed.path.display().to_string());
        if claimed.displaced_chunk.is_some() {
            unit.displaced_chunk = claimed.displaced_chunk;
        }
        unit.status = WorkUnitStatus::Running;
        let answer = unit.pending_answer.take();
        let unit = self.store.update_work_unit(&unit).await?;
        info!(chunk = %unit.chunk, phase = unit.phase.as_str(), "dispatched work unit");
        self.broadcaster.work_unit_update(&unit);
        Ok((unit, answer))
    }

    /// Run the agent for a unit's phase and apply its outcome.
    async fn process_unit(&self, unit: WorkUnit, pending_answer: Option<String>) {
        let working_dir = unit
            .worktree
            .clone()
            .map_or_else(|| self.worktrees.project_dir().to_path_buf(), Into::into);
        let request = AgentRequest {
            chunk: unit.chunk.clone(),
            phase: unit.phase,
            working_dir,
            pending_answer,
            session_id: unit.session_id.clone(),
        };

        let outcome = self
            .launcher
            .launch(request, self.cancel.child_token())
            .await;

        if self.is_shutdown() {
            // Units interrupted by shutdown stay RUNNING; the reason is
            // recorded separately for audit.
            info!(chunk = %unit.chunk, "shutdown during agent run; leaving unit RUNNING");
            return;
        }

        if let Err(e) = self.apply_outcome(&unit.chunk, outcome).await {
            error!(chunk = %unit.chunk, error = %e, "failed to apply agent outcome");
        }
    }

    /// Apply an agent outcome to a unit. Public for the daemon's tests.
    pub async fn apply_outcome(&self, chunk: &str, outcome: AgentOutcome) -> Result<()> {
        let unit = self.store.get_work_unit(chunk).await?;
        match outcome {
            AgentOutcome::Completed => self.on_completed(unit).await,
            AgentOutcome::Suspended {
                question,
                session_id,
            } => self.on_suspended(unit, question, session_id).await,
            AgentOutcome::Failed { error } => self.on_failed(unit, error).await,
        }
    }

    async fn on_completed(&self, mut unit: WorkUnit) -> Result<()> {
        if unit.phase == WorkUnitPhase::Complete {
            return self.verify_completion(unit).await;
        }

        unit.phase = match unit.phase {
            WorkUnitPhase::Goal => WorkUnitPhase::Plan,
            WorkUnitPhase::Plan => WorkUnitPhase::Implement,
            WorkUnitPhase::Implement | WorkUnitPhase::Complete => WorkUnitPhase::Complete,
        };
        unit.status = WorkUnitStatus::Ready;
        unit.session_id = None;
        let unit = self.store.update_work_unit(&unit).await?;
        info!(chunk = %unit.chunk, phase = unit.phase.as_str(), "phase complete; requeued");
        self.broadcaster.work_unit_update(&unit);
        Ok(())
    }

    /// COMPLETE finished: confirm the chunk actually reached ACTIVE.
    async fn verify_completion(&self, mut unit: WorkUnit) -> Result<()> {
        // Frontmatter reads hit the filesystem; keep them off the event loop.
        let artifacts = self.artifacts.clone();
        let chunk = unit.chunk.clone();
        let chunk_status = tokio::task::spawn_blocking(move || {
            artifacts
                .status(ArtifactKind::Chunk, &chunk)
                .map(|s| s.0)
                .unwrap_or_default()
        })
        .await
        .map_err(|e| SchedulerError::InvalidOperation(format!("status check task failed: {e}")))?;

        if chunk_status == ChunkStatus::Active.as_str() {
            // Merge the worktree back; a conflict needs the operator.
            if unit.worktree.is_some() {
                let worktrees = self.worktrees.clone();
                let chunk = unit.chunk.clone();
                let merged =
                    tokio::task::spawn_blocking(move || worktrees.merge(&chunk))
                        .await
                        .unwrap_or_else(|e| {
                            Err(WorktreeError::Git {
                                op: "merge".to_string(),
                                detail: e.to_string(),
                            })
                        });
                if let Err(e) = merged {
                    warn!(chunk = %unit.chunk, error = %e, "fast-forward merge failed");
                    unit.status = WorkUnitStatus::NeedsAttention;
                    unit.attention_reason = Some(REASON_MERGE_CONFLICT.to_string());
                    let unit = self.store.update_work_unit(&unit).await?;
                    self.broadcaster.work_unit_update(&unit);
                    self.broadcaster.attention_update(
                        "added",
                        &unit.chunk,
                        Some(REASON_MERGE_CONFLICT),
                    );
                    return Ok(());
                }
            }
            unit.status = WorkUnitStatus::Done;
            unit.session_id = None;
            let unit = self.store.update_work_unit(&unit).await?;
            info!(chunk = %unit.chunk, "work unit done");
            self.broadcaster.work_unit_update(&unit);
            self.unblock_dependents(&unit.chunk).await?;
            return Ok(());
        }

        unit.completion_retries += 1;
        if unit.completion_retries <= self.config.max_completion_retries {
            info!(
                chunk = %unit.chunk,
                retries = unit.completion_retries,
                "completion not verified; requeueing"
            );
            unit.status = WorkUnitStatus::Ready;
            let unit = self.store.update_work_unit(&unit).await?;
            self.broadcaster.work_unit_update(&unit);
        } else {
            warn!(chunk = %unit.chunk, "completion retries exhausted");
            unit.status = WorkUnitStatus::NeedsAttention;
            unit.attention_reason = Some(REASON_COMPLETION_NOT_VERIFIED.to_string());
            let unit = self.store.update_work_unit(&unit).await?;
            self.broadcaster.work_unit_update(&unit);
            self.broadcaster.attention_update(
                "added",
                &unit.chunk,
                Some(REASON_COMPLETION_NOT_VERIFIED),
            );
        }
        Ok(())
    }

    async fn on_suspended(
        &self,
        mut unit: WorkUnit,
        question: String,
        session_id: String,
    ) -> Result<()> {
        info!(chunk = %unit.chunk, "agent suspended with operator question");
        unit.status = WorkUnitStatus::NeedsAttention;
        unit.session_id = Some(session_id);
        unit.attention_reason = Some(question.clone());
        let unit = self.store.update_work_unit(&unit).await?;
        self.broadcaster.work_unit_update(&unit);
        self.broadcaster
            .attention_update("added", &unit.chunk, Some(&question));

        // Anything waiting on this chunk queues up behind the question.
        for mut dependent in self.store.list_work_units(None).await? {
            if dependent.blocked_by.contains(&unit.chunk)
                && dependent.status == WorkUnitStatus::Ready
            {
                dependent.status = WorkUnitStatus::Blocked;
                let dependent = self.store.update_work_unit(&dependent).await?;
                self.broadcaster.work_unit_update(&dependent);
            }
        }
        Ok(())
    }

    async fn on_failed(&self, mut unit: WorkUnit, error: String) -> Result<()> {
        warn!(chunk = %unit.chunk, error = %error, "agent failed");
        unit.status = WorkUnitStatus::NeedsAttention;
        unit.attention_reason = Some(error.clone());
        let unit = self.store.update_work_unit(&unit).await?;
        self.broadcaster.work_unit_update(&unit);
        self.broadcaster
            .attention_update("added", &unit.chunk, Some(&error));
        Ok(())
    }

    /// Operator answered a suspended unit: stash the answer and requeue.
    pub async fn answer(&self, chunk: &str, answer: String) -> Result<WorkUnit> {
        let mut unit = self.store.get_work_unit(chunk).await?;
        if unit.status != WorkUnitStatus::NeedsAttention {
            return Err(SchedulerError::InvalidOperation(format!(
                "work unit '{chunk}' is {} and has no pending question",
                unit.status.as_str()
            )));
        }
        unit.pending_answer = Some(answer);
        unit.status = WorkUnitStatus::Ready;
        unit.attention_reason = None;
        let unit = self.store.update_work_unit(&unit).await?;
        self.broadcaster.work_unit_update(&unit);
        self.broadcaster.attention_update("resolved", chunk, None);
        Ok(unit)
    }

    /// Operator resolved an overlap conflict between two units.
    ///
    /// `parallelize` releases the block in both directions; `serialize`
    /// blocks `chunk` behind `other_chunk`.
    pub async fn resolve_conflict(
        &self,
        chunk: &str,
        other_chunk: &str,
        verdict: &str,
    ) -> Result<WorkUnit> {
        let mut unit = self.store.get_work_unit(chunk).await?;
        let mut other = self.store.get_work_unit(other_chunk).await?;

        match verdict {
            "parallelize" => {
                unit.blocked_by.retain(|c| c != other_chunk);
                other.blocked_by.retain(|c| c != chunk);
                if unit.status == WorkUnitStatus::Blocked && unit.blocked_by.is_empty() {
                    unit.status = WorkUnitStatus::Ready;
                }
                if unit.status == WorkUnitStatus::NeedsAttention {
                    unit.status = WorkUnitStatus::Ready;
                    unit.attention_reason = None;
                }
                if other.status == WorkUnitStatus::Blocked && other.blocked_by.is_empty() {
                    other.status = WorkUnitStatus::Ready;
                }
            }
            "serialize" => {
                if !unit.blocked_by.contains(&other.chunk) {
                    unit.blocked_by.push(other.chunk.clone());
                }
                if unit.status == WorkUnitStatus::Ready
                    || unit.status == WorkUnitStatus::NeedsAttention
                {
                    unit.status = WorkUnitStatus::Blocked;
                    unit.attention_reason = None;
                }
            }
            other_verdict => {
                return Err(SchedulerError::InvalidOperation(format!(
                    "unknown verdict '{other_verdict}' (expected parallelize or serialize)"
                )));
            }
        }

        self.store.update_work_unit(&other).await?;
        let unit = self.store.update_work_unit(&unit).await?;
        self.broadcaster.work_unit_update(&unit);
        self.broadcaster.attention_update("resolved", chunk, None);
        Ok(unit)
    }

    /// Release units blocked solely on a finished chunk.
    async fn unblock_dependents(&self, chunk: &str) -> Result<()> {
        for mut dependent in self.store.list_work_units(None).await? {
            if !dependent.blocked_by.contains(&chunk.to_string()) {
                continue;
            }
            dependent.blocked_by.retain(|c| c != chunk);
            if dependent.status == WorkUnitStatus::Blocked && dependent.blocked_by.is_empty() {
                dependent.status = WorkUnitStatus::Ready;
            }
            let dependent = self.store.update_work_unit(&dependent).await?;
            self.broadcaster.work_unit_update(&dependent);
        }
        Ok(())
    }

    /// Delete a unit, removing its worktree (and restoring any displaced
    /// chunk) first.
    pub async fn delete_unit(&self, chunk: &str) -> Result<bool> {
        let Some(unit) = self.store.try_get_work_unit(chunk).await? else {
            return Ok(false);
        };
        if unit.worktree.is_some() {
            let worktrees = self.worktrees.clone();
            let artifacts = self.artifacts.clone();
            let owned_chunk = chunk.to_string();
            let displaced = unit.displaced_chunk.clone();
            let removed = tokio::task::spawn_blocking(move || {
                worktrees.remove(&artifacts, &owned_chunk, displaced.as_deref())
            })
            .await;
            match removed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(chunk, error = %e, "failed to remove worktree during delete"),
                Err(e) => warn!(chunk, error = %e, "worktree removal task failed"),
            }
        }
        Ok(self.store.delete_work_unit(chunk).await?)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
