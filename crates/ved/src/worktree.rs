//! Worktree lifecycle for work units.
//!
//! Each dispatched unit gets a git worktree at `.ve/worktrees/<chunk>` on a
//! `ve/<chunk>` branch created from the project's current HEAD. Because only
//! one chunk may hold IMPLEMENTING at a time, claiming a worktree displaces
//! any chunk currently in that state back to FUTURE; the displaced chunk is
//! recorded on the claiming unit and restored when the unit's worktree is
//! removed.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};
use ve_core::artifacts::ArtifactStore;
use ve_core::project::worktrees_dir;
use ve_core::{ArtifactKind, ChunkStatus, VeError};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git {op} failed: {detail}")]
    Git { op: String, detail: String },
    #[error("fast-forward merge of '{chunk}' failed: {detail}")]
    MergeConflict { chunk: String, detail: String },
    #[error(transparent)]
    Core(#[from] VeError),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Outcome of claiming a worktree.
#[derive(Debug, Clone)]
pub struct ClaimedWorktree {
    pub path: PathBuf,
    /// Chunk that was pushed out of IMPLEMENTING, if any.
    pub displaced_chunk: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    project_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn worktree_path(&self, chunk: &str) -> PathBuf {
        worktrees_dir(&self.project_dir).join(chunk)
    }

    fn branch_name(chunk: &str) -> String {
        format!("ve/{chunk}")
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .map_err(|e| WorktreeError::Git {
                op: args.first().copied().unwrap_or("git").to_string(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(WorktreeError::Git {
                op: args.first().copied().unwrap_or("git").to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create a worktree for `chunk` at the project's current HEAD,
    /// displacing any chunk currently marked IMPLEMENTING.
    ///
    /// Idempotent: a unit requeued mid-lifecycle keeps its existing worktree.
    pub fn claim(&self, store: &ArtifactStore, chunk: &str) -> Result<ClaimedWorktree> {
        let existing = self.worktree_path(chunk);
        if existing.is_dir() {
            return Ok(ClaimedWorktree {
                path: existing,
                displaced_chunk: None,
            });
        }

        let displaced = store.find_implementing_chunk(chunk)?;
        if let Some(displaced_chunk) = &displaced {
            info!(chunk, displaced = %displaced_chunk, "displacing implementing chunk");
            store.transition(ArtifactKind::Chunk, displaced_chunk, ChunkStatus::Future.as_str())?;
        }

        let path = self.worktree_path(chunk);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VeError::io(parent.display().to_string(), e))?;
        }

        let branch = Self::branch_name(chunk);
        if self.git(&["rev-parse", "--verify", &format!("refs/heads/{branch}")]).is_err() {
            self.git(&["branch", &branch, "HEAD"])?;
        }
        self.git(&[
            "worktree",
            "add",
            path.to_string_lossy().as_ref(),
            &branch,
        ])?;

        Ok(ClaimedWorktree {
            path,
            displaced_chunk: displaced,
        })
    }

    /// Fast-forward merge the unit's branch into the project's current
    /// branch. A non-fast-forward state surfaces as a conflict; the caller
    /// routes it to the attention queue.
    pub fn merge(&self, chunk: &str) -> Result<()> {
        let branch = Self::branch_name(chunk);
        self.git(&["merge", "--ff-only", &branch])
            .map_err(|e| WorktreeError::MergeConflict {
                chunk: chunk.to_string(),
                detail: e.to_string(),
            })?;
        Ok(())
    }

    /// Remove a unit's worktree and branch, restoring a displaced chunk to
    /// IMPLEMENTING when one was recorded.
    pub fn remove(
        &self,
        store: &ArtifactStore,
        chunk: &str,
        displaced_chunk: Option<&str>,
    ) -> Result<()> {
        let path = self.worktree_path(chunk);
        if path.exists() {
            self.git(&[
                "worktree",
                "remove",
                "--force",
                path.to_string_lossy().as_ref(),
            ])?;
        }
        let branch = Self::branch_name(chunk);
        if self
            .git(&["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .is_ok()
        {
            // Branch deletion is best-effort; a merged branch always deletes.
            if let Err(e) = self.git(&["branch", "-D", &branch]) {
                warn!(chunk, error = %e, "failed to delete worktree branch");
            }
        }

        if let Some(displaced) = displaced_chunk {
            match store.transition(
                ArtifactKind::Chunk,
                displaced,
                ChunkStatus::Implementing.as_str(),
            ) {
                Ok(_) => info!(chunk, displaced, "restored displaced chunk"),
                Err(e) => warn!(chunk, displaced, error = %e, "failed to restore displaced chunk"),
            }
        }
        Ok(())
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }
}
