//! User-global cache of external repository clones.
//!
//! Repositories live at `~/.ve/cache/repos/<org>/<repo>` as regular (not
//! bare) clones so content is readable from the filesystem. Every
//! `ensure_cached` refreshes the working tree with `fetch --all` followed by
//! `reset --hard origin/HEAD`; legacy bare clones are deleted and re-cloned.
//! Ref and file reads retry once after a fetch before giving up.

use crate::error::{Result, VeError};
use crate::git;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Access discipline is lock-free refresh-then-read, except cloning: an
/// in-flight clone is guarded by a lock file so two processes do not clone
/// the same repository into the same path.
const CLONE_LOCK_SUFFIX: &str = ".clone-lock";

#[derive(Debug, Clone)]
pub struct RepoCache {
    cache_dir: PathBuf,
}

impl Default for RepoCache {
    fn default() -> Self {
        Self::new(default_cache_dir())
    }
}

/// `~/.ve/cache/repos`.
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ve")
        .join("cache")
        .join("repos")
}

fn repo_to_url(repo: &str) -> String {
    if repo.starts_with("https://")
        || repo.starts_with("http://")
        || repo.starts_with("git@")
        || repo.starts_with("ssh://")
    {
        repo.to_string()
    } else {
        format!("https://github.com/{repo}.git")
    }
}

impl RepoCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Filesystem path for a cached repository. Does not touch the network.
    pub fn repo_path(&self, repo: &str) -> PathBuf {
        self.cache_dir.join(repo)
    }

    /// Clone the repository if absent; refresh it if present.
    ///
    /// On network failure during refresh the error is `CacheRefreshFailed`;
    /// callers may choose to proceed with the stale working tree.
    pub fn ensure_cached(&self, repo: &str) -> Result<PathBuf> {
        let path = self.repo_path(repo);

        if path.exists() {
            if git::is_bare_repository(&path) {
                // Legacy bare clone: replace with a working clone.
                std::fs::remove_dir_all(&path)
                    .map_err(|e| VeError::io(path.display().to_string(), e))?;
            } else {
                self.refresh(repo, &path)?;
                return Ok(path);
            }
        }

        self.clone_repo(repo, &path)?;
        Ok(path)
    }

    fn refresh(&self, repo: &str, path: &Path) -> Result<()> {
        let refresh_failed = |detail: String| VeError::CacheRefreshFailed {
            repo: repo.to_string(),
            detail,
        };
        git::run_git(path, &["fetch", "--all", "--quiet"])
            .map_err(|e| refresh_failed(e.to_string()))?;
        git::run_git(path, &["reset", "--hard", "origin/HEAD"])
            .map_err(|e| refresh_failed(e.to_string()))?;
        Ok(())
    }

    fn clone_repo(&self, repo: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VeError::io(parent.display().to_string(), e))?;
        }

        let lock_path = path.with_extension(CLONE_LOCK_SUFFIX.trim_start_matches('.'));
        let _lock = CloneLock::acquire(&lock_path)?;

        // Another process may have finished the clone while we waited.
        if path.exists() {
            return Ok(());
        }

        let url = repo_to_url(repo);
        let output = Command::new("git")
            .args(["clone", "--quiet", &url])
            .arg(path)
            .output()
            .map_err(|e| VeError::GitFailure {
                op: "clone".to_string(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(VeError::GitFailure {
                op: "clone".to_string(),
                detail: format!(
                    "'{repo}': {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    /// Resolve a ref to a full SHA, fetching once on a miss.
    pub fn resolve_ref(&self, repo: &str, ref_: &str) -> Result<String> {
        let path = self.ensure_cached(repo)?;
        match git::resolve_local_ref(&path, ref_) {
            Ok(sha) => Ok(sha),
            Err(first) => {
                // Unknown ref may exist upstream; fetch and reprobe once.
                if git::run_git(&path, &["fetch", "--all", "--quiet"]).is_err() {
                    return Err(first);
                }
                git::resolve_local_ref(&path, ref_).map_err(|_| VeError::GitFailure {
                    op: "rev-parse".to_string(),
                    detail: format!("cannot resolve ref '{ref_}' in '{repo}'"),
                })
            }
        }
    }

    /// Read a file at a ref, fetching once on the first miss.
    /// Empty content is a valid value.
    pub fn get_file_at_ref(&self, repo: &str, ref_: &str, file_path: &str) -> Result<String> {
        let path = self.ensure_cached(repo)?;
        match git::show_file(&path, ref_, file_path) {
            Ok(content) => Ok(content),
            Err(first) => {
                if git::run_git(&path, &["fetch", "--all", "--quiet"]).is_err() {
                    return Err(first);
                }
                git::show_file(&path, ref_, file_path).map_err(|_| VeError::GitFailure {
                    op: "show".to_string(),
                    detail: format!("cannot read '{file_path}' at '{ref_}' in '{repo}'"),
                })
            }
        }
    }

    /// List a directory at a ref, fetching once on the first miss.
    pub fn list_dir_at_ref(&self, repo: &str, ref_: &str, dir_path: &str) -> Result<Vec<String>> {
        let path = self.ensure_cached(repo)?;
        match git::ls_tree(&path, ref_, dir_path) {
            Ok(names) => Ok(names),
            Err(first) => {
                if git::run_git(&path, &["fetch", "--all", "--quiet"]).is_err() {
                    return Err(first);
                }
                git::ls_tree(&path, ref_, dir_path).map_err(|_| VeError::GitFailure {
                    op: "ls-tree".to_string(),
                    detail: format!("cannot list '{dir_path}' at '{ref_}' in '{repo}'"),
                })
            }
        }
    }
}

/// Exclusive-create lock file held for the duration of a clone.
struct CloneLock {
    path: PathBuf,
}

impl CloneLock {
    fn acquire(path: &Path) -> Result<Self> {
        // Bounded wait: a competing clone either finishes or we give up.
        for _ in 0..600 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                Err(e) => return Err(VeError::io(path.display().to_string(), e)),
            }
        }
        Err(VeError::GitFailure {
            op: "clone".to_string(),
            detail: format!("timed out waiting for clone lock {}", path.display()),
        })
    }
}

impl Drop for CloneLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
