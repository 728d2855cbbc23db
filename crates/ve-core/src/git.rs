//! Local git helpers.
//!
//! Thin subprocess wrappers over `git` for repositories and worktrees on the
//! local filesystem. Network-facing operations live in `repo_cache`.

use crate::error::{Result, VeError};
use std::path::Path;
use std::process::Command;

fn git_failure(op: &str, stderr: &[u8]) -> VeError {
    let detail = String::from_utf8_lossy(stderr).trim().to_string();
    VeError::GitFailure {
        op: op.to_string(),
        detail: if detail.is_empty() {
            "git returned nonzero".to_string()
        } else {
            detail
        },
    }
}

/// Run a git command in a directory, returning trimmed stdout.
pub fn run_git(repo_path: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .map_err(|e| VeError::GitFailure {
            op: args.first().copied().unwrap_or("git").to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(git_failure(args.first().copied().unwrap_or("git"), &output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// HEAD SHA of a local repository or worktree.
pub fn current_sha(repo_path: &Path) -> Result<String> {
    if !repo_path.is_dir() {
        return Err(VeError::GitFailure {
            op: "rev-parse".to_string(),
            detail: format!("path does not exist: {}", repo_path.display()),
        });
    }
    let sha = run_git(repo_path, &["rev-parse", "HEAD"])?;
    validate_sha_format(&sha)?;
    Ok(sha)
}

/// Resolve a ref (branch, tag, symbolic) to its SHA in a local repository.
pub fn resolve_local_ref(repo_path: &Path, ref_: &str) -> Result<String> {
    let sha = run_git(repo_path, &["rev-parse", ref_])?;
    validate_sha_format(&sha)?;
    Ok(sha)
}

/// Whether a path is a git repository (or worktree).
pub fn is_git_repository(path: &Path) -> bool {
    path.is_dir()
        && Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
}

/// Whether a repository is a bare clone.
pub fn is_bare_repository(path: &Path) -> bool {
    run_git(path, &["rev-parse", "--is-bare-repository"])
        .map(|out| out.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Read a file at a specific ref via `git show`. Empty content is valid.
pub fn show_file(repo_path: &Path, ref_: &str, file_path: &str) -> Result<String> {
    let output = Command::new("git")
        .args(["show", &format!("{ref_}:{file_path}")])
        .current_dir(repo_path)
        .output()
        .map_err(|e| VeError::GitFailure {
            op: "show".to_string(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(git_failure("show", &output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// List filenames in a directory at a specific ref via `git ls-tree`.
pub fn ls_tree(repo_path: &Path, ref_: &str, dir_path: &str) -> Result<Vec<String>> {
    let dir = dir_path.trim_end_matches('/');
    let listing = run_git(repo_path, &["ls-tree", "--name-only", ref_, &format!("{dir}/")])?;
    Ok(listing
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| l.rsplit('/').next())
        .map(String::from)
        .collect())
}

fn validate_sha_format(sha: &str) -> Result<()> {
    if sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(VeError::GitFailure {
            op: "rev-parse".to_string(),
            detail: format!("unexpected SHA format: {sha}"),
        })
    }
}
