//! Sync: advance external reference pins to the referent repositories' HEADs.
//!
//! Task mode resolves through the sibling checkouts in the task directory;
//! single-repo mode resolves through the user-global repository cache. A
//! failure on one external reference is recorded on that entry and does not
//! stop the rest; the overall run fails iff any entry errored.

use crate::error::Result;
use crate::external::{find_external_refs, load_external_ref, update_pinned};
use crate::git::current_sha;
use crate::project::{load_task_config, resolve_repo_directory};
use crate::repo_cache::RepoCache;
use crate::types::ArtifactKind;
use std::path::{Path, PathBuf};

/// Per-project git operations fan out over at most this many threads.
const SYNC_FAN_OUT: usize = 4;

/// Result of syncing one external reference.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub chunk_id: String,
    pub old_sha: String,
    pub new_sha: String,
    pub updated: bool,
    pub error: Option<String>,
}

impl SyncResult {
    fn failed(chunk_id: String, old_sha: String, error: String) -> Self {
        Self {
            chunk_id,
            old_sha,
            new_sha: String::new(),
            updated: false,
            error: Some(error),
        }
    }
}

/// Options shared by both sync modes.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Resolve and report, but do not rewrite any file.
    pub dry_run: bool,
    /// Restrict to these projects (task mode only).
    pub project_filter: Vec<String>,
    /// Restrict to these chunk short names.
    pub chunk_filter: Vec<String>,
}

/// Sync every external reference under a single project, resolving pins
/// through the repository cache.
pub fn sync_single_repo(
    project_dir: &Path,
    cache: &RepoCache,
    options: &SyncOptions,
) -> Result<Vec<SyncResult>> {
    Ok(sync_project_dir(project_dir, cache, options, None))
}

/// Sync every external reference across a task directory's projects,
/// resolving pins through the sibling checkouts.
///
/// Projects are processed with a bounded thread fan-out since each one may
/// touch several git repositories.
pub fn sync_task_directory(task_dir: &Path, options: &SyncOptions) -> Result<Vec<SyncResult>> {
    let config = load_task_config(task_dir)?;

    let projects: Vec<String> = config
        .projects
        .iter()
        .filter(|p| {
            options.project_filter.is_empty()
                || options.project_filter.iter().any(|f| {
                    f == *p || p.ends_with(&format!("/{f}"))
                })
        })
        .cloned()
        .collect();

    let mut results: Vec<SyncResult> = Vec::new();
    for batch in projects.chunks(SYNC_FAN_OUT) {
        let batch_results = std::thread::scope(|scope| {
            let handles: Vec<_> = batch
                .iter()
                .map(|project_ref| {
                    scope.spawn(move || {
                        let Ok(project_path) = resolve_repo_directory(task_dir, project_ref)
                        else {
                            // Checkouts absent from the task dir are skipped.
                            return Vec::new();
                        };
                        sync_project_dir(
                            &project_path,
                            &RepoCache::default(),
                            options,
                            Some((task_dir, project_ref.as_str())),
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap_or_default())
                .collect::<Vec<_>>()
        });
        results.extend(batch_results);
    }
    Ok(results)
}

/// Whether any entry in a sync run errored (drives the nonzero exit).
pub fn any_errors(results: &[SyncResult]) -> bool {
    results.iter().any(|r| r.error.is_some())
}

fn sync_project_dir(
    project_dir: &Path,
    cache: &RepoCache,
    options: &SyncOptions,
    task: Option<(&Path, &str)>,
) -> Vec<SyncResult> {
    let mut results = Vec::new();

    for external_yaml in find_external_refs(project_dir, ArtifactKind::Chunk) {
        let chunk_dir = external_yaml.parent().unwrap_or(project_dir);
        let short = chunk_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if !options.chunk_filter.is_empty() && !options.chunk_filter.contains(&short) {
            continue;
        }
        let chunk_id = match task {
            Some((_, project_ref)) => format!("{project_ref}:{short}"),
            None => short.clone(),
        };

        let ext = match load_external_ref(chunk_dir) {
            Ok(ext) => ext,
            Err(e) => {
                results.push(SyncResult::failed(chunk_id, String::new(), e.to_string()));
                continue;
            }
        };
        let old_sha = ext.pinned.clone().unwrap_or_default();

        let resolved = match task {
            Some((task_dir, _)) => resolve_in_task(task_dir, &ext.repo),
            None => cache
                .resolve_ref(&ext.repo, ext.track.as_deref().unwrap_or("HEAD"))
                .map_err(|e| e.to_string()),
        };
        let new_sha = match resolved {
            Ok(sha) => sha,
            Err(e) => {
                results.push(SyncResult::failed(chunk_id, old_sha, e));
                continue;
            }
        };

        let would_update = old_sha != new_sha;
        if would_update && !options.dry_run {
            if let Err(e) = update_pinned(&external_yaml, &new_sha) {
                results.push(SyncResult::failed(chunk_id, old_sha, e.to_string()));
                continue;
            }
        }

        results.push(SyncResult {
            chunk_id,
            old_sha,
            new_sha,
            updated: would_update,
            error: None,
        });
    }

    results
}

/// Task mode: the referent's pin is its checkout's current HEAD.
fn resolve_in_task(task_dir: &Path, repo: &str) -> std::result::Result<String, String> {
    let repo_path: PathBuf =
        resolve_repo_directory(task_dir, repo).map_err(|e| e.to_string())?;
    current_sha(&repo_path).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::create_external_ref;
    use crate::types::ExternalArtifactRef;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo(dir: &Path) -> String {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().unwrap();
        }
        std::fs::write(dir.join("x"), "1").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-q", "-m", "c1"]] {
            Command::new("git").args(&args).current_dir(dir).output().unwrap();
        }
        current_sha(dir).unwrap()
    }

    fn task_fixture() -> (TempDir, String) {
        let task = TempDir::new().unwrap();
        std::fs::write(
            task.path().join(".ve-task.yaml"),
            "external_artifact_repo: acme/artifacts\nprojects: [acme/app]\n",
        )
        .unwrap();

        let artifacts = task.path().join("artifacts");
        std::fs::create_dir_all(&artifacts).unwrap();
        let head = init_repo(&artifacts);

        let app = task.path().join("app");
        std::fs::create_dir_all(&app).unwrap();
        create_external_ref(
            &app,
            "remote_work",
            &ExternalArtifactRef {
                artifact_type: ArtifactKind::Chunk,
                artifact_id: "remote_work".to_string(),
                repo: "acme/artifacts".to_string(),
                track: Some("main".to_string()),
                pinned: Some("0".repeat(40)),
                created_after: vec![],
            },
        )
        .unwrap();

        (task, head)
    }

    #[test]
    fn task_sync_advances_pin_to_checkout_head() {
        let (task, head) = task_fixture();
        let results = sync_task_directory(task.path(), &SyncOptions::default()).unwrap();

        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.chunk_id, "acme/app:remote_work");
        assert_eq!(r.new_sha, head);
        assert!(r.updated);
        assert!(r.error.is_none());

        let ext = load_external_ref(
            &task.path().join("app/docs/chunks/remote_work"),
        )
        .unwrap();
        assert_eq!(ext.pinned.as_deref(), Some(head.as_str()));
    }

    #[test]
    fn sync_is_idempotent() {
        let (task, _head) = task_fixture();
        let first = sync_task_directory(task.path(), &SyncOptions::default()).unwrap();
        assert_eq!(first.iter().filter(|r| r.updated).count(), 1);

        let second = sync_task_directory(task.path(), &SyncOptions::default()).unwrap();
        assert_eq!(second.iter().filter(|r| r.updated).count(), 0);
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let (task, head) = task_fixture();
        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let results = sync_task_directory(task.path(), &options).unwrap();
        assert!(results[0].updated);
        assert_eq!(results[0].new_sha, head);

        let ext =
            load_external_ref(&task.path().join("app/docs/chunks/remote_work")).unwrap();
        assert_eq!(ext.pinned.as_deref(), Some("0".repeat(40).as_str()));
    }

    #[test]
    fn missing_referent_errors_that_entry_only() {
        let (task, _head) = task_fixture();
        // Second external pointing at a repo with no checkout.
        let app = task.path().join("app");
        create_external_ref(
            &app,
            "dangling",
            &ExternalArtifactRef {
                artifact_type: ArtifactKind::Chunk,
                artifact_id: "dangling".to_string(),
                repo: "acme/missing".to_string(),
                track: None,
                pinned: None,
                created_after: vec![],
            },
        )
        .unwrap();

        let results = sync_task_directory(task.path(), &SyncOptions::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(any_errors(&results));
        let ok = results.iter().find(|r| r.chunk_id.ends_with("remote_work")).unwrap();
        assert!(ok.error.is_none() && ok.updated);
        let bad = results.iter().find(|r| r.chunk_id.ends_with("dangling")).unwrap();
        assert!(bad.error.is_some());
    }

    #[test]
    fn chunk_filter_limits_entries() {
        let (task, _head) = task_fixture();
        let options = SyncOptions {
            chunk_filter: vec!["other".to_string()],
            ..SyncOptions::default()
        };
        let results = sync_task_directory(task.path(), &options).unwrap();
        assert!(results.is_empty());
    }
}
