//! Resolve external artifact references and read their content.
//!
//! Task mode reads through the sibling checkouts in the task directory and
//! never touches the cache; single-repo mode clones/refreshes through the
//! repository cache. `at_pinned` reads content at the pinned SHA instead of
//! the referent's current state.

use crate::artifacts::is_external;
use crate::error::{Result, VeError};
use crate::external::load_external_ref;
use crate::git::{current_sha, show_file};
use crate::project::{load_task_config, resolve_repo_directory};
use crate::repo_cache::RepoCache;
use crate::types::ArtifactKind;
use std::path::Path;

/// A resolved external artifact with its content.
#[derive(Debug, Clone)]
pub struct ResolveResult {
    pub repo: String,
    pub artifact_id: String,
    pub track: String,
    pub resolved_sha: String,
    pub goal_content: Option<String>,
    pub plan_content: Option<String>,
}

/// Resolve an external chunk in task-directory mode.
pub fn resolve_task_directory(
    task_dir: &Path,
    local_chunk: &str,
    at_pinned: bool,
    project_filter: Option<&str>,
) -> Result<ResolveResult> {
    let config = load_task_config(task_dir)?;

    // `project:chunk` qualifies the search.
    let (project_filter, local_chunk) = match local_chunk.split_once(':') {
        Some((project, chunk)) => (Some(project), chunk),
        None => (project_filter, local_chunk),
    };

    let mut matches: Vec<(String, std::path::PathBuf)> = Vec::new();
    for project_ref in &config.projects {
        if let Some(filter) = project_filter {
            if project_ref != filter && !project_ref.ends_with(&format!("/{filter}")) {
                continue;
            }
        }
        let Ok(project_path) = resolve_repo_directory(task_dir, project_ref) else {
            continue;
        };
        let chunk_dir = project_path.join("docs/chunks").join(local_chunk);
        if chunk_dir.is_dir() {
            matches.push((project_ref.clone(), chunk_dir));
        }
    }

    if matches.is_empty() {
        return Err(VeError::not_found("chunk", local_chunk));
    }
    if matches.len() > 1 {
        let projects: Vec<&str> = matches.iter().map(|(p, _)| p.as_str()).collect();
        return Err(VeError::ValidationFailure {
            field: "chunk".to_string(),
            reason: format!(
                "chunk '{local_chunk}' exists in multiple projects: {}; qualify with project:chunk",
                projects.join(", ")
            ),
        });
    }

    let (_, chunk_dir) = matches.remove(0);
    let ext = require_external(&chunk_dir, local_chunk)?;

    let referent = resolve_repo_directory(task_dir, &ext.repo)?;
    let resolved_sha = if at_pinned {
        require_pinned(&ext, local_chunk)?
    } else {
        current_sha(&referent)?
    };

    let goal_rel = format!("docs/chunks/{}/GOAL.md", ext.artifact_id);
    let plan_rel = format!("docs/chunks/{}/PLAN.md", ext.artifact_id);

    let (goal_content, plan_content) = if at_pinned {
        (
            show_file(&referent, &resolved_sha, &goal_rel).ok(),
            show_file(&referent, &resolved_sha, &plan_rel).ok(),
        )
    } else {
        let goal_path = referent.join(&goal_rel);
        let plan_path = referent.join(&plan_rel);
        let goal = std::fs::read_to_string(&goal_path).ok();
        (goal, std::fs::read_to_string(&plan_path).ok())
    };

    if goal_content.is_none() {
        return Err(VeError::not_found(
            "external chunk",
            format!("{} in repository '{}'", ext.artifact_id, ext.repo),
        ));
    }

    Ok(ResolveResult {
        repo: ext.repo,
        artifact_id: ext.artifact_id,
        track: ext.track.unwrap_or_else(|| "main".to_string()),
        resolved_sha,
        goal_content,
        plan_content,
    })
}

/// Resolve an external chunk in single-repo mode, through the cache.
pub fn resolve_single_repo(
    project_dir: &Path,
    cache: &RepoCache,
    local_chunk: &str,
    at_pinned: bool,
) -> Result<ResolveResult> {
    let chunk_dir = project_dir.join("docs/chunks").join(local_chunk);
    if !chunk_dir.is_dir() {
        return Err(VeError::not_found("chunk", local_chunk));
    }
    let ext = require_external(&chunk_dir, local_chunk)?;

    let resolved_sha = if at_pinned {
        require_pinned(&ext, local_chunk)?
    } else {
        cache.resolve_ref(&ext.repo, ext.track.as_deref().unwrap_or("HEAD"))?
    };

    let goal_rel = format!("docs/chunks/{}/GOAL.md", ext.artifact_id);
    let plan_rel = format!("docs/chunks/{}/PLAN.md", ext.artifact_id);

    let goal_content = cache
        .get_file_at_ref(&ext.repo, &resolved_sha, &goal_rel)
        .map_err(|e| {
            VeError::not_found(
                "external chunk",
                format!("{} in repository '{}': {e}", ext.artifact_id, ext.repo),
            )
        })?;
    let plan_content = cache.get_file_at_ref(&ext.repo, &resolved_sha, &plan_rel).ok();

    Ok(ResolveResult {
        repo: ext.repo,
        artifact_id: ext.artifact_id,
        track: ext.track.unwrap_or_else(|| "main".to_string()),
        resolved_sha,
        goal_content: Some(goal_content),
        plan_content,
    })
}

fn require_external(
    chunk_dir: &Path,
    local_chunk: &str,
) -> Result<crate::types::ExternalArtifactRef> {
    if !is_external(chunk_dir, ArtifactKind::Chunk) {
        return Err(VeError::ValidationFailure {
            field: "chunk".to_string(),
            reason: format!(
                "chunk '{local_chunk}' is not an external reference (has GOAL.md instead of external.yaml)"
            ),
        });
    }
    load_external_ref(chunk_dir)
}

fn require_pinned(
    ext: &crate::types::ExternalArtifactRef,
    local_chunk: &str,
) -> Result<String> {
    ext.pinned.clone().ok_or_else(|| VeError::ValidationFailure {
        field: "pinned".to_string(),
        reason: format!("chunk '{local_chunk}' has no pinned SHA"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::create_external_ref;
    use crate::types::ExternalArtifactRef;
    use std::process::Command;
    use tempfile::TempDir;

    fn commit_all(dir: &Path, msg: &str) {
        for args in [vec!["add", "."], vec!["commit", "-q", "-m", msg]] {
            Command::new("git").args(&args).current_dir(dir).output().unwrap();
        }
    }

    fn task_fixture() -> (TempDir, String) {
        let task = TempDir::new().unwrap();
        std::fs::write(
            task.path().join(".ve-task.yaml"),
            "external_artifact_repo: acme/artifacts\nprojects: [acme/app]\n",
        )
        .unwrap();

        let artifacts = task.path().join("artifacts");
        let chunk = artifacts.join("docs/chunks/shared_work");
        std::fs::create_dir_all(&chunk).unwrap();
        std::fs::write(chunk.join("GOAL.md"), "---\nstatus: ACTIVE\n---\n\n# Shared\n").unwrap();
        std::fs::write(chunk.join("PLAN.md"), "# Plan\n").unwrap();
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "T"],
        ] {
            Command::new("git").args(&args).current_dir(&artifacts).output().unwrap();
        }
        commit_all(&artifacts, "seed");
        let head = current_sha(&artifacts).unwrap();

        let app = task.path().join("app");
        create_external_ref(
            &app,
            "shared_work",
            &ExternalArtifactRef {
                artifact_type: ArtifactKind::Chunk,
                artifact_id: "shared_work".to_string(),
                repo: "acme/artifacts".to_string(),
                track: Some("main".to_string()),
                pinned: Some(head.clone()),
                created_after: vec![],
            },
        )
        .unwrap();

        (task, head)
    }

    #[test]
    fn task_resolve_reads_working_tree() {
        let (task, head) = task_fixture();
        let result = resolve_task_directory(task.path(), "shared_work", false, None).unwrap();
        assert_eq!(result.repo, "acme/artifacts");
        assert_eq!(result.resolved_sha, head);
        assert!(result.goal_content.unwrap().contains("# Shared"));
        assert!(result.plan_content.unwrap().contains("# Plan"));
    }

    #[test]
    fn at_pinned_reads_committed_content() {
        let (task, head) = task_fixture();

        // Advance the working tree past the pin.
        let goal = task
            .path()
            .join("artifacts/docs/chunks/shared_work/GOAL.md");
        std::fs::write(&goal, "---\nstatus: ACTIVE\n---\n\n# Changed\n").unwrap();
        commit_all(&task.path().join("artifacts"), "change");

        let result = resolve_task_directory(task.path(), "shared_work", true, None).unwrap();
        assert_eq!(result.resolved_sha, head);
        assert!(result.goal_content.unwrap().contains("# Shared"));
    }

    #[test]
    fn local_chunk_is_rejected() {
        let (task, _) = task_fixture();
        let chunk = task.path().join("app/docs/chunks/local_only");
        std::fs::create_dir_all(&chunk).unwrap();
        std::fs::write(chunk.join("GOAL.md"), "---\nstatus: FUTURE\n---\n").unwrap();

        assert!(matches!(
            resolve_task_directory(task.path(), "local_only", false, None),
            Err(VeError::ValidationFailure { .. })
        ));
    }

    #[test]
    fn missing_chunk_is_not_found() {
        let (task, _) = task_fixture();
        assert!(matches!(
            resolve_task_directory(task.path(), "ghost", false, None),
            Err(VeError::NotFound { .. })
        ));
    }

    #[test]
    fn at_pinned_without_pin_is_rejected() {
        let (task, _) = task_fixture();
        let dir = task.path().join("app/docs/chunks/shared_work");
        let yaml = std::fs::read_to_string(dir.join("external.yaml")).unwrap();
        std::fs::write(
            dir.join("external.yaml"),
            yaml.lines()
                .filter(|l| !l.starts_with("pinned:"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
        .unwrap();

        assert!(matches!(
            resolve_task_directory(task.path(), "shared_work", true, None),
            Err(VeError::ValidationFailure { .. })
        ));
    }
}
