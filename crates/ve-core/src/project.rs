//! Project and task context: root discovery, configuration, scaffolding.
//!
//! A project root is any directory containing `docs/trunk/GOAL.md`. A task
//! directory is a parent directory containing `.ve-task.yaml` plus sibling
//! working-tree checkouts of the repositories it names; its presence switches
//! external-reference resolution from the cache to the local filesystem.

use crate::error::{Result, VeError};
use crate::hash::HashMode;
use crate::types::validate_repo_ref;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Project-level settings from `.ve-config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VeConfig {
    pub hash_mode: HashMode,
    /// Minimum chunk count before subsystem clustering is suggested.
    pub cluster_subsystem_threshold: usize,
}

impl Default for VeConfig {
    fn default() -> Self {
        Self {
            hash_mode: HashMode::Sha256,
            cluster_subsystem_threshold: 10,
        }
    }
}

/// Load `.ve-config.yaml`, falling back to defaults when absent.
pub fn load_ve_config(project_dir: &Path) -> Result<VeConfig> {
    let path = project_dir.join(".ve-config.yaml");
    if !path.exists() {
        return Ok(VeConfig::default());
    }
    let content =
        std::fs::read_to_string(&path).map_err(|e| VeError::io(path.display().to_string(), e))?;
    serde_yaml::from_str(&content).map_err(|e| VeError::Frontmatter {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Schema of `.ve-task.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Repository holding the shared external artifacts, `org/name`.
    pub external_artifact_repo: String,
    /// Participating project repositories, `org/name` each. Non-empty.
    pub projects: Vec<String>,
}

/// Load and validate `.ve-task.yaml` from a task directory.
pub fn load_task_config(task_dir: &Path) -> Result<TaskConfig> {
    let path = task_dir.join(".ve-task.yaml");
    let content =
        std::fs::read_to_string(&path).map_err(|e| VeError::io(path.display().to_string(), e))?;
    let config: TaskConfig = serde_yaml::from_str(&content).map_err(|e| VeError::Frontmatter {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    if config.projects.is_empty() {
        return Err(VeError::ValidationFailure {
            field: "projects".to_string(),
            reason: "task configuration must name at least one project".to_string(),
        });
    }
    for repo in std::iter::once(&config.external_artifact_repo).chain(&config.projects) {
        validate_repo_ref(repo).map_err(|reason| VeError::ValidationFailure {
            field: "repo".to_string(),
            reason,
        })?;
    }
    Ok(config)
}

/// Resolve a repository reference to its checkout inside a task directory.
///
/// The checkout directory is the repository name (the part after the slash).
pub fn resolve_repo_directory(task_dir: &Path, repo: &str) -> Result<PathBuf> {
    let name = repo.rsplit('/').next().unwrap_or(repo);
    let path = task_dir.join(name);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(VeError::not_found("repository checkout", repo))
    }
}

/// Where a command is running: inside a single project, or inside a task
/// directory orchestrating several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Context {
    SingleRepo { project_dir: PathBuf },
    Task { task_dir: PathBuf },
}

/// Detect the execution context by walking upward from `start`.
///
/// A `.ve-task.yaml` wins over a project root; otherwise the first ancestor
/// containing `docs/trunk/GOAL.md` is the project root.
pub fn detect_context(start: &Path) -> Option<Context> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(".ve-task.yaml").exists() {
            return Some(Context::Task {
                task_dir: dir.to_path_buf(),
            });
        }
        if dir.join("docs/trunk/GOAL.md").exists() {
            return Some(Context::SingleRepo {
                project_dir: dir.to_path_buf(),
            });
        }
        current = dir.parent();
    }
    None
}

/// Find the enclosing project root, failing when there is none.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    match detect_context(start) {
        Some(Context::SingleRepo { project_dir }) => Ok(project_dir),
        _ => Err(VeError::not_found(
            "project root (docs/trunk/GOAL.md)",
            start.display().to_string(),
        )),
    }
}

// --- Scaffolding ---

/// Result of an init pass: what was written and what already existed.
#[derive(Debug, Clone, Default)]
pub struct InitResult {
    pub created: Vec<String>,
    pub skipped: Vec<String>,
}

const TRUNK_FILES: [(&str, &str); 4] = [
    ("GOAL.md", "# Project Goal\n\nDescribe what this project is for.\n"),
    ("SPEC.md", "# Specification\n\nRecord agreed behavior here.\n"),
    ("DECISIONS.md", "# Decisions\n\nRecord significant decisions here.\n"),
    (
        "TESTING_PHILOSOPHY.md",
        "# Testing Philosophy\n\nRecord how this project is tested.\n",
    ),
];

const GITIGNORE_ENTRIES: [&str; 2] = [".artifact-order.json", ".ve/"];

/// Initialize the project layout. Idempotent: existing files are skipped.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let mut result = InitResult::default();

    let trunk = project_dir.join("docs/trunk");
    std::fs::create_dir_all(&trunk).map_err(|e| VeError::io(trunk.display().to_string(), e))?;
    for (name, body) in TRUNK_FILES {
        let path = trunk.join(name);
        if path.exists() {
            result.skipped.push(format!("docs/trunk/{name}"));
        } else {
            std::fs::write(&path, body).map_err(|e| VeError::io(path.display().to_string(), e))?;
            result.created.push(format!("docs/trunk/{name}"));
        }
    }

    for kind_dir in ["chunks", "narratives", "subsystems", "investigations"] {
        let dir = project_dir.join("docs").join(kind_dir);
        if dir.exists() {
            result.skipped.push(format!("docs/{kind_dir}/"));
        } else {
            std::fs::create_dir_all(&dir)
                .map_err(|e| VeError::io(dir.display().to_string(), e))?;
            result.created.push(format!("docs/{kind_dir}/"));
        }
    }

    init_gitignore(project_dir, &mut result)?;
    Ok(result)
}

fn init_gitignore(project_dir: &Path, result: &mut InitResult) -> Result<()> {
    let path = project_dir.join(".gitignore");
    if path.exists() {
        let mut content = std::fs::read_to_string(&path)
            .map_err(|e| VeError::io(path.display().to_string(), e))?;
        let missing: Vec<&str> = GITIGNORE_ENTRIES
            .iter()
            .filter(|e| !content.contains(**e))
            .copied()
            .collect();
        if missing.is_empty() {
            result.skipped.push(".gitignore".to_string());
            return Ok(());
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&missing.join("\n"));
        content.push('\n');
        std::fs::write(&path, content).map_err(|e| VeError::io(path.display().to_string(), e))?;
        result.created.push(".gitignore".to_string());
    } else {
        std::fs::write(&path, GITIGNORE_ENTRIES.join("\n") + "\n")
            .map_err(|e| VeError::io(path.display().to_string(), e))?;
        result.created.push(".gitignore".to_string());
    }
    Ok(())
}

// --- Daemon runtime file locations (shared with the CLI client) ---

/// Directory for daemon runtime files.
pub fn ve_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".ve")
}

pub fn orchestrator_db_path(project_dir: &Path) -> PathBuf {
    ve_dir(project_dir).join("orchestrator.db")
}

pub fn orchestrator_pid_path(project_dir: &Path) -> PathBuf {
    ve_dir(project_dir).join("orchestrator.pid")
}

pub fn orchestrator_sock_path(project_dir: &Path) -> PathBuf {
    ve_dir(project_dir).join("orchestrator.sock")
}

pub fn orchestrator_port_path(project_dir: &Path) -> PathBuf {
    ve_dir(project_dir).join("orchestrator.port")
}

pub fn orchestrator_log_path(project_dir: &Path) -> PathBuf {
    ve_dir(project_dir).join("orchestrator.log")
}

pub fn worktrees_dir(project_dir: &Path) -> PathBuf {
    ve_dir(project_dir).join("worktrees")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_layout_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let first = init_project(dir.path()).unwrap();
        assert!(first.created.contains(&"docs/trunk/GOAL.md".to_string()));
        assert!(first.created.contains(&"docs/chunks/".to_string()));
        assert!(first.created.contains(&".gitignore".to_string()));
        assert!(first.skipped.is_empty());

        let second = init_project(dir.path()).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.skipped.len(), first.created.len());
    }

    #[test]
    fn gitignore_appends_missing_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target/\n").unwrap();
        init_project(dir.path()).unwrap();

        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(content.contains("target/"));
        assert!(content.contains(".artifact-order.json"));
        assert!(content.contains(".ve/"));
    }

    #[test]
    fn detect_context_walks_up_to_project_root() {
        let dir = TempDir::new().unwrap();
        init_project(dir.path()).unwrap();
        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();

        match detect_context(&nested) {
            Some(Context::SingleRepo { project_dir }) => assert_eq!(project_dir, dir.path()),
            other => panic!("expected single-repo context, got {other:?}"),
        }
    }

    #[test]
    fn task_yaml_wins_over_project_root() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".ve-task.yaml"),
            "external_artifact_repo: acme/artifacts\nprojects: [acme/app]\n",
        )
        .unwrap();
        let project = dir.path().join("app");
        std::fs::create_dir_all(&project).unwrap();
        init_project(&project).unwrap();

        // From inside the project, the project root is found first.
        match detect_context(&project) {
            Some(Context::SingleRepo { .. }) => {}
            other => panic!("expected single-repo, got {other:?}"),
        }
        // From the task dir itself, task mode is detected.
        match detect_context(dir.path()) {
            Some(Context::Task { task_dir }) => assert_eq!(task_dir, dir.path()),
            other => panic!("expected task context, got {other:?}"),
        }
    }

    #[test]
    fn task_config_requires_projects() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".ve-task.yaml"),
            "external_artifact_repo: acme/artifacts\nprojects: []\n",
        )
        .unwrap();
        assert!(matches!(
            load_task_config(dir.path()),
            Err(VeError::ValidationFailure { .. })
        ));
    }

    #[test]
    fn task_config_rejects_bad_repo_refs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".ve-task.yaml"),
            "external_artifact_repo: acme/artifacts\nprojects: [\"no spaces allowed/x y\"]\n",
        )
        .unwrap();
        assert!(load_task_config(dir.path()).is_err());
    }

    #[test]
    fn resolve_repo_directory_uses_name_segment() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("platform")).unwrap();
        let resolved = resolve_repo_directory(dir.path(), "acme/platform").unwrap();
        assert!(resolved.ends_with("platform"));
        assert!(resolve_repo_directory(dir.path(), "acme/missing").is_err());
    }

    #[test]
    fn ve_config_defaults_when_absent() {
        let dir = TempDir::new().unwrap();
        let config = load_ve_config(dir.path()).unwrap();
        assert_eq!(config.hash_mode, HashMode::Sha256);
    }

    #[test]
    fn ve_config_parses_hash_mode() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".ve-config.yaml"), "hash_mode: git\n").unwrap();
        let config = load_ve_config(dir.path()).unwrap();
        assert_eq!(config.hash_mode, HashMode::Git);
    }
}
