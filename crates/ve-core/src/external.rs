//! External artifact references: `external.yaml` pointer files.
//!
//! An artifact directory containing `external.yaml` but no main document is a
//! pure pointer into another repository, optionally pinned to a commit SHA.

use crate::error::{Result, VeError};
use crate::types::{validate_repo_ref, ArtifactKind, ExternalArtifactRef};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

/// Load and validate `external.yaml` from an artifact directory.
pub fn load_external_ref(dir: &Path) -> Result<ExternalArtifactRef> {
    let path = dir.join("external.yaml");
    if !path.exists() {
        return Err(VeError::not_found("external reference", dir.display().to_string()));
    }
    let content =
        std::fs::read_to_string(&path).map_err(|e| VeError::io(path.display().to_string(), e))?;
    let ext: ExternalArtifactRef =
        serde_yaml::from_str(&content).map_err(|e| VeError::Frontmatter {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    validate_repo_ref(&ext.repo).map_err(|reason| VeError::ValidationFailure {
        field: "repo".to_string(),
        reason,
    })?;
    if let Some(pinned) = &ext.pinned {
        validate_sha(pinned)?;
    }
    Ok(ext)
}

/// Create an `external.yaml` pointer under `docs/<kind-dir>/<short>/`.
pub fn create_external_ref(
    project_dir: &Path,
    short: &str,
    ext: &ExternalArtifactRef,
) -> Result<PathBuf> {
    validate_repo_ref(&ext.repo).map_err(|reason| VeError::ValidationFailure {
        field: "repo".to_string(),
        reason,
    })?;
    if let Some(pinned) = &ext.pinned {
        validate_sha(pinned)?;
    }

    let dir = project_dir
        .join("docs")
        .join(ext.artifact_type.dir_name())
        .join(short);
    std::fs::create_dir_all(&dir).map_err(|e| VeError::io(dir.display().to_string(), e))?;

    let path = dir.join("external.yaml");
    let yaml = serde_yaml::to_string(ext)?;
    std::fs::write(&path, yaml).map_err(|e| VeError::io(path.display().to_string(), e))?;
    Ok(path)
}

/// Rewrite the `pinned` field of an `external.yaml`, preserving other fields.
///
/// Returns false when the file already pins `new_sha`.
pub fn update_pinned(external_yaml: &Path, new_sha: &str) -> Result<bool> {
    validate_sha(new_sha)?;
    let content = std::fs::read_to_string(external_yaml)
        .map_err(|e| VeError::io(external_yaml.display().to_string(), e))?;
    let mut value: Value = serde_yaml::from_str(&content)?;
    let Value::Mapping(ref mut mapping) = value else {
        return Err(VeError::Frontmatter {
            path: external_yaml.display().to_string(),
            reason: "external.yaml is not a mapping".to_string(),
        });
    };

    let key = Value::String("pinned".to_string());
    if mapping.get(&key) == Some(&Value::String(new_sha.to_string())) {
        return Ok(false);
    }
    mapping.insert(key, Value::String(new_sha.to_string()));

    let yaml = serde_yaml::to_string(&value)?;
    std::fs::write(external_yaml, yaml)
        .map_err(|e| VeError::io(external_yaml.display().to_string(), e))?;
    Ok(true)
}

/// Find every external pointer of a kind in a project.
pub fn find_external_refs(project_dir: &Path, kind: ArtifactKind) -> Vec<PathBuf> {
    crate::artifacts::enumerate_kind(project_dir, kind)
        .into_iter()
        .map(|short| {
            project_dir
                .join("docs")
                .join(kind.dir_name())
                .join(short)
        })
        .filter(|dir| crate::artifacts::is_external(dir, kind))
        .map(|dir| dir.join("external.yaml"))
        .collect()
}

fn validate_sha(sha: &str) -> Result<()> {
    if sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(VeError::ValidationFailure {
            field: "pinned".to_string(),
            reason: format!("'{sha}' is not a 40-hex commit SHA"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_ref() -> ExternalArtifactRef {
        ExternalArtifactRef {
            artifact_type: ArtifactKind::Chunk,
            artifact_id: "remote_feature".to_string(),
            repo: "acme/platform".to_string(),
            track: Some("main".to_string()),
            pinned: Some("a".repeat(40)),
            created_after: vec![],
        }
    }

    #[test]
    fn create_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let ext = sample_ref();
        let path = create_external_ref(dir.path(), "remote_feature", &ext).unwrap();
        assert!(path.ends_with("docs/chunks/remote_feature/external.yaml"));

        let loaded = load_external_ref(path.parent().unwrap()).unwrap();
        assert_eq!(loaded, ext);
    }

    #[test]
    fn update_pinned_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = create_external_ref(dir.path(), "remote_feature", &sample_ref()).unwrap();

        let new_sha = "b".repeat(40);
        assert!(update_pinned(&path, &new_sha).unwrap());
        assert!(!update_pinned(&path, &new_sha).unwrap());

        let loaded = load_external_ref(path.parent().unwrap()).unwrap();
        assert_eq!(loaded.pinned.as_deref(), Some(new_sha.as_str()));
        // Other fields survive the rewrite.
        assert_eq!(loaded.track.as_deref(), Some("main"));
    }

    #[test]
    fn malformed_sha_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ext = sample_ref();
        ext.pinned = Some("not-a-sha".to_string());
        assert!(matches!(
            create_external_ref(dir.path(), "x", &ext),
            Err(VeError::ValidationFailure { .. })
        ));
    }

    #[test]
    fn bad_repo_ref_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ext = sample_ref();
        ext.repo = "not-org-name".to_string();
        assert!(matches!(
            create_external_ref(dir.path(), "x", &ext),
            Err(VeError::ValidationFailure { .. })
        ));
    }

    #[test]
    fn external_detection_requires_missing_main_file() {
        let dir = TempDir::new().unwrap();
        let path = create_external_ref(dir.path(), "ptr", &sample_ref()).unwrap();
        let artifact_dir = path.parent().unwrap();
        assert!(crate::artifacts::is_external(artifact_dir, ArtifactKind::Chunk));

        // Adding a GOAL.md makes it a local artifact again.
        std::fs::write(artifact_dir.join("GOAL.md"), "---\nstatus: FUTURE\n---\n").unwrap();
        assert!(!crate::artifacts::is_external(artifact_dir, ArtifactKind::Chunk));
    }

    #[test]
    fn find_external_refs_lists_only_pointers() {
        let dir = TempDir::new().unwrap();
        create_external_ref(dir.path(), "ptr", &sample_ref()).unwrap();
        let local = dir.path().join("docs/chunks/local");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("GOAL.md"), "---\nstatus: FUTURE\n---\n").unwrap();

        let refs = find_external_refs(dir.path(), ArtifactKind::Chunk);
        assert_eq!(refs.len(), 1);
        assert!(refs[0].ends_with("docs/chunks/ptr/external.yaml"));
    }
}
