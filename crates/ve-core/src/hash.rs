//! Stable content hashing for artifact frontmatter files.
//!
//! Two modes, fixed per project: sha256 over the file bytes (default), or the
//! git object hash (stable across merges because git normalizes the blob).
//! Changing the mode invalidates every stored hash, which the index treats
//! as ordinary staleness.

use crate::error::{Result, VeError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    #[default]
    Sha256,
    Git,
}

impl HashMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Git => "git",
        }
    }
}

/// Hash a file's content under the given mode.
pub fn content_hash(path: &Path, mode: HashMode) -> Result<String> {
    match mode {
        HashMode::Sha256 => {
            let bytes = std::fs::read(path)
                .map_err(|e| VeError::io(path.display().to_string(), e))?;
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            Ok(format!("{:x}", hasher.finalize()))
        }
        HashMode::Git => {
            let output = Command::new("git")
                .args(["hash-object", "--"])
                .arg(path)
                .output()
                .map_err(|e| VeError::GitFailure {
                    op: "hash-object".to_string(),
                    detail: e.to_string(),
                })?;
            if !output.status.success() {
                return Err(VeError::GitFailure {
                    op: "hash-object".to_string(),
                    detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sha256_is_stable_and_content_sensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("GOAL.md");
        std::fs::write(&path, "---\nstatus: FUTURE\n---\n").unwrap();

        let h1 = content_hash(&path, HashMode::Sha256).unwrap();
        let h2 = content_hash(&path, HashMode::Sha256).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        std::fs::write(&path, "---\nstatus: ACTIVE\n---\n").unwrap();
        let h3 = content_hash(&path, HashMode::Sha256).unwrap();
        assert_ne!(h1, h3);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = content_hash(Path::new("/nonexistent/GOAL.md"), HashMode::Sha256);
        assert!(matches!(err, Err(VeError::Io { .. })));
    }
}
