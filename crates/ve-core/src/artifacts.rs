//! Artifact store: creation, listing, and lifecycle transitions.
//!
//! Artifacts live at `docs/<kind-dir>/<short>/` with a main document
//! (`GOAL.md` for chunks, `OVERVIEW.md` otherwise) or an `external.yaml`
//! pointer. All mutation here is frontmatter-only.

use crate::error::{Result, VeError};
use crate::frontmatter;
use crate::hash::HashMode;
use crate::index::ArtifactIndex;
use crate::symbols::extract_symbols;
use crate::types::{
    validate_short_name, ArtifactFrontmatter, ArtifactKind, ChunkStatus, InvestigationStatus,
    NarrativeStatus, RawStatus, SubsystemStatus,
};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

// --- Directory-level helpers (shared with the index) ---

/// Directory holding all artifacts of a kind.
pub fn kind_dir(project_dir: &Path, kind: ArtifactKind) -> PathBuf {
    project_dir.join("docs").join(kind.dir_name())
}

/// Sorted short names of every artifact directory of a kind.
pub fn enumerate_kind(project_dir: &Path, kind: ArtifactKind) -> Vec<String> {
    let dir = kind_dir(project_dir, kind);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .collect();
    names.sort();
    names
}

/// An artifact directory is external iff `external.yaml` exists and the main
/// document does not.
pub fn is_external(dir: &Path, kind: ArtifactKind) -> bool {
    dir.join("external.yaml").exists() && !dir.join(kind.main_file()).exists()
}

/// The file whose content identifies this artifact: the main document, or
/// `external.yaml` for pointers.
pub fn frontmatter_file(dir: &Path, kind: ArtifactKind) -> Option<PathBuf> {
    let main = dir.join(kind.main_file());
    if main.exists() {
        return Some(main);
    }
    let external = dir.join("external.yaml");
    external.exists().then_some(external)
}

/// Read an artifact's `created_after` edges, from the main document's
/// frontmatter or from `external.yaml` for pointers.
pub fn read_created_after(dir: &Path, kind: ArtifactKind) -> Result<Vec<String>> {
    if is_external(dir, kind) {
        let ext = crate::external::load_external_ref(dir)?;
        return Ok(ext.created_after);
    }
    let fm: ArtifactFrontmatter = frontmatter::read_typed(&dir.join(kind.main_file()))?;
    Ok(fm.created_after)
}

/// Validate a proposed status transition against the kind's table.
pub fn check_transition(kind: ArtifactKind, from: &str, to: &str) -> Result<()> {
    fn check<S: Copy + PartialEq + 'static>(
        kind: ArtifactKind,
        from: &str,
        to: &str,
        parse: impl Fn(&str) -> Option<S>,
        transitions: impl Fn(S) -> &'static [S],
        as_str: impl Fn(S) -> &'static str,
    ) -> Result<()> {
        let from_status = parse(from).ok_or_else(|| VeError::ValidationFailure {
            field: "status".to_string(),
            reason: format!("'{from}' is not a valid {kind} status"),
        })?;
        let to_status = parse(to).ok_or_else(|| VeError::ValidationFailure {
            field: "status".to_string(),
            reason: format!("'{to}' is not a valid {kind} status"),
        })?;
        let allowed = transitions(from_status);
        if allowed.contains(&to_status) {
            Ok(())
        } else {
            let names: Vec<&str> = allowed.iter().map(|s| as_str(*s)).collect();
            Err(VeError::illegal_transition(kind, from, to, &names))
        }
    }

    match kind {
        ArtifactKind::Chunk => check(
            kind,
            from,
            to,
            ChunkStatus::parse,
            |s| s.valid_transitions(),
            |s| s.as_str(),
        ),
        ArtifactKind::Narrative => check(
            kind,
            from,
            to,
            NarrativeStatus::parse,
            |s| s.valid_transitions(),
            |s| s.as_str(),
        ),
        ArtifactKind::Subsystem => check(
            kind,
            from,
            to,
            SubsystemStatus::parse,
            |s| s.valid_transitions(),
            |s| s.as_str(),
        ),
        ArtifactKind::Investigation => check(
            kind,
            from,
            to,
            InvestigationStatus::parse,
            |s| s.valid_transitions(),
            |s| s.as_str(),
        ),
    }
}

// --- Listing ---

/// One row of an artifact listing.
#[derive(Debug, Clone)]
pub enum ArtifactListing {
    Local { short: String, status: RawStatus },
    External { short: String, repo: String, artifact_id: String },
}

impl ArtifactListing {
    pub fn short(&self) -> &str {
        match self {
            Self::Local { short, .. } | Self::External { short, .. } => short,
        }
    }
}

// --- Store ---

/// Filesystem-backed store for one project's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    project_dir: PathBuf,
    index: ArtifactIndex,
}

impl ArtifactStore {
    pub fn new(project_dir: impl Into<PathBuf>, hash_mode: HashMode) -> Self {
        let project_dir = project_dir.into();
        let index = ArtifactIndex::new(&project_dir, hash_mode);
        Self { project_dir, index }
    }

    pub fn index(&self) -> &ArtifactIndex {
        &self.index
    }

    pub fn artifact_dir(&self, kind: ArtifactKind, short: &str) -> PathBuf {
        kind_dir(&self.project_dir, kind).join(short)
    }

    /// Whether an artifact exists (local or external).
    pub fn exists(&self, kind: ArtifactKind, short: &str) -> bool {
        frontmatter_file(&self.artifact_dir(kind, short), kind).is_some()
    }

    /// Create a new artifact: directory, main document, and frontmatter with
    /// `created_after` set to the kind's current tip set.
    pub fn create(&self, kind: ArtifactKind, short: &str) -> Result<PathBuf> {
        validate_short_name(short).map_err(|reason| VeError::ValidationFailure {
            field: "short_name".to_string(),
            reason,
        })?;

        let dir = self.artifact_dir(kind, short);
        if dir.exists() {
            return Err(VeError::CollisionDetected {
                kind,
                name: short.to_string(),
            });
        }

        // Tips are computed before the new directory exists.
        let tips = self.index.tips(kind)?;

        std::fs::create_dir_all(&dir).map_err(|e| VeError::io(dir.display().to_string(), e))?;

        let mut fm = Mapping::new();
        fm.insert(
            Value::String("status".to_string()),
            Value::String(kind.initial_status().to_string()),
        );
        fm.insert(
            Value::String("created_after".to_string()),
            Value::Sequence(tips.into_iter().map(Value::String).collect()),
        );
        if kind == ArtifactKind::Chunk {
            fm.insert(Value::String("ticket".to_string()), Value::Null);
            fm.insert(Value::String("parent_chunk".to_string()), Value::Null);
            fm.insert(
                Value::String("code_paths".to_string()),
                Value::Sequence(Vec::new()),
            );
            fm.insert(
                Value::String("code_references".to_string()),
                Value::Sequence(Vec::new()),
            );
            fm.insert(Value::String("narrative".to_string()), Value::Null);
            fm.insert(
                Value::String("subsystems".to_string()),
                Value::Sequence(Vec::new()),
            );
        }
        if kind == ArtifactKind::Subsystem {
            fm.insert(
                Value::String("code_references".to_string()),
                Value::Sequence(Vec::new()),
            );
        }

        let body = match kind {
            ArtifactKind::Chunk => format!("\n# Chunk Goal\n\nGoal for `{short}`.\n"),
            ArtifactKind::Narrative => format!("\n# Narrative\n\nNarrative `{short}`.\n"),
            ArtifactKind::Subsystem => format!("\n# Subsystem Overview\n\nSubsystem `{short}`.\n"),
            ArtifactKind::Investigation => {
                format!("\n# Investigation\n\nInvestigation `{short}`.\n")
            }
        };
        let main = dir.join(kind.main_file());
        frontmatter::create_document(&main, &fm, &body)?;

        Ok(dir)
    }

    /// List artifacts of a kind in topological order.
    pub fn list(&self, kind: ArtifactKind) -> Result<Vec<ArtifactListing>> {
        let ordered = self.index.ordered(kind)?;
        let mut rows = Vec::with_capacity(ordered.len());
        for short in ordered {
            let dir = self.artifact_dir(kind, &short);
            if is_external(&dir, kind) {
                let ext = crate::external::load_external_ref(&dir)?;
                rows.push(ArtifactListing::External {
                    short,
                    repo: ext.repo,
                    artifact_id: ext.artifact_id,
                });
            } else {
                let status = self.status(kind, &short)?;
                rows.push(ArtifactListing::Local { short, status });
            }
        }
        Ok(rows)
    }

    /// Parse an artifact's frontmatter into the typed projection.
    pub fn load_frontmatter(&self, kind: ArtifactKind, short: &str) -> Result<ArtifactFrontmatter> {
        let dir = self.artifact_dir(kind, short);
        let main = dir.join(kind.main_file());
        if !main.exists() {
            return Err(VeError::not_found(kind.as_str(), short));
        }
        frontmatter::read_typed(&main)
    }

    /// Current status of a local artifact.
    pub fn status(&self, kind: ArtifactKind, short: &str) -> Result<RawStatus> {
        Ok(self.load_frontmatter(kind, short)?.status)
    }

    /// Transition an artifact's status, enforcing the per-kind table.
    ///
    /// Returns `(old, new)`. Chunks moving into IMPLEMENTING additionally
    /// require that no sibling chunk is currently IMPLEMENTING.
    pub fn transition(
        &self,
        kind: ArtifactKind,
        short: &str,
        new_status: &str,
    ) -> Result<(String, String)> {
        let old_status = self.status(kind, short)?.0;
        check_transition(kind, &old_status, new_status)?;

        if kind == ArtifactKind::Chunk && new_status == ChunkStatus::Implementing.as_str() {
            if let Some(other) = self.find_implementing_chunk(short)? {
                return Err(VeError::ValidationFailure {
                    field: "status".to_string(),
                    reason: format!(
                        "chunk '{other}' is already IMPLEMENTING; only one chunk may be implementing at a time"
                    ),
                });
            }
        }

        let dir = self.artifact_dir(kind, short);
        frontmatter::update_field(
            &dir.join(kind.main_file()),
            "status",
            Value::String(new_status.to_string()),
        )?;
        Ok((old_status, new_status.to_string()))
    }

    /// Find a chunk other than `except` currently in IMPLEMENTING.
    pub fn find_implementing_chunk(&self, except: &str) -> Result<Option<String>> {
        for short in enumerate_kind(&self.project_dir, ArtifactKind::Chunk) {
            if short == except {
                continue;
            }
            let dir = self.artifact_dir(ArtifactKind::Chunk, &short);
            if is_external(&dir, ArtifactKind::Chunk) {
                continue;
            }
            // Malformed siblings are ignored here; the index surfaces them.
            if let Ok(status) = self.status(ArtifactKind::Chunk, &short) {
                if status.0 == ChunkStatus::Implementing.as_str() {
                    return Ok(Some(short));
                }
            }
        }
        Ok(None)
    }

    /// Check an artifact's symbolic references against the symbols actually
    /// defined in the referenced files. Returns the unresolvable references.
    ///
    /// File-only references resolve iff the file exists. References into
    /// files with no registered extractor are accepted as-is.
    pub fn validate_references(&self, kind: ArtifactKind, short: &str) -> Result<Vec<String>> {
        let fm = self.load_frontmatter(kind, short)?;
        let mut unresolved = Vec::new();
        for raw in fm.effective_refs() {
            let parsed = crate::refs::CodeRef::parse(&raw);
            let file_path = self.project_dir.join(parsed.file);
            if !file_path.exists() {
                unresolved.push(raw.clone());
                continue;
            }
            if let Some(symbol) = parsed.symbol {
                let symbols = extract_symbols(&file_path);
                if symbols.is_empty() {
                    // No extractor for this file type; accept.
                    continue;
                }
                let covered = symbols.iter().any(|s| {
                    s == symbol || s.starts_with(symbol) && s[symbol.len()..].starts_with("::")
                });
                if !covered {
                    unresolved.push(raw.clone());
                }
            }
        }
        Ok(unresolved)
    }
}
