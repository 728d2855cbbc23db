//! Overlap detection: which earlier artifacts touch the same code as a chunk.
//!
//! Given a chunk, find every topologically-earlier ACTIVE chunk and STABLE
//! subsystem whose symbolic references hierarchically overlap the chunk's
//! references. When a chunk carries no `code_references`, its `code_paths`
//! stand in as file-level references.

use crate::artifacts::{is_external, read_created_after, ArtifactStore};
use crate::error::{Result, VeError};
use crate::index::transitive_predecessors;
use crate::refs::refs_overlap;
use crate::types::ArtifactKind;
use std::collections::BTreeMap;

/// One overlapping predecessor and the reference pairs that collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapHit {
    pub kind: ArtifactKind,
    pub short: String,
    /// `(probe_ref, candidate_ref)` pairs where containment held either way.
    pub overlapping: Vec<(String, String)>,
}

/// Detect overlaps for chunk `probe`.
///
/// Candidates are restricted to artifacts topologically earlier than the
/// probe (its transitive `created_after` ancestry for chunks; all STABLE
/// subsystems participate regardless of chunk ancestry since subsystem order
/// is a separate DAG). Results are sorted by kind then short name.
pub fn detect_overlaps(store: &ArtifactStore, probe: &str) -> Result<Vec<OverlapHit>> {
    let probe_fm = store.load_frontmatter(ArtifactKind::Chunk, probe)?;
    let probe_refs = probe_fm.effective_refs();
    if probe_refs.is_empty() {
        return Ok(Vec::new());
    }

    let mut hits = Vec::new();

    // Chunk candidates: ACTIVE ancestors of the probe.
    let deps = chunk_deps(store)?;
    let ancestors = transitive_predecessors(&deps, probe);
    for short in &ancestors {
        let dir = store.artifact_dir(ArtifactKind::Chunk, short);
        if is_external(&dir, ArtifactKind::Chunk) {
            continue;
        }
        let Ok(fm) = store.load_frontmatter(ArtifactKind::Chunk, short) else {
            continue;
        };
        if !fm.status.is_overlap_candidate(ArtifactKind::Chunk) {
            continue;
        }
        if let Some(hit) = match_refs(ArtifactKind::Chunk, short, &probe_refs, &fm.effective_refs())
        {
            hits.push(hit);
        }
    }

    // Subsystem candidates: every STABLE subsystem.
    for short in store.index().ordered(ArtifactKind::Subsystem)? {
        let dir = store.artifact_dir(ArtifactKind::Subsystem, &short);
        if is_external(&dir, ArtifactKind::Subsystem) {
            continue;
        }
        let Ok(fm) = store.load_frontmatter(ArtifactKind::Subsystem, &short) else {
            continue;
        };
        if !fm.status.is_overlap_candidate(ArtifactKind::Subsystem) {
            continue;
        }
        if let Some(hit) =
            match_refs(ArtifactKind::Subsystem, &short, &probe_refs, &fm.effective_refs())
        {
            hits.push(hit);
        }
    }

    hits.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.short.cmp(&b.short)));
    Ok(hits)
}

fn match_refs(
    kind: ArtifactKind,
    short: &str,
    probe_refs: &[String],
    candidate_refs: &[String],
) -> Option<OverlapHit> {
    let mut overlapping = Vec::new();
    for probe_ref in probe_refs {
        for candidate_ref in candidate_refs {
            if refs_overlap(probe_ref, candidate_ref) {
                overlapping.push((probe_ref.clone(), candidate_ref.clone()));
            }
        }
    }
    if overlapping.is_empty() {
        None
    } else {
        Some(OverlapHit {
            kind,
            short: short.to_string(),
            overlapping,
        })
    }
}

/// `created_after` map over every chunk that parses.
fn chunk_deps(store: &ArtifactStore) -> Result<BTreeMap<String, Vec<String>>> {
    let mut deps = BTreeMap::new();
    for short in store.index().ordered(ArtifactKind::Chunk)? {
        let dir = store.artifact_dir(ArtifactKind::Chunk, &short);
        match read_created_after(&dir, ArtifactKind::Chunk) {
            Ok(parents) => {
                deps.insert(short, parents);
            }
            Err(VeError::Frontmatter { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashMode;
    use serde_yaml::Value;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::new(dir.path(), HashMode::Sha256)
    }

    fn set_refs(dir: &TempDir, kind: ArtifactKind, short: &str, refs: &[&str]) {
        let yaml = refs
            .iter()
            .map(|r| format!("- ref: \"{r}\"\n  implements: \"behavior\""))
            .collect::<Vec<_>>()
            .join("\n");
        let value: Value = serde_yaml::from_str(&yaml).unwrap();
        let path = dir
            .path()
            .join("docs")
            .join(kind.dir_name())
            .join(short)
            .join(kind.main_file());
        crate::frontmatter::update_field(&path, "code_references", value).unwrap();
    }

    fn set_status(dir: &TempDir, kind: ArtifactKind, short: &str, status: &str) {
        let path = dir
            .path()
            .join("docs")
            .join(kind.dir_name())
            .join(short)
            .join(kind.main_file());
        crate::frontmatter::update_field(&path, "status", Value::String(status.to_string()))
            .unwrap();
    }

    #[test]
    fn symbol_containment_hits_older_chunk() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(ArtifactKind::Chunk, "older").unwrap();
        store.create(ArtifactKind::Chunk, "newer").unwrap();

        set_status(&dir, ArtifactKind::Chunk, "older", "ACTIVE");
        set_refs(&dir, ArtifactKind::Chunk, "older", &["src/main.py#Foo"]);
        set_refs(&dir, ArtifactKind::Chunk, "newer", &["src/main.py#Foo::bar"]);

        let hits = detect_overlaps(&store, "newer").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].short, "older");
        assert_eq!(
            hits[0].overlapping,
            vec![("src/main.py#Foo::bar".to_string(), "src/main.py#Foo".to_string())]
        );
    }

    #[test]
    fn disjoint_symbols_do_not_hit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(ArtifactKind::Chunk, "older").unwrap();
        store.create(ArtifactKind::Chunk, "newer").unwrap();

        set_status(&dir, ArtifactKind::Chunk, "older", "ACTIVE");
        set_refs(&dir, ArtifactKind::Chunk, "older", &["src/main.py#Foo"]);
        set_refs(&dir, ArtifactKind::Chunk, "newer", &["src/main.py#Bar"]);

        assert!(detect_overlaps(&store, "newer").unwrap().is_empty());
    }

    #[test]
    fn inactive_chunks_are_excluded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(ArtifactKind::Chunk, "older").unwrap();
        store.create(ArtifactKind::Chunk, "newer").unwrap();

        // FUTURE, not ACTIVE: excluded even though refs collide.
        set_refs(&dir, ArtifactKind::Chunk, "older", &["src/main.py#Foo"]);
        set_refs(&dir, ArtifactKind::Chunk, "newer", &["src/main.py#Foo"]);

        assert!(detect_overlaps(&store, "newer").unwrap().is_empty());
    }

    #[test]
    fn non_ancestor_chunks_are_excluded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(ArtifactKind::Chunk, "a").unwrap();
        store.create(ArtifactKind::Chunk, "b").unwrap();

        // b follows a; a overlapping with b counts for b, but b never counts
        // for a (a is not downstream of b).
        set_status(&dir, ArtifactKind::Chunk, "b", "ACTIVE");
        set_refs(&dir, ArtifactKind::Chunk, "a", &["src/x.rs"]);
        set_refs(&dir, ArtifactKind::Chunk, "b", &["src/x.rs"]);

        assert!(detect_overlaps(&store, "a").unwrap().is_empty());
    }

    #[test]
    fn stable_subsystem_participates() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(ArtifactKind::Chunk, "feature").unwrap();
        store.create(ArtifactKind::Subsystem, "storage").unwrap();

        for status in ["DOCUMENTED", "STABLE"] {
            set_status(&dir, ArtifactKind::Subsystem, "storage", status);
        }
        set_refs(&dir, ArtifactKind::Subsystem, "storage", &["src/store.rs"]);
        set_refs(&dir, ArtifactKind::Chunk, "feature", &["src/store.rs#Db::open"]);

        let hits = detect_overlaps(&store, "feature").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, ArtifactKind::Subsystem);
        assert_eq!(hits[0].short, "storage");
    }

    #[test]
    fn code_paths_fall_back_as_file_refs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(ArtifactKind::Chunk, "older").unwrap();
        store.create(ArtifactKind::Chunk, "newer").unwrap();

        set_status(&dir, ArtifactKind::Chunk, "older", "ACTIVE");
        let path = dir.path().join("docs/chunks/older/GOAL.md");
        crate::frontmatter::update_field(
            &path,
            "code_paths",
            serde_yaml::from_str("[src/main.py]").unwrap(),
        )
        .unwrap();
        set_refs(&dir, ArtifactKind::Chunk, "newer", &["src/main.py#Anything"]);

        let hits = detect_overlaps(&store, "newer").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].short, "older");
    }

    #[test]
    fn chunk_without_refs_has_no_overlaps() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.create(ArtifactKind::Chunk, "bare").unwrap();
        assert!(detect_overlaps(&store, "bare").unwrap().is_empty());
    }

    #[test]
    fn missing_probe_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(matches!(
            detect_overlaps(&store, "ghost"),
            Err(VeError::NotFound { .. })
        ));
    }
}
