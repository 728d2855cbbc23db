//! Artifact index: the causal DAG over `created_after` edges.
//!
//! For each kind the index materializes a topological order, the tip set
//! (artifacts no sibling lists in `created_after`), and a content hash per
//! artifact. The whole structure is cached in `.artifact-order.json` at the
//! project root and rebuilt only when the directory set or any hash drifts.

use crate::artifacts::{enumerate_kind, frontmatter_file, read_created_after};
use crate::error::{Result, VeError};
use crate::hash::{content_hash, HashMode};
use crate::types::ArtifactKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

/// Cache file name at the project root.
pub const INDEX_FILE_NAME: &str = ".artifact-order.json";

/// Schema version of the cache file. Bumping it invalidates old caches.
const INDEX_VERSION: u32 = 2;

/// Per-kind materialized ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindIndex {
    pub ordered: Vec<String>,
    pub tips: Vec<String>,
    pub hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    kinds: BTreeMap<String, KindIndex>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            kinds: BTreeMap::new(),
        }
    }
}

/// Result of building one kind: the index plus warnings for artifacts that
/// were skipped (malformed frontmatter does not fail the whole kind).
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub index: KindIndex,
    pub warnings: Vec<String>,
}

/// Content-hash-backed index over a project's artifact DAGs.
#[derive(Debug, Clone)]
pub struct ArtifactIndex {
    project_dir: PathBuf,
    hash_mode: HashMode,
}

impl ArtifactIndex {
    pub fn new(project_dir: impl Into<PathBuf>, hash_mode: HashMode) -> Self {
        Self {
            project_dir: project_dir.into(),
            hash_mode,
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.project_dir.join(INDEX_FILE_NAME)
    }

    /// Topologically ordered short names for a kind, rebuilding if stale.
    pub fn ordered(&self, kind: ArtifactKind) -> Result<Vec<String>> {
        Ok(self.ensure_fresh(kind)?.index.ordered)
    }

    /// The tip set for a kind: the antichain of sinks.
    pub fn tips(&self, kind: ArtifactKind) -> Result<Vec<String>> {
        Ok(self.ensure_fresh(kind)?.index.tips)
    }

    /// Drop the cache file; the next query rebuilds from disk.
    pub fn invalidate(&self) -> Result<()> {
        let path = self.index_path();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VeError::io(path.display().to_string(), e)),
        }
    }

    /// Load the cached entry for a kind, rebuilding and persisting when the
    /// cache is missing or stale.
    pub fn ensure_fresh(&self, kind: ArtifactKind) -> Result<BuildOutcome> {
        let mut file = self.load_file();
        if let Some(cached) = file.kinds.get(kind.as_str()) {
            if !self.is_stale(kind, cached)? {
                return Ok(BuildOutcome {
                    index: cached.clone(),
                    warnings: Vec::new(),
                });
            }
        }

        let outcome = self.build_kind(kind)?;
        file.kinds
            .insert(kind.as_str().to_string(), outcome.index.clone());
        file.version = INDEX_VERSION;
        self.store_file(&file)?;
        Ok(outcome)
    }

    /// Whether the cached entry no longer matches the filesystem: the
    /// directory set changed, or any frontmatter hash drifted.
    fn is_stale(&self, kind: ArtifactKind, cached: &KindIndex) -> Result<bool> {
        let present: BTreeSet<String> = enumerate_kind(&self.project_dir, kind).into_iter().collect();
        let cached_set: BTreeSet<String> = cached.hashes.keys().cloned().collect();
        if present != cached_set {
            return Ok(true);
        }
        for (short, stored) in &cached.hashes {
            let dir = self.artifact_dir(kind, short);
            let Some(file) = frontmatter_file(&dir, kind) else {
                return Ok(true);
            };
            if content_hash(&file, self.hash_mode)? != *stored {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Build the index for one kind from disk with Kahn's algorithm.
    ///
    /// Artifacts with malformed frontmatter are skipped with a warning; a
    /// cycle fails the build and nothing is written.
    pub fn build_kind(&self, kind: ArtifactKind) -> Result<BuildOutcome> {
        let mut warnings = Vec::new();
        let shorts = enumerate_kind(&self.project_dir, kind);

        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut hashes: BTreeMap<String, String> = BTreeMap::new();

        for short in &shorts {
            let dir = self.artifact_dir(kind, short);
            let Some(file) = frontmatter_file(&dir, kind) else {
                warnings.push(format!(
                    "{kind} '{short}' has no frontmatter file; skipped"
                ));
                continue;
            };
            match read_created_after(&dir, kind) {
                Ok(parents) => {
                    deps.insert(short.clone(), parents);
                    hashes.insert(short.clone(), content_hash(&file, self.hash_mode)?);
                }
                Err(e) => {
                    warnings.push(format!("{kind} '{short}' skipped: {e}"));
                }
            }
        }

        // Edges to siblings that no longer exist are ignored (operators may
        // delete artifact directories out of band).
        let known: BTreeSet<&String> = deps.keys().collect();
        let mut in_degree: BTreeMap<&String, usize> = BTreeMap::new();
        let mut children: HashMap<&String, Vec<&String>> = HashMap::new();
        for (short, parents) in &deps {
            let degree = parents.iter().filter(|p| known.contains(p)).count();
            in_degree.insert(short, degree);
            for parent in parents {
                if let Some(parent_key) = known.get(parent) {
                    children.entry(*parent_key).or_default().push(short);
                }
            }
        }

        // Ready set ordered lexicographically for deterministic output.
        let mut ready: BTreeSet<&String> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(s, _)| *s)
            .collect();

        let mut ordered: Vec<String> = Vec::with_capacity(deps.len());
        while let Some(next) = ready.iter().next().copied() {
            ready.remove(next);
            ordered.push(next.clone());
            if let Some(kids) = children.get(next) {
                for child in kids {
                    if let Some(degree) = in_degree.get_mut(*child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(*child);
                        }
                    }
                }
            }
        }

        if ordered.len() != deps.len() {
            let emitted: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
            let participants: Vec<String> = deps
                .keys()
                .filter(|s| !emitted.contains(s.as_str()))
                .cloned()
                .collect();
            return Err(VeError::CycleInKind { kind, participants });
        }

        // Tips: not referenced by any sibling's created_after.
        let referenced: BTreeSet<&String> = deps.values().flatten().collect();
        let tips: Vec<String> = deps
            .keys()
            .filter(|s| !referenced.contains(*s))
            .cloned()
            .collect();

        Ok(BuildOutcome {
            index: KindIndex {
                ordered,
                tips,
                hashes,
            },
            warnings,
        })
    }

    fn artifact_dir(&self, kind: ArtifactKind, short: &str) -> PathBuf {
        self.project_dir.join("docs").join(kind.dir_name()).join(short)
    }

    fn load_file(&self) -> IndexFile {
        let path = self.index_path();
        let Ok(content) = std::fs::read_to_string(&path) else {
            return IndexFile::default();
        };
        match serde_json::from_str::<IndexFile>(&content) {
            Ok(file) if file.version == INDEX_VERSION => file,
            // Unreadable or older-versioned caches are rebuilt silently.
            _ => IndexFile::default(),
        }
    }

    fn store_file(&self, file: &IndexFile) -> Result<()> {
        let path = self.index_path();
        let json = serde_json::to_string_pretty(file)?;
        std::fs::write(&path, json).map_err(|e| VeError::io(path.display().to_string(), e))
    }
}

/// Expand a set of shorts to everything topologically at-or-before them.
///
/// Used by the overlap detector to restrict candidates to predecessors of the
/// probe chunk.
pub fn transitive_predecessors(
    deps: &BTreeMap<String, Vec<String>>,
    start: &str,
) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(current) = stack.pop() {
        if let Some(parents) = deps.get(&current) {
            for parent in parents {
                if seen.insert(parent.clone()) {
                    stack.push(parent.clone());
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_chunk(project: &Path, short: &str, created_after: &[&str]) {
        let dir = project.join("docs/chunks").join(short);
        std::fs::create_dir_all(&dir).unwrap();
        let after = created_after
            .iter()
            .map(|s| format!("\"{s}\""))
            .collect::<Vec<_>>()
            .join(", ");
        std::fs::write(
            dir.join("GOAL.md"),
            format!("---\nstatus: FUTURE\ncreated_after: [{after}]\n---\n\n# Goal\n"),
        )
        .unwrap();
    }

    fn index_for(project: &Path) -> ArtifactIndex {
        ArtifactIndex::new(project, HashMode::Sha256)
    }

    #[test]
    fn empty_kind_yields_empty_index() {
        let dir = TempDir::new().unwrap();
        let outcome = index_for(dir.path()).ensure_fresh(ArtifactKind::Chunk).unwrap();
        assert!(outcome.index.ordered.is_empty());
        assert!(outcome.index.tips.is_empty());
    }

    #[test]
    fn linear_chain_orders_and_tips() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "a", &[]);
        write_chunk(dir.path(), "b", &["a"]);
        write_chunk(dir.path(), "c", &["b"]);

        let index = index_for(dir.path());
        assert_eq!(index.ordered(ArtifactKind::Chunk).unwrap(), ["a", "b", "c"]);
        assert_eq!(index.tips(ArtifactKind::Chunk).unwrap(), ["c"]);
    }

    #[test]
    fn diamond_orders_lexicographically_within_rank() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "root", &[]);
        write_chunk(dir.path(), "left", &["root"]);
        write_chunk(dir.path(), "right", &["root"]);
        write_chunk(dir.path(), "merge", &["left", "right"]);

        let ordered = index_for(dir.path()).ordered(ArtifactKind::Chunk).unwrap();
        assert_eq!(ordered, ["root", "left", "right", "merge"]);

        let tips = index_for(dir.path()).tips(ArtifactKind::Chunk).unwrap();
        assert_eq!(tips, ["merge"]);
    }

    #[test]
    fn multiple_roots_and_tips() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "b_root", &[]);
        write_chunk(dir.path(), "a_root", &[]);

        let index = index_for(dir.path());
        assert_eq!(
            index.ordered(ArtifactKind::Chunk).unwrap(),
            ["a_root", "b_root"]
        );
        assert_eq!(index.tips(ArtifactKind::Chunk).unwrap(), ["a_root", "b_root"]);
    }

    #[test]
    fn cycle_fails_with_participants() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "a", &["b"]);
        write_chunk(dir.path(), "b", &["a"]);
        write_chunk(dir.path(), "c", &[]);

        let err = index_for(dir.path()).build_kind(ArtifactKind::Chunk).unwrap_err();
        match err {
            VeError::CycleInKind { kind, participants } => {
                assert_eq!(kind, ArtifactKind::Chunk);
                assert_eq!(participants, ["a", "b"]);
            }
            other => panic!("expected cycle error, got {other}"),
        }
        // No index is written on cycle (build_kind does not persist).
        assert!(!dir.path().join(INDEX_FILE_NAME).exists());
    }

    #[test]
    fn malformed_artifact_is_skipped_with_warning() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "good", &[]);
        let bad = dir.path().join("docs/chunks/bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("GOAL.md"), "no frontmatter at all\n").unwrap();

        let outcome = index_for(dir.path()).ensure_fresh(ArtifactKind::Chunk).unwrap();
        assert_eq!(outcome.index.ordered, ["good"]);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("bad"));
    }

    #[test]
    fn edge_to_deleted_sibling_is_ignored() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "orphan", &["gone"]);

        let index = index_for(dir.path());
        assert_eq!(index.ordered(ArtifactKind::Chunk).unwrap(), ["orphan"]);
        assert_eq!(index.tips(ArtifactKind::Chunk).unwrap(), ["orphan"]);
    }

    #[test]
    fn cache_is_reused_until_content_changes() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "a", &[]);

        let index = index_for(dir.path());
        index.ordered(ArtifactKind::Chunk).unwrap();
        assert!(dir.path().join(INDEX_FILE_NAME).exists());

        // Unchanged content: cache considered fresh.
        let outcome = index.ensure_fresh(ArtifactKind::Chunk).unwrap();
        assert_eq!(outcome.index.ordered, ["a"]);

        // Editing the frontmatter invalidates the stored hash.
        write_chunk(dir.path(), "a", &[]);
        std::fs::write(
            dir.path().join("docs/chunks/a/GOAL.md"),
            "---\nstatus: ACTIVE\ncreated_after: []\n---\n",
        )
        .unwrap();
        let outcome = index.ensure_fresh(ArtifactKind::Chunk).unwrap();
        assert_eq!(outcome.index.ordered, ["a"]);
    }

    #[test]
    fn deleting_a_directory_recomputes_tips_and_hashes() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "a", &[]);
        write_chunk(dir.path(), "b", &["a"]);

        let index = index_for(dir.path());
        assert_eq!(index.tips(ArtifactKind::Chunk).unwrap(), ["b"]);

        std::fs::remove_dir_all(dir.path().join("docs/chunks/b")).unwrap();
        let outcome = index.ensure_fresh(ArtifactKind::Chunk).unwrap();
        assert_eq!(outcome.index.tips, ["a"]);
        assert!(!outcome.index.hashes.contains_key("b"));
    }

    #[test]
    fn kinds_are_indexed_independently() {
        let dir = TempDir::new().unwrap();
        write_chunk(dir.path(), "a", &[]);
        let inv = dir.path().join("docs/investigations/why_slow");
        std::fs::create_dir_all(&inv).unwrap();
        std::fs::write(
            inv.join("OVERVIEW.md"),
            "---\nstatus: ONGOING\ncreated_after: []\n---\n",
        )
        .unwrap();

        let index = index_for(dir.path());
        assert_eq!(index.ordered(ArtifactKind::Chunk).unwrap(), ["a"]);
        assert_eq!(
            index.ordered(ArtifactKind::Investigation).unwrap(),
            ["why_slow"]
        );
    }

    #[test]
    fn transitive_predecessors_walks_all_ancestors() {
        let mut deps = BTreeMap::new();
        deps.insert("a".to_string(), vec![]);
        deps.insert("b".to_string(), vec!["a".to_string()]);
        deps.insert("c".to_string(), vec!["b".to_string()]);

        let preds = transitive_predecessors(&deps, "c");
        assert!(preds.contains("a"));
        assert!(preds.contains("b"));
        assert!(!preds.contains("c"));
    }
}
