//! Core types for the artifact store and orchestrator.
//!
//! Artifact kinds, per-kind status machines, and the work-unit model shared
//! by the CLI, daemon, and SQLite layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum length of an artifact short name.
pub const SHORT_NAME_MAX_LEN: usize = 31;

/// Validate a short name: lowercased identifier, `[a-z0-9_-]+`, at most 31 chars.
pub fn validate_short_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("short name cannot be empty".to_string());
    }
    if name.len() > SHORT_NAME_MAX_LEN {
        return Err(format!(
            "short name '{name}' exceeds {SHORT_NAME_MAX_LEN} characters"
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
    {
        return Err(format!(
            "short name '{name}' contains invalid character '{bad}' (allowed: a-z, 0-9, _, -)"
        ));
    }
    Ok(())
}

// --- Artifact kinds ---

/// The closed set of artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Chunk,
    Narrative,
    Subsystem,
    Investigation,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 4] = [
        Self::Chunk,
        Self::Narrative,
        Self::Subsystem,
        Self::Investigation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Narrative => "narrative",
            Self::Subsystem => "subsystem",
            Self::Investigation => "investigation",
        }
    }

    /// Directory name under `docs/` holding artifacts of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Chunk => "chunks",
            Self::Narrative => "narratives",
            Self::Subsystem => "subsystems",
            Self::Investigation => "investigations",
        }
    }

    /// Main document file for this kind. A directory with `external.yaml`
    /// and no main file is an external reference.
    pub fn main_file(&self) -> &'static str {
        match self {
            Self::Chunk => "GOAL.md",
            Self::Narrative | Self::Subsystem | Self::Investigation => "OVERVIEW.md",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chunk" | "chunks" => Some(Self::Chunk),
            "narrative" | "narratives" => Some(Self::Narrative),
            "subsystem" | "subsystems" => Some(Self::Subsystem),
            "investigation" | "investigations" => Some(Self::Investigation),
            _ => None,
        }
    }

    /// Initial status written into a freshly created artifact.
    pub fn initial_status(&self) -> &'static str {
        match self {
            Self::Chunk => "FUTURE",
            Self::Narrative => "DRAFTING",
            Self::Subsystem => "DISCOVERING",
            Self::Investigation => "ONGOING",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Per-kind status machines ---

/// Chunk lifecycle: FUTURE -> IMPLEMENTING -> ACTIVE -> SUPERSEDED.
///
/// IMPLEMENTING may fall back to FUTURE when a chunk is displaced by the
/// orchestrator claiming the single implementation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Future,
    Implementing,
    Active,
    Superseded,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Future => "FUTURE",
            Self::Implementing => "IMPLEMENTING",
            Self::Active => "ACTIVE",
            Self::Superseded => "SUPERSEDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FUTURE" => Some(Self::Future),
            "IMPLEMENTING" => Some(Self::Implementing),
            "ACTIVE" => Some(Self::Active),
            "SUPERSEDED" => Some(Self::Superseded),
            _ => None,
        }
    }

    /// Legal transitions out of this status.
    pub fn valid_transitions(&self) -> &'static [ChunkStatus] {
        match self {
            Self::Future => &[Self::Implementing],
            Self::Implementing => &[Self::Active, Self::Future],
            Self::Active => &[Self::Superseded],
            Self::Superseded => &[],
        }
    }
}

/// Narrative lifecycle: DRAFTING -> ACTIVE -> COMPLETED | SUPERSEDED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NarrativeStatus {
    Drafting,
    Active,
    Completed,
    Superseded,
}

impl NarrativeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafting => "DRAFTING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Superseded => "SUPERSEDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFTING" => Some(Self::Drafting),
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "SUPERSEDED" => Some(Self::Superseded),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> &'static [NarrativeStatus] {
        match self {
            Self::Drafting => &[Self::Active],
            Self::Active => &[Self::Completed, Self::Superseded],
            Self::Completed | Self::Superseded => &[],
        }
    }
}

/// Subsystem lifecycle: DISCOVERING -> DOCUMENTED <-> REFACTORING -> STABLE -> DEPRECATED.
/// DEPRECATED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubsystemStatus {
    Discovering,
    Documented,
    Refactoring,
    Stable,
    Deprecated,
}

impl SubsystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovering => "DISCOVERING",
            Self::Documented => "DOCUMENTED",
            Self::Refactoring => "REFACTORING",
            Self::Stable => "STABLE",
            Self::Deprecated => "DEPRECATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DISCOVERING" => Some(Self::Discovering),
            "DOCUMENTED" => Some(Self::Documented),
            "REFACTORING" => Some(Self::Refactoring),
            "STABLE" => Some(Self::Stable),
            "DEPRECATED" => Some(Self::Deprecated),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> &'static [SubsystemStatus] {
        match self {
            Self::Discovering => &[Self::Documented],
            Self::Documented => &[Self::Refactoring, Self::Stable],
            Self::Refactoring => &[Self::Documented, Self::Stable],
            Self::Stable => &[Self::Refactoring, Self::Deprecated],
            Self::Deprecated => &[],
        }
    }
}

/// Investigation lifecycle: ONGOING -> SOLVED | NOTED | DEFERRED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestigationStatus {
    Ongoing,
    Solved,
    Noted,
    Deferred,
}

impl InvestigationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ongoing => "ONGOING",
            Self::Solved => "SOLVED",
            Self::Noted => "NOTED",
            Self::Deferred => "DEFERRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ONGOING" => Some(Self::Ongoing),
            "SOLVED" => Some(Self::Solved),
            "NOTED" => Some(Self::Noted),
            "DEFERRED" => Some(Self::Deferred),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> &'static [InvestigationStatus] {
        match self {
            Self::Ongoing => &[Self::Solved, Self::Noted, Self::Deferred],
            Self::Solved | Self::Noted | Self::Deferred => &[],
        }
    }
}

/// A kind-erased artifact status, as stored in frontmatter.
///
/// Cross-kind code (listing, the index, overlap) carries the raw string;
/// typed transitions go through the per-kind enums.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawStatus(pub String);

impl RawStatus {
    /// Whether this artifact participates in overlap detection:
    /// ACTIVE chunks and STABLE subsystems do.
    pub fn is_overlap_candidate(&self, kind: ArtifactKind) -> bool {
        match kind {
            ArtifactKind::Chunk => self.0 == "ACTIVE",
            ArtifactKind::Subsystem => self.0 == "STABLE",
            _ => false,
        }
    }
}

impl std::fmt::Display for RawStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Frontmatter records ---

/// A symbolic code reference and the behavior it implements.
/// `ref` is a Rust keyword, so the field is renamed on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeReference {
    #[serde(rename = "ref")]
    pub ref_: String,
    #[serde(default)]
    pub implements: Option<String>,
}

impl CodeReference {
    pub fn new(ref_: impl Into<String>) -> Self {
        Self {
            ref_: ref_.into(),
            implements: None,
        }
    }
}

/// A cross-repository dependent of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependent {
    pub artifact_type: ArtifactKind,
    pub artifact_id: String,
    pub repo: String,
}

/// Typed projection of an artifact's frontmatter.
///
/// Unknown fields are retained in `extra` so reads stay lossless; writes go
/// through the frontmatter store, which rewrites one field at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactFrontmatter {
    pub status: RawStatus,
    #[serde(default)]
    pub created_after: Vec<String>,
    #[serde(default)]
    pub code_references: Vec<CodeReference>,
    #[serde(default)]
    pub code_paths: Vec<String>,
    #[serde(default)]
    pub subsystems: Vec<String>,
    #[serde(default)]
    pub narrative: Option<String>,
    #[serde(default)]
    pub parent_chunk: Option<String>,
    #[serde(default)]
    pub dependents: Vec<Dependent>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl ArtifactFrontmatter {
    /// Effective references for overlap detection: `code_references`, or
    /// `code_paths` treated as file-only references when there are none.
    pub fn effective_refs(&self) -> Vec<String> {
        if self.code_references.is_empty() {
            self.code_paths.clone()
        } else {
            self.code_references
                .iter()
                .map(|r| r.ref_.clone())
                .collect()
        }
    }
}

// --- External references ---

/// Contents of an `external.yaml` pointer file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalArtifactRef {
    pub artifact_type: ArtifactKind,
    pub artifact_id: String,
    /// `org/name` form.
    pub repo: String,
    #[serde(default)]
    pub track: Option<String>,
    /// 40-hex commit SHA, when pinned.
    #[serde(default)]
    pub pinned: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_after: Vec<String>,
}

impl ExternalArtifactRef {
    pub fn track_or_default(&self) -> &str {
        self.track.as_deref().unwrap_or("main")
    }
}

/// Validate an `org/name` repository reference.
pub fn validate_repo_ref(repo: &str) -> Result<(), String> {
    let valid_part = |p: &str| {
        !p.is_empty()
            && p.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    };
    let mut parts = repo.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(org), Some(name), None) if valid_part(org) && valid_part(name) => Ok(()),
        _ => Err(format!("repository '{repo}' is not in org/name form")),
    }
}

// --- Work units ---

/// Phase of a work unit in the chunk lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkUnitPhase {
    Goal,
    Plan,
    Implement,
    Complete,
}

impl WorkUnitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Goal => "GOAL",
            Self::Plan => "PLAN",
            Self::Implement => "IMPLEMENT",
            Self::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GOAL" => Some(Self::Goal),
            "PLAN" => Some(Self::Plan),
            "IMPLEMENT" => Some(Self::Implement),
            "COMPLETE" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// Scheduling state of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkUnitStatus {
    Ready,
    Running,
    Blocked,
    NeedsAttention,
    Done,
}

impl WorkUnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::NeedsAttention => "NEEDS_ATTENTION",
            Self::Done => "DONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(Self::Ready),
            "RUNNING" => Some(Self::Running),
            "BLOCKED" => Some(Self::Blocked),
            "NEEDS_ATTENTION" => Some(Self::NeedsAttention),
            "DONE" => Some(Self::Done),
            _ => None,
        }
    }
}

/// The orchestrator's scheduling entity, bound 1:1 to a chunk.
///
/// The chunk short name is the "PID": at most one work unit per chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub chunk: String,
    pub phase: WorkUnitPhase,
    pub status: WorkUnitStatus,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub worktree: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub completion_retries: i64,
    #[serde(default)]
    pub attention_reason: Option<String>,
    #[serde(default)]
    pub displaced_chunk: Option<String>,
    #[serde(default)]
    pub pending_answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    /// A fresh READY unit in the GOAL phase.
    pub fn new(chunk: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            chunk: chunk.into(),
            phase: WorkUnitPhase::Goal,
            status: WorkUnitStatus::Ready,
            blocked_by: Vec::new(),
            worktree: None,
            priority: 0,
            session_id: None,
            completion_retries: 0,
            attention_reason: None,
            displaced_chunk: None,
            pending_answer: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row of the append-only status log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusLogEntry {
    pub chunk: String,
    pub old_status: Option<String>,
    pub new_status: String,
    pub timestamp: DateTime<Utc>,
}

/// Scheduling knobs for the daemon, persisted in the store's config table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_agents: usize,
    pub dispatch_interval_seconds: f64,
    pub max_completion_retries: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 2,
            dispatch_interval_seconds: 1.0,
            max_completion_retries: 2,
        }
    }
}

/// Daemon health record returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub work_unit_counts: BTreeMap<String, i64>,
    #[serde(default)]
    pub config: Option<OrchestratorConfig>,
    pub version: String,
}

/// Outcome of running one agent phase.
///
/// Suspension (the agent asked the operator a question) is a first-class
/// variant, not an error: the scheduler pattern-matches on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Completed,
    Suspended {
        question: String,
        session_id: String,
    },
    Failed {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_validation() {
        assert!(validate_short_name("auth_cache").is_ok());
        assert!(validate_short_name("a-b-2").is_ok());
        assert!(validate_short_name("").is_err());
        assert!(validate_short_name("Mixed").is_err());
        assert!(validate_short_name("has space").is_err());
        assert!(validate_short_name(&"x".repeat(32)).is_err());
        assert!(validate_short_name(&"x".repeat(31)).is_ok());
    }

    #[test]
    fn chunk_transitions_follow_table() {
        assert_eq!(
            ChunkStatus::Future.valid_transitions(),
            &[ChunkStatus::Implementing]
        );
        assert!(ChunkStatus::Superseded.valid_transitions().is_empty());
        assert!(ChunkStatus::Implementing
            .valid_transitions()
            .contains(&ChunkStatus::Future));
    }

    #[test]
    fn subsystem_documented_refactoring_cycle() {
        assert!(SubsystemStatus::Documented
            .valid_transitions()
            .contains(&SubsystemStatus::Refactoring));
        assert!(SubsystemStatus::Refactoring
            .valid_transitions()
            .contains(&SubsystemStatus::Documented));
        assert!(SubsystemStatus::Deprecated.valid_transitions().is_empty());
    }

    #[test]
    fn investigation_terminals() {
        for terminal in [
            InvestigationStatus::Solved,
            InvestigationStatus::Noted,
            InvestigationStatus::Deferred,
        ] {
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&WorkUnitStatus::NeedsAttention).unwrap(),
            "\"NEEDS_ATTENTION\""
        );
        assert_eq!(
            serde_json::to_string(&ChunkStatus::Implementing).unwrap(),
            "\"IMPLEMENTING\""
        );
    }

    #[test]
    fn repo_ref_validation() {
        assert!(validate_repo_ref("org/repo").is_ok());
        assert!(validate_repo_ref("o.rg/re-po_1").is_ok());
        assert!(validate_repo_ref("norepo").is_err());
        assert!(validate_repo_ref("org/").is_err());
        assert!(validate_repo_ref("org/repo/extra").is_err());
    }

    #[test]
    fn frontmatter_effective_refs_fall_back_to_paths() {
        let yaml = "status: ACTIVE\ncode_paths: [src/main.rs]\n";
        let fm: ArtifactFrontmatter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(fm.effective_refs(), vec!["src/main.rs".to_string()]);

        let yaml = "status: ACTIVE\ncode_references:\n  - ref: src/main.rs#Foo\ncode_paths: [src/other.rs]\n";
        let fm: ArtifactFrontmatter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(fm.effective_refs(), vec!["src/main.rs#Foo".to_string()]);
    }

    #[test]
    fn frontmatter_retains_unknown_fields() {
        let yaml = "status: ACTIVE\ncreated_after: []\nticket: VE-42\n";
        let fm: ArtifactFrontmatter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(fm.status.0, "ACTIVE");
        assert_eq!(
            fm.extra.get("ticket"),
            Some(&serde_yaml::Value::String("VE-42".to_string()))
        );
    }

    #[test]
    fn external_ref_round_trips() {
        let ext = ExternalArtifactRef {
            artifact_type: ArtifactKind::Chunk,
            artifact_id: "auth_cache".to_string(),
            repo: "acme/platform".to_string(),
            track: Some("main".to_string()),
            pinned: Some("a".repeat(40)),
            created_after: vec!["bootstrap".to_string()],
        };
        let yaml = serde_yaml::to_string(&ext).unwrap();
        let back: ExternalArtifactRef = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, ext);
    }

    #[test]
    fn agent_outcome_round_trips() {
        let outcome = AgentOutcome::Suspended {
            question: "which port?".to_string(),
            session_id: "sess-1".to_string(),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: AgentOutcome = serde_json::from_str(&json).unwrap();
        match back {
            AgentOutcome::Suspended { question, .. } => assert_eq!(question, "which port?"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
