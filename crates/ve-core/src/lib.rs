pub mod artifacts;
pub mod error;
pub mod external;
pub mod frontmatter;
pub mod git;
pub mod hash;
pub mod index;
pub mod overlap;
pub mod project;
pub mod refs;
pub mod repo_cache;
pub mod resolve;
pub mod symbols;
pub mod sync;
pub mod types;

pub use artifacts::{ArtifactListing, ArtifactStore};
pub use error::{Result, VeError};
pub use hash::HashMode;
pub use index::ArtifactIndex;
pub use repo_cache::RepoCache;
pub use types::{
    AgentOutcome, ArtifactFrontmatter, ArtifactKind, ChunkStatus, CodeReference,
    ExternalArtifactRef, InvestigationStatus, NarrativeStatus, OrchestratorConfig,
    OrchestratorState, RawStatus, StatusLogEntry, SubsystemStatus, WorkUnit, WorkUnitPhase,
    WorkUnitStatus,
};
