//! # AIDD Core
//!
//! Persistent memory and diagnostics engine for AI-assisted development.
//! Records what happened across development sessions and lets later
//! sessions reuse it:
//!
//! - **Storage Engine**: SQLite with WAL, versioned migrations, pre-migration
//!   backups and post-migration integrity checks
//! - **Permanent Memory**: decisions, mistakes (deduplicated by error text)
//!   and conventions
//! - **Sessions**: sessions with typed observations, per-branch context with
//!   promote/merge, and the 8-phase feature lifecycle
//! - **Search**: FTS5/BM25 index, timeline around an anchor, and full fetch
//!   by id
//! - **Diagnostics**: TF-IDF/bigram/fuzzy error similarity, error
//!   categorization, stack-trace parsing and project health scoring
//! - **Evolution**: confidence-scored improvement candidates with an action
//!   log, snapshots for revert, and decay when conventions are deleted
//! - **Hook Bus**: retrying, circuit-breaking event fan-out with dead letters
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use aidd_core::{MemoryStore, NewMemory, Storage};
//!
//! let storage = Arc::new(Storage::new(None)?);
//! let memory = MemoryStore::new(Arc::clone(&storage));
//!
//! let saved = memory.save(NewMemory::Mistake {
//!     error: "Cannot find module './config'".into(),
//!     root_cause: "Import path was relative to the wrong directory".into(),
//!     fix: "Use the path alias".into(),
//!     prevention: "Prefer aliases over deep relative imports".into(),
//! })?;
//!
//! let similar = memory.find_similar_mistakes("module './config' not found", 0.3, 5)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): compile SQLite in
//! - `encryption`: SQLCipher; the key is read from `AIDD_ENCRYPTION_KEY`

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod artifacts;
pub mod config;
pub mod diagnostics;
pub mod drafts;
pub mod evolution;
pub mod hooks;
pub mod memory;
pub mod patterns;
pub mod search;
pub mod session;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Configuration
pub use config::StoreConfig;

// Storage layer
pub use storage::{
    CheckpointResult, PruneOptions, PruneReport, Result, Storage, StorageError, StoreStats,
    LATEST_VERSION,
};

// Permanent memory
pub use memory::{
    ConventionMemory, DecisionMemory, DeleteOutcome, MemoryContent, MemoryExport, MemoryKind,
    MemoryPatch, MemoryStore, MistakeMemory, NewMemory, PermanentMemoryEntry, SaveOutcome,
    SimilarMistake,
};

// Sessions, branches, lifecycles
pub use session::{
    ArchivedBranch, BranchContext, BranchStore, BranchUpdate, LifecyclePhase, LifecycleSession,
    LifecycleStatus, LifecycleStore, NewObservation, ObservationType, SessionFilter,
    SessionObservation, SessionOutcome, SessionState, SessionStatus, SessionStore,
    SessionSummary,
};

// Search
pub use search::{
    FullRecord, IndexHit, OrderBy, SearchIndex, SearchOptions, SearchSource, Timeline,
    TimelineAnchor, TimelineEntry,
};

// Diagnostics
pub use diagnostics::{
    categorize_error, compute_health, parse_stack_trace, ErrorCategorization, ErrorCategory,
    HealthBreakdown, HealthReport, HealthScorer, ParsedStackTrace, StackFrame,
};

// Evolution
pub use evolution::{
    CandidateFilter, CandidateStatus, CandidateType, DecayReport, EvolutionAction,
    EvolutionCandidate, EvolutionLogEntry, EvolutionSnapshot, EvolutionStatus, EvolutionTracker,
    NewCandidate, RevertOutcome,
};

// Hook bus
pub use hooks::{
    DeadLetter, EmitReport, HookBus, HookBusConfig, HookBusStatus, HookEvent, SubscriberState,
    SubscriberStatus,
};

// Pattern analytics, drafts, artifacts
pub use artifacts::{Artifact, ArtifactFilter, ArtifactPatch, ArtifactStatus, ArtifactStore, NewArtifact};
pub use drafts::{DraftEntry, DraftPatch, DraftSource, DraftStatus, DraftStore, NewDraft};
pub use patterns::{
    AuditScore, AuditVerdict, BannedPattern, ModelAuditStats, NewAudit, NewDetection, NewPattern,
    PatternDetection, PatternSeverity, PatternStats, PatternStore,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        BranchStore, EvolutionTracker, HookBus, HookEvent, MemoryStore, NewMemory, Result,
        SearchIndex, SearchOptions, SessionState, SessionStore, Storage, StorageError,
        StoreConfig,
    };
}
