//! The Viking context engine.
//!
//! A staged async pipeline that turns raw inputs into a three-layer semantic
//! tree on AGFS with a parallel vector index, plus the hierarchical
//! retriever and session-memory distillation built on top of it. The
//! [`ContextEngine`] handle is the public surface; HTTP service wrappers,
//! CLIs, and agents are external collaborators.

pub mod api;
pub mod embedding;
pub mod engine;
pub mod extractor;
pub mod fs_ops;
pub mod queue;
pub mod retriever;
pub mod semantic;
pub mod session;
pub mod tree_builder;

pub use api::{error_envelope, ok_envelope};
pub use embedding::{EmbeddingJobRecord, EmbeddingQueue, EmbeddingWorker};
pub use engine::{
    AddResourceOptions, AddResourceOutcome, ContextEngine, EngineComponents, FindOutcome,
    ReadyReport,
};
pub use extractor::{MemoryCandidate, MemoryCategory, MemoryExtractor};
pub use fs_ops::{GrepMatch, GREP_MAX_MATCHES};
pub use queue::{JobStatus, QueueCounts, QueueJob, QueueStore};
pub use retriever::{
    hotness_score, normalise_for_dedup, FindOptions, FindResult, HierarchicalRetriever,
    DEFAULT_SCORE_THRESHOLD,
};
pub use semantic::{derive_abstract, SemanticJobRecord, SemanticQueue, SemanticWorker};
pub use session::{
    CommitOutcome, MessageRecord, MessageRole, SessionState, SessionStatus, SessionStore,
    SessionSummary,
};
pub use tree_builder::TreeBuilder;
