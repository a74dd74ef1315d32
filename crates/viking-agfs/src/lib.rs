//! Agent filesystem (AGFS) adapter for the Viking namespace.
//!
//! Presents a uniform hierarchical, object-addressed filesystem over
//! pluggable backends. Files store exact user bytes; listings are ordered
//! lexicographically; processed directories carry the two well-known
//! semantic artefacts.

pub mod agfs;
pub mod backend;
pub mod local;
pub mod memory;

pub use agfs::{
    Agfs, ListEntry, LsOptions, TreeNode, TreeOptions, WriteOptions, ABSTRACT_FILE_NAME,
    MOVE_PENDING_MARKER, OVERVIEW_FILE_NAME, PENDING_CLEANUP_MARKER,
};
pub use backend::{AgfsBackend, NodeStat, RawEntry};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
