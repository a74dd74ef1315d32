//! Storage backend contract for AGFS.
//!
//! Backends store exact user bytes at node granularity and expose immediate
//! children of directories. Everything URI-level (recursive listings, moves,
//! semantic artefact readers) lives in the [`crate::Agfs`] facade.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use viking_core::{VikingResult, VikingUri};

/// Result of a `stat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub exists: bool,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: u64,
}

impl NodeStat {
    /// The stat of a node that does not exist.
    pub fn missing() -> Self {
        Self {
            exists: false,
            is_dir: false,
            size: 0,
            mtime: 0,
        }
    }
}

/// One immediate child of a directory, as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: u64,
}

/// Storage contract implemented by every AGFS backend.
///
/// Implementors MUST be `Send + Sync`; writes are atomic at node granularity
/// so readers observe either the previous or the new content, never partial
/// bytes.
#[async_trait]
pub trait AgfsBackend: Send + Sync {
    /// Returns the raw bytes of a file node.
    async fn read(&self, uri: &VikingUri) -> VikingResult<Vec<u8>>;

    /// Writes a file node atomically. With `create_only` set, an existing
    /// node fails with `ALREADY_EXISTS`. The parent directory must exist.
    async fn write(&self, uri: &VikingUri, bytes: &[u8], create_only: bool) -> VikingResult<()>;

    /// Appends bytes to a file node in O(1), creating it when absent. Used
    /// by log-structured writers (session logs).
    async fn append(&self, uri: &VikingUri, bytes: &[u8]) -> VikingResult<()>;

    /// Stats a node; missing nodes report `exists = false` rather than failing.
    async fn stat(&self, uri: &VikingUri) -> VikingResult<NodeStat>;

    /// Lists immediate children of a directory, unordered.
    async fn list_dir(&self, uri: &VikingUri) -> VikingResult<Vec<RawEntry>>;

    /// Creates a directory and any missing ancestors.
    async fn create_dir_all(&self, uri: &VikingUri) -> VikingResult<()>;

    /// Removes a file node.
    async fn delete_file(&self, uri: &VikingUri) -> VikingResult<()>;

    /// Removes an empty directory node.
    async fn delete_empty_dir(&self, uri: &VikingUri) -> VikingResult<()>;

    /// Renames a node (file or whole directory) within this backend.
    /// Fails with `ALREADY_EXISTS` when the destination is present.
    async fn rename(&self, src: &VikingUri, dst: &VikingUri) -> VikingResult<()>;
}
