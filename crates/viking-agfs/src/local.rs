//! Local-disk AGFS backend.
//!
//! Each URI maps to a file or directory mirroring the URI path under the
//! configured root. File writes stage through a sibling temp file + rename.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use viking_core::{write_bytes_atomic, VikingError, VikingResult, VikingUri};

use crate::backend::{AgfsBackend, NodeStat, RawEntry};

/// AGFS backend storing nodes on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Opens (and creates on demand) a backend rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> VikingResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|error| VikingError::from(error).in_op("open agfs root"))?;
        Ok(Self { root })
    }

    fn node_path(&self, uri: &VikingUri) -> PathBuf {
        if uri.is_root() {
            return self.root.clone();
        }
        self.root.join(uri.storage_path())
    }
}

fn mtime_secs(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn stat_path(path: &Path) -> NodeStat {
    match std::fs::metadata(path) {
        Ok(metadata) => NodeStat {
            exists: true,
            is_dir: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            mtime: mtime_secs(&metadata),
        },
        Err(_) => NodeStat::missing(),
    }
}

#[async_trait]
impl AgfsBackend for LocalBackend {
    async fn read(&self, uri: &VikingUri) -> VikingResult<Vec<u8>> {
        let path = self.node_path(uri);
        let metadata = std::fs::metadata(&path)
            .map_err(|_| VikingError::not_found(uri.as_str().to_string()))?;
        if metadata.is_dir() {
            return Err(VikingError::invalid_argument(format!(
                "'{uri}' is a directory"
            )));
        }
        std::fs::read(&path).map_err(|error| VikingError::from(error).in_op("read"))
    }

    async fn write(&self, uri: &VikingUri, bytes: &[u8], create_only: bool) -> VikingResult<()> {
        let path = self.node_path(uri);
        if create_only && path.exists() {
            return Err(VikingError::already_exists(uri.as_str().to_string()));
        }
        if path.is_dir() {
            return Err(VikingError::invalid_argument(format!(
                "'{uri}' is a directory"
            )));
        }
        let parent = path.parent().unwrap_or(&self.root);
        if !parent.exists() {
            return Err(VikingError::not_found(format!(
                "parent of '{uri}' does not exist"
            )));
        }
        write_bytes_atomic(&path, bytes).map_err(|error| VikingError::from(error).in_op("write"))
    }

    async fn append(&self, uri: &VikingUri, bytes: &[u8]) -> VikingResult<()> {
        let path = self.node_path(uri);
        if path.is_dir() {
            return Err(VikingError::invalid_argument(format!(
                "'{uri}' is a directory"
            )));
        }
        let parent = path.parent().unwrap_or(&self.root);
        if !parent.exists() {
            return Err(VikingError::not_found(format!(
                "parent of '{uri}' does not exist"
            )));
        }
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| VikingError::from(error).in_op("append"))?;
        file.write_all(bytes)
            .map_err(|error| VikingError::from(error).in_op("append"))
    }

    async fn stat(&self, uri: &VikingUri) -> VikingResult<NodeStat> {
        Ok(stat_path(&self.node_path(uri)))
    }

    async fn list_dir(&self, uri: &VikingUri) -> VikingResult<Vec<RawEntry>> {
        let path = self.node_path(uri);
        let metadata = std::fs::metadata(&path)
            .map_err(|_| VikingError::not_found(uri.as_str().to_string()))?;
        if !metadata.is_dir() {
            return Err(VikingError::invalid_argument(format!(
                "'{uri}' is not a directory"
            )));
        }

        let mut entries = Vec::new();
        let read_dir =
            std::fs::read_dir(&path).map_err(|error| VikingError::from(error).in_op("ls"))?;
        for entry in read_dir {
            let entry = entry.map_err(|error| VikingError::from(error).in_op("ls"))?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                // Non-UTF-8 names cannot round-trip through the URI grammar.
                Err(_) => continue,
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            entries.push(RawEntry {
                name,
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
                mtime: mtime_secs(&metadata),
            });
        }
        Ok(entries)
    }

    async fn create_dir_all(&self, uri: &VikingUri) -> VikingResult<()> {
        std::fs::create_dir_all(self.node_path(uri))
            .map_err(|error| VikingError::from(error).in_op("mkdir"))
    }

    async fn delete_file(&self, uri: &VikingUri) -> VikingResult<()> {
        let path = self.node_path(uri);
        if !path.exists() {
            return Err(VikingError::not_found(uri.as_str().to_string()));
        }
        std::fs::remove_file(&path).map_err(|error| VikingError::from(error).in_op("delete"))
    }

    async fn delete_empty_dir(&self, uri: &VikingUri) -> VikingResult<()> {
        let path = self.node_path(uri);
        if !path.exists() {
            return Err(VikingError::not_found(uri.as_str().to_string()));
        }
        std::fs::remove_dir(&path).map_err(|error| VikingError::from(error).in_op("delete"))
    }

    async fn rename(&self, src: &VikingUri, dst: &VikingUri) -> VikingResult<()> {
        let src_path = self.node_path(src);
        let dst_path = self.node_path(dst);
        if !src_path.exists() {
            return Err(VikingError::not_found(src.as_str().to_string()));
        }
        if dst_path.exists() {
            return Err(VikingError::already_exists(dst.as_str().to_string()));
        }
        if let Some(parent) = dst_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|error| VikingError::from(error).in_op("move"))?;
        }
        std::fs::rename(&src_path, &dst_path)
            .map_err(|error| VikingError::from(error).in_op("move"))
    }
}
