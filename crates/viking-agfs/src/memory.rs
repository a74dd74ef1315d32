//! In-memory AGFS backend used by unit tests and ephemeral workspaces.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use viking_core::{current_unix_timestamp, VikingError, VikingResult, VikingUri};

use crate::backend::{AgfsBackend, NodeStat, RawEntry};

#[derive(Debug, Clone)]
enum MemNode {
    File { bytes: Vec<u8>, mtime: u64 },
    Dir { mtime: u64 },
}

/// AGFS backend keeping the whole tree in a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    nodes: Mutex<BTreeMap<String, MemNode>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn parent_exists(nodes: &BTreeMap<String, MemNode>, path: &str) -> bool {
        match path.rfind('/') {
            Some(index) => matches!(nodes.get(&path[..index]), Some(MemNode::Dir { .. })),
            // Top-level nodes hang off the implicit namespace root.
            None => true,
        }
    }

    fn child_name<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
        let rest = if prefix.is_empty() {
            key
        } else {
            key.strip_prefix(prefix)?.strip_prefix('/')?
        };
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        Some(rest)
    }
}

#[async_trait]
impl AgfsBackend for MemoryBackend {
    async fn read(&self, uri: &VikingUri) -> VikingResult<Vec<u8>> {
        let nodes = self.nodes.lock().expect("agfs memory lock");
        match nodes.get(uri.storage_path()) {
            Some(MemNode::File { bytes, .. }) => Ok(bytes.clone()),
            Some(MemNode::Dir { .. }) => Err(VikingError::invalid_argument(format!(
                "'{uri}' is a directory"
            ))),
            None => Err(VikingError::not_found(uri.as_str().to_string())),
        }
    }

    async fn write(&self, uri: &VikingUri, bytes: &[u8], create_only: bool) -> VikingResult<()> {
        let path = uri.storage_path().to_string();
        let mut nodes = self.nodes.lock().expect("agfs memory lock");
        match nodes.get(&path) {
            Some(MemNode::Dir { .. }) => {
                return Err(VikingError::invalid_argument(format!(
                    "'{uri}' is a directory"
                )));
            }
            Some(MemNode::File { .. }) if create_only => {
                return Err(VikingError::already_exists(uri.as_str().to_string()));
            }
            _ => {}
        }
        if !Self::parent_exists(&nodes, &path) {
            return Err(VikingError::not_found(format!(
                "parent of '{uri}' does not exist"
            )));
        }
        nodes.insert(
            path,
            MemNode::File {
                bytes: bytes.to_vec(),
                mtime: current_unix_timestamp(),
            },
        );
        Ok(())
    }

    async fn append(&self, uri: &VikingUri, bytes: &[u8]) -> VikingResult<()> {
        let path = uri.storage_path().to_string();
        let mut nodes = self.nodes.lock().expect("agfs memory lock");
        match nodes.get_mut(&path) {
            Some(MemNode::File { bytes: existing, mtime }) => {
                existing.extend_from_slice(bytes);
                *mtime = current_unix_timestamp();
                Ok(())
            }
            Some(MemNode::Dir { .. }) => Err(VikingError::invalid_argument(format!(
                "'{uri}' is a directory"
            ))),
            None => {
                if !Self::parent_exists(&nodes, &path) {
                    return Err(VikingError::not_found(format!(
                        "parent of '{uri}' does not exist"
                    )));
                }
                nodes.insert(
                    path,
                    MemNode::File {
                        bytes: bytes.to_vec(),
                        mtime: current_unix_timestamp(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn stat(&self, uri: &VikingUri) -> VikingResult<NodeStat> {
        if uri.is_root() {
            return Ok(NodeStat {
                exists: true,
                is_dir: true,
                size: 0,
                mtime: 0,
            });
        }
        let nodes = self.nodes.lock().expect("agfs memory lock");
        Ok(match nodes.get(uri.storage_path()) {
            Some(MemNode::File { bytes, mtime }) => NodeStat {
                exists: true,
                is_dir: false,
                size: bytes.len() as u64,
                mtime: *mtime,
            },
            Some(MemNode::Dir { mtime }) => NodeStat {
                exists: true,
                is_dir: true,
                size: 0,
                mtime: *mtime,
            },
            None => NodeStat::missing(),
        })
    }

    async fn list_dir(&self, uri: &VikingUri) -> VikingResult<Vec<RawEntry>> {
        let prefix = uri.storage_path().to_string();
        let nodes = self.nodes.lock().expect("agfs memory lock");
        if !uri.is_root() && !matches!(nodes.get(&prefix), Some(MemNode::Dir { .. })) {
            return match nodes.get(&prefix) {
                Some(MemNode::File { .. }) => Err(VikingError::invalid_argument(format!(
                    "'{uri}' is not a directory"
                ))),
                _ => Err(VikingError::not_found(uri.as_str().to_string())),
            };
        }

        let mut entries = Vec::new();
        for (key, node) in nodes.iter() {
            let Some(name) = Self::child_name(key, &prefix) else {
                continue;
            };
            entries.push(match node {
                MemNode::File { bytes, mtime } => RawEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size: bytes.len() as u64,
                    mtime: *mtime,
                },
                MemNode::Dir { mtime } => RawEntry {
                    name: name.to_string(),
                    is_dir: true,
                    size: 0,
                    mtime: *mtime,
                },
            });
        }
        Ok(entries)
    }

    async fn create_dir_all(&self, uri: &VikingUri) -> VikingResult<()> {
        let mut nodes = self.nodes.lock().expect("agfs memory lock");
        let mut path = String::new();
        for segment in uri.segments() {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(segment);
            match nodes.get(&path) {
                Some(MemNode::File { .. }) => {
                    return Err(VikingError::invalid_argument(format!(
                        "'{path}' exists as a file"
                    )));
                }
                Some(MemNode::Dir { .. }) => {}
                None => {
                    nodes.insert(
                        path.clone(),
                        MemNode::Dir {
                            mtime: current_unix_timestamp(),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn delete_file(&self, uri: &VikingUri) -> VikingResult<()> {
        let mut nodes = self.nodes.lock().expect("agfs memory lock");
        match nodes.get(uri.storage_path()) {
            Some(MemNode::File { .. }) => {
                nodes.remove(uri.storage_path());
                Ok(())
            }
            Some(MemNode::Dir { .. }) => Err(VikingError::invalid_argument(format!(
                "'{uri}' is a directory"
            ))),
            None => Err(VikingError::not_found(uri.as_str().to_string())),
        }
    }

    async fn delete_empty_dir(&self, uri: &VikingUri) -> VikingResult<()> {
        let prefix = uri.storage_path().to_string();
        let mut nodes = self.nodes.lock().expect("agfs memory lock");
        if !matches!(nodes.get(&prefix), Some(MemNode::Dir { .. })) {
            return Err(VikingError::not_found(uri.as_str().to_string()));
        }
        let has_children = nodes
            .range(format!("{prefix}/")..)
            .take_while(|(key, _)| key.starts_with(&format!("{prefix}/")))
            .next()
            .is_some();
        if has_children {
            return Err(VikingError::invalid_argument(format!(
                "directory '{uri}' is not empty"
            )));
        }
        nodes.remove(&prefix);
        Ok(())
    }

    async fn rename(&self, src: &VikingUri, dst: &VikingUri) -> VikingResult<()> {
        let src_path = src.storage_path().to_string();
        let dst_path = dst.storage_path().to_string();
        let mut nodes = self.nodes.lock().expect("agfs memory lock");
        if nodes.contains_key(&dst_path) {
            return Err(VikingError::already_exists(dst.as_str().to_string()));
        }
        let Some(node) = nodes.get(&src_path).cloned() else {
            return Err(VikingError::not_found(src.as_str().to_string()));
        };
        // Materialise missing destination ancestors the way a disk rename
        // into a freshly created parent would observe them.
        if let Some(index) = dst_path.rfind('/') {
            let mut path = String::new();
            for segment in dst_path[..index].split('/') {
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(segment);
                nodes.entry(path.clone()).or_insert(MemNode::Dir {
                    mtime: current_unix_timestamp(),
                });
            }
        }

        match node {
            MemNode::File { .. } => {
                let node = nodes.remove(&src_path).expect("present above");
                nodes.insert(dst_path, node);
            }
            MemNode::Dir { .. } => {
                let descendant_prefix = format!("{src_path}/");
                let moved: Vec<(String, MemNode)> = nodes
                    .range(src_path.clone()..)
                    .take_while(|(key, _)| {
                        key.as_str() == src_path || key.starts_with(&descendant_prefix)
                    })
                    .map(|(key, node)| (key.clone(), node.clone()))
                    .collect();
                for (key, _) in &moved {
                    nodes.remove(key);
                }
                for (key, node) in moved {
                    let suffix = &key[src_path.len()..];
                    nodes.insert(format!("{dst_path}{suffix}"), node);
                }
            }
        }
        Ok(())
    }
}
