//! URI-level AGFS facade.
//!
//! Wraps a storage backend with listing order guarantees, hidden-entry
//! filtering, recursive deletes, directory moves with partial-state markers,
//! and the well-known semantic artefact readers.

use std::sync::Arc;

use serde::Serialize;
use viking_core::{is_hidden_name, VikingError, VikingResult, VikingUri};

use crate::backend::{AgfsBackend, NodeStat};

/// Well-known L0 artefact name within a processed directory.
pub const ABSTRACT_FILE_NAME: &str = ".abstract.md";

/// Well-known L1 artefact name within a processed directory.
pub const OVERVIEW_FILE_NAME: &str = ".overview.md";

/// Marker present at a move destination while a copy-then-delete is underway.
pub const MOVE_PENDING_MARKER: &str = ".move_pending";

/// Marker left at the highest affected directory after a failed rollback.
pub const PENDING_CLEANUP_MARKER: &str = ".pending_cleanup";

/// One row of an `ls` listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListEntry {
    pub uri: VikingUri,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: u64,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
}

/// One node of a `tree` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeNode {
    pub uri: VikingUri,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: u64,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub children: Vec<TreeNode>,
}

/// Options for `ls`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsOptions {
    pub recursive: bool,
    pub include_hidden: bool,
    pub node_limit: Option<usize>,
}

/// Options for `tree`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeOptions {
    pub depth: Option<usize>,
    pub node_limit: Option<usize>,
}

/// Options for `write`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub create_only: bool,
    pub create_parents: bool,
}

/// The agent filesystem: a uniform hierarchical store under `viking://`.
#[derive(Clone)]
pub struct Agfs {
    backend: Arc<dyn AgfsBackend>,
}

impl Agfs {
    pub fn new(backend: Arc<dyn AgfsBackend>) -> Self {
        Self { backend }
    }

    /// Creates the reserved scope roots so first writes have parents.
    pub async fn init_scope_roots(&self) -> VikingResult<()> {
        for root in [
            "viking://resources",
            "viking://user/memories",
            "viking://agent/skills",
            "viking://temp",
            "viking://.system",
        ] {
            self.backend
                .create_dir_all(&VikingUri::parse(root)?)
                .await?;
        }
        Ok(())
    }

    pub async fn read(&self, uri: &VikingUri) -> VikingResult<Vec<u8>> {
        self.backend.read(uri).await
    }

    pub async fn write(
        &self,
        uri: &VikingUri,
        bytes: &[u8],
        options: WriteOptions,
    ) -> VikingResult<()> {
        if uri.is_root() || uri.is_scope_root() {
            return Err(VikingError::invalid_argument(format!(
                "cannot write to namespace root '{uri}'"
            )));
        }
        if options.create_parents {
            if let Some(parent) = uri.parent() {
                self.backend.create_dir_all(&parent).await?;
            }
        }
        self.backend.write(uri, bytes, options.create_only).await
    }

    /// Appends to a file node in O(1); used by log-structured writers.
    pub async fn append(&self, uri: &VikingUri, bytes: &[u8]) -> VikingResult<()> {
        if uri.is_root() || uri.is_scope_root() {
            return Err(VikingError::invalid_argument(format!(
                "cannot write to namespace root '{uri}'"
            )));
        }
        self.backend.append(uri, bytes).await
    }

    pub async fn stat(&self, uri: &VikingUri) -> VikingResult<NodeStat> {
        self.backend.stat(uri).await
    }

    pub async fn exists(&self, uri: &VikingUri) -> VikingResult<bool> {
        Ok(self.backend.stat(uri).await?.exists)
    }

    /// Creates a directory and any missing ancestors.
    pub async fn mkdirp(&self, uri: &VikingUri) -> VikingResult<()> {
        self.backend.create_dir_all(uri).await
    }

    /// Lists a directory, ordered lexicographically by URI.
    ///
    /// Hidden (`.`-prefixed) entries are excluded unless requested; directory
    /// rows carry their own `.abstract.md` content when present so agents can
    /// navigate from a single call.
    pub async fn ls(&self, uri: &VikingUri, options: LsOptions) -> VikingResult<Vec<ListEntry>> {
        let mut out = Vec::new();
        self.collect_entries(uri, options, &mut out).await?;
        Ok(out)
    }

    async fn collect_entries(
        &self,
        uri: &VikingUri,
        options: LsOptions,
        out: &mut Vec<ListEntry>,
    ) -> VikingResult<()> {
        let mut raw = self.backend.list_dir(uri).await?;
        raw.sort_by(|left, right| left.name.cmp(&right.name));

        for entry in raw {
            if let Some(limit) = options.node_limit {
                if out.len() >= limit {
                    return Ok(());
                }
            }
            if !options.include_hidden && is_hidden_name(&entry.name) {
                continue;
            }
            let child_uri = uri.join(&entry.name)?;
            let abstract_text = if entry.is_dir {
                self.read_optional_text(&child_uri.join(ABSTRACT_FILE_NAME)?)
                    .await
            } else {
                None
            };
            let is_dir = entry.is_dir;
            out.push(ListEntry {
                uri: child_uri.clone(),
                is_dir: entry.is_dir,
                size: entry.size,
                mtime: entry.mtime,
                abstract_text,
            });
            if options.recursive && is_dir {
                Box::pin(self.collect_entries(&child_uri, options, out)).await?;
            }
        }
        Ok(())
    }

    /// Returns the hierarchical form of `ls`.
    pub async fn tree(&self, uri: &VikingUri, options: TreeOptions) -> VikingResult<TreeNode> {
        let stat = self.backend.stat(uri).await?;
        if !stat.exists {
            return Err(VikingError::not_found(uri.as_str().to_string()));
        }
        let mut budget = options.node_limit.unwrap_or(usize::MAX);
        self.build_tree(uri, &stat, options.depth, &mut budget).await
    }

    async fn build_tree(
        &self,
        uri: &VikingUri,
        stat: &NodeStat,
        depth: Option<usize>,
        budget: &mut usize,
    ) -> VikingResult<TreeNode> {
        let abstract_text = if stat.is_dir {
            self.read_optional_text(&uri.join(ABSTRACT_FILE_NAME)?).await
        } else {
            None
        };
        let mut node = TreeNode {
            uri: uri.clone(),
            is_dir: stat.is_dir,
            size: stat.size,
            mtime: stat.mtime,
            abstract_text,
            children: Vec::new(),
        };
        if !stat.is_dir || depth == Some(0) {
            return Ok(node);
        }

        let children = self
            .ls(
                uri,
                LsOptions {
                    recursive: false,
                    include_hidden: false,
                    node_limit: None,
                },
            )
            .await?;
        let next_depth = depth.map(|value| value.saturating_sub(1));
        for child in children {
            if *budget == 0 {
                break;
            }
            *budget -= 1;
            let child_stat = NodeStat {
                exists: true,
                is_dir: child.is_dir,
                size: child.size,
                mtime: child.mtime,
            };
            let child_node = Box::pin(self.build_tree(&child.uri, &child_stat, next_depth, budget))
                .await?;
            node.children.push(child_node);
        }
        Ok(node)
    }

    /// Deletes a node. Directories require `recursive` unless empty.
    pub async fn delete(&self, uri: &VikingUri, recursive: bool) -> VikingResult<()> {
        let stat = self.backend.stat(uri).await?;
        if !stat.exists {
            return Err(VikingError::not_found(uri.as_str().to_string()));
        }
        if !stat.is_dir {
            return self.backend.delete_file(uri).await;
        }

        let children = self.backend.list_dir(uri).await?;
        if !children.is_empty() && !recursive {
            return Err(VikingError::invalid_argument(format!(
                "directory '{uri}' is not empty"
            )));
        }
        for child in children {
            let child_uri = uri.join(&child.name)?;
            if child.is_dir {
                Box::pin(self.delete(&child_uri, true)).await?;
            } else {
                self.backend.delete_file(&child_uri).await?;
            }
        }
        self.backend.delete_empty_dir(uri).await
    }

    /// Moves a node.
    ///
    /// Single-file moves are atomic renames. Directory moves first try the
    /// backend rename fast path and fall back to copy-then-delete, keeping a
    /// [`MOVE_PENDING_MARKER`] at the destination root that readers can
    /// consult to detect partial state.
    pub async fn mv(&self, src: &VikingUri, dst: &VikingUri) -> VikingResult<()> {
        let src_stat = self.backend.stat(src).await?;
        if !src_stat.exists {
            return Err(VikingError::not_found(src.as_str().to_string()));
        }
        if self.backend.stat(dst).await?.exists {
            return Err(VikingError::already_exists(dst.as_str().to_string()));
        }

        if !src_stat.is_dir {
            return self.backend.rename(src, dst).await;
        }

        match self.backend.rename(src, dst).await {
            Ok(()) => Ok(()),
            Err(error) if error.code == viking_core::ErrorCode::AlreadyExists => Err(error),
            Err(_) => self.copy_then_delete(src, dst).await,
        }
    }

    async fn copy_then_delete(&self, src: &VikingUri, dst: &VikingUri) -> VikingResult<()> {
        self.backend.create_dir_all(dst).await?;
        let marker = dst.join(MOVE_PENDING_MARKER)?;
        self.backend.write(&marker, b"", false).await?;

        self.copy_tree(src, dst).await?;

        self.backend.delete_file(&marker).await?;
        self.delete(src, true).await
    }

    async fn copy_tree(&self, src: &VikingUri, dst: &VikingUri) -> VikingResult<()> {
        let entries = self.backend.list_dir(src).await?;
        for entry in entries {
            let src_child = src.join(&entry.name)?;
            let dst_child = dst.join(&entry.name)?;
            if entry.is_dir {
                self.backend.create_dir_all(&dst_child).await?;
                Box::pin(self.copy_tree(&src_child, &dst_child)).await?;
            } else {
                let bytes = self.backend.read(&src_child).await?;
                self.backend.write(&dst_child, &bytes, false).await?;
            }
        }
        Ok(())
    }

    /// Returns a directory's L0 abstract, or `NOT_PROCESSED` before the
    /// semantic pipeline has produced it.
    pub async fn abstract_of(&self, dir_uri: &VikingUri) -> VikingResult<String> {
        self.read_artefact(dir_uri, ABSTRACT_FILE_NAME).await
    }

    /// Returns a directory's L1 overview, or `NOT_PROCESSED`.
    pub async fn overview_of(&self, dir_uri: &VikingUri) -> VikingResult<String> {
        self.read_artefact(dir_uri, OVERVIEW_FILE_NAME).await
    }

    async fn read_artefact(&self, dir_uri: &VikingUri, name: &str) -> VikingResult<String> {
        let stat = self.backend.stat(dir_uri).await?;
        if !stat.exists {
            return Err(VikingError::not_found(dir_uri.as_str().to_string()));
        }
        if !stat.is_dir {
            return Err(VikingError::invalid_argument(format!(
                "'{dir_uri}' is not a directory"
            )));
        }
        match self.backend.read(&dir_uri.join(name)?).await {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| {
                VikingError::invariant_violation(format!("{name} under '{dir_uri}' is not UTF-8"))
            }),
            Err(error) if error.code == viking_core::ErrorCode::NotFound => Err(
                VikingError::not_processed(format!("'{dir_uri}' has no {name} yet")),
            ),
            Err(error) => Err(error),
        }
    }

    async fn read_optional_text(&self, uri: &VikingUri) -> Option<String> {
        let bytes = self.backend.read(uri).await.ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use viking_core::ErrorCode;

    use super::*;
    use crate::memory::MemoryBackend;

    fn agfs() -> Agfs {
        Agfs::new(Arc::new(MemoryBackend::new()))
    }

    fn uri(raw: &str) -> VikingUri {
        VikingUri::parse(raw).expect("uri")
    }

    async fn seed_doc(fs: &Agfs) {
        fs.init_scope_roots().await.expect("init");
        for (path, body) in [
            ("viking://resources/doc/b.md", "beta"),
            ("viking://resources/doc/a.md", "alpha"),
            ("viking://resources/doc/.abstract.md", "doc purpose"),
            ("viking://resources/doc/.overview.md", "- a.md: alpha"),
            ("viking://resources/doc/sub/c.md", "gamma"),
        ] {
            fs.write(
                &uri(path),
                body.as_bytes(),
                WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await
            .expect("seed write");
        }
    }

    #[tokio::test]
    async fn ls_is_lexicographic_and_hides_dot_entries() {
        let fs = agfs();
        seed_doc(&fs).await;

        let entries = fs
            .ls(&uri("viking://resources/doc"), LsOptions::default())
            .await
            .expect("ls");
        let names: Vec<&str> = entries
            .iter()
            .map(|entry| entry.uri.name().expect("name"))
            .collect();
        assert_eq!(names, vec!["a.md", "b.md", "sub"]);

        let with_hidden = fs
            .ls(
                &uri("viking://resources/doc"),
                LsOptions {
                    include_hidden: true,
                    ..LsOptions::default()
                },
            )
            .await
            .expect("ls hidden");
        assert_eq!(with_hidden.len(), 5);
    }

    #[tokio::test]
    async fn ls_surfaces_child_directory_abstracts() {
        let fs = agfs();
        seed_doc(&fs).await;
        let entries = fs
            .ls(&uri("viking://resources"), LsOptions::default())
            .await
            .expect("ls");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].abstract_text.as_deref(), Some("doc purpose"));
    }

    #[tokio::test]
    async fn ls_recursive_respects_node_limit() {
        let fs = agfs();
        seed_doc(&fs).await;
        let entries = fs
            .ls(
                &uri("viking://resources/doc"),
                LsOptions {
                    recursive: true,
                    include_hidden: false,
                    node_limit: Some(2),
                },
            )
            .await
            .expect("ls");
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn tree_depth_zero_is_a_leafless_root() {
        let fs = agfs();
        seed_doc(&fs).await;
        let tree = fs
            .tree(
                &uri("viking://resources/doc"),
                TreeOptions {
                    depth: Some(0),
                    node_limit: None,
                },
            )
            .await
            .expect("tree");
        assert!(tree.children.is_empty());
        assert_eq!(tree.abstract_text.as_deref(), Some("doc purpose"));

        let deep = fs
            .tree(&uri("viking://resources/doc"), TreeOptions::default())
            .await
            .expect("tree");
        assert_eq!(deep.children.len(), 3);
    }

    #[tokio::test]
    async fn artefact_readers_distinguish_missing_from_unprocessed() {
        let fs = agfs();
        seed_doc(&fs).await;

        let text = fs
            .abstract_of(&uri("viking://resources/doc"))
            .await
            .expect("abstract");
        assert_eq!(text, "doc purpose");

        let unprocessed = fs
            .overview_of(&uri("viking://resources/doc/sub"))
            .await
            .expect_err("unprocessed");
        assert_eq!(unprocessed.code, ErrorCode::NotProcessed);

        let missing = fs
            .abstract_of(&uri("viking://resources/nope"))
            .await
            .expect_err("missing");
        assert_eq!(missing.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn delete_requires_recursive_for_populated_dirs() {
        let fs = agfs();
        seed_doc(&fs).await;
        let doc = uri("viking://resources/doc");
        let error = fs.delete(&doc, false).await.expect_err("non-empty");
        assert_eq!(error.code, ErrorCode::InvalidArgument);
        fs.delete(&doc, true).await.expect("recursive delete");
        assert!(!fs.exists(&doc).await.expect("exists"));
    }

    #[tokio::test]
    async fn mv_moves_directories_and_refuses_occupied_destinations() {
        let fs = agfs();
        seed_doc(&fs).await;
        let src = uri("viking://resources/doc");
        let dst = uri("viking://resources/doc-2");
        fs.mv(&src, &dst).await.expect("move");
        assert!(!fs.exists(&src).await.expect("exists"));
        assert_eq!(
            fs.read(&uri("viking://resources/doc-2/sub/c.md"))
                .await
                .expect("read"),
            b"gamma"
        );

        seed_doc(&fs).await;
        let error = fs.mv(&src, &dst).await.expect_err("occupied");
        assert_eq!(error.code, ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn append_extends_files_in_place() {
        let fs = agfs();
        fs.init_scope_roots().await.expect("init");
        fs.mkdirp(&uri("viking://.system/sessions/s1"))
            .await
            .expect("mkdir");
        let log = uri("viking://.system/sessions/s1/log.jsonl");
        fs.append(&log, b"{\"n\":1}\n").await.expect("first append");
        fs.append(&log, b"{\"n\":2}\n").await.expect("second append");
        assert_eq!(
            fs.read(&log).await.expect("read"),
            b"{\"n\":1}\n{\"n\":2}\n"
        );
    }

    #[tokio::test]
    async fn scope_roots_reject_direct_writes() {
        let fs = agfs();
        fs.init_scope_roots().await.expect("init");
        let error = fs
            .write(&uri("viking://resources"), b"x", WriteOptions::default())
            .await
            .expect_err("root write");
        assert_eq!(error.code, ErrorCode::InvalidArgument);
    }
}
