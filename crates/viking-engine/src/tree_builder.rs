//! TreeBuilder: the only path by which external content enters the stable
//! namespace.
//!
//! Promotes a parsed scratch tree into its scope, disambiguating the target
//! name with a numeric suffix, then enqueues the root semantic job. The
//! queue discovers and fans out to descendants on its own.

use std::sync::Arc;

use viking_agfs::{Agfs, LsOptions, WriteOptions, PENDING_CLEANUP_MARKER};
use viking_core::{ScopeKind, VikingError, VikingResult, VikingUri};

use crate::semantic::SemanticQueue;

/// Promotes scratch trees into the permanent namespace.
#[derive(Clone)]
pub struct TreeBuilder {
    agfs: Agfs,
    semantic: Arc<SemanticQueue>,
}

impl TreeBuilder {
    pub fn new(agfs: Agfs, semantic: Arc<SemanticQueue>) -> Self {
        Self { agfs, semantic }
    }

    /// Moves the single document root under `temp_dir_uri` into the scope's
    /// base namespace and enqueues semantic processing for it.
    pub async fn promote(
        &self,
        temp_dir_uri: &VikingUri,
        kind: ScopeKind,
    ) -> VikingResult<VikingUri> {
        let children = self.agfs.ls(temp_dir_uri, LsOptions::default()).await?;
        let [root] = children.as_slice() else {
            return Err(VikingError::invariant_violation(format!(
                "scratch tree '{temp_dir_uri}' must hold exactly one document root, found {}",
                children.len()
            )));
        };
        if !root.is_dir {
            return Err(VikingError::invariant_violation(format!(
                "scratch tree root '{}' is not a directory",
                root.uri
            )));
        }
        let name = root
            .uri
            .name()
            .ok_or_else(|| VikingError::invariant_violation("document root without a name"))?
            .to_string();

        let base = kind.base_uri();
        self.agfs.mkdirp(&base).await?;
        let target = self.unique_target(&base, &name).await?;

        if let Err(move_error) = self.agfs.mv(&root.uri, &target).await {
            return Err(self.rollback(&root.uri, &target, move_error).await);
        }

        self.agfs.delete(temp_dir_uri, true).await?;
        self.semantic
            .enqueue_unique(target.clone(), kind, None)
            .await?;
        tracing::info!(target = %target, kind = kind.as_str(), "promoted scratch tree");
        Ok(target)
    }

    /// Smallest positive numeric suffix making the target unique.
    async fn unique_target(&self, base: &VikingUri, name: &str) -> VikingResult<VikingUri> {
        let plain = base.join(name)?;
        if !self.agfs.exists(&plain).await? {
            return Ok(plain);
        }
        for suffix in 1u32.. {
            let candidate = base.join(&format!("{name}-{suffix}"))?;
            if !self.agfs.exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        unreachable!("suffix search is unbounded")
    }

    /// Best-effort reverse move; leaves a cleanup marker when that fails too.
    async fn rollback(
        &self,
        src: &VikingUri,
        target: &VikingUri,
        move_error: VikingError,
    ) -> VikingError {
        if !matches!(self.agfs.exists(target).await, Ok(true)) {
            return move_error;
        }
        if self.agfs.mv(target, src).await.is_ok() {
            return move_error;
        }
        let marker = match target.join(PENDING_CLEANUP_MARKER) {
            Ok(marker) => marker,
            Err(error) => return error,
        };
        if let Err(error) = self
            .agfs
            .write(
                &marker,
                move_error.to_string().as_bytes(),
                WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await
        {
            tracing::error!(%error, target = %target, "failed to leave cleanup marker");
        }
        VikingError::dependency(format!(
            "partial promotion of '{target}': {move_error}; cleanup marker left"
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use viking_agfs::MemoryBackend;
    use viking_core::ErrorCode;

    use super::*;
    use crate::queue::JobStatus;

    async fn fixture() -> (Agfs, Arc<SemanticQueue>, TreeBuilder) {
        let agfs = Agfs::new(Arc::new(MemoryBackend::new()));
        agfs.init_scope_roots().await.expect("init");
        let semantic = Arc::new(SemanticQueue::open(agfs.clone()).await.expect("queue"));
        let builder = TreeBuilder::new(agfs.clone(), Arc::clone(&semantic));
        (agfs, semantic, builder)
    }

    fn uri(raw: &str) -> VikingUri {
        VikingUri::parse(raw).expect("uri")
    }

    async fn seed_scratch(agfs: &Agfs, temp: &VikingUri, doc: &str) {
        let root = temp.join(doc).expect("join");
        agfs.mkdirp(&root).await.expect("mkdir");
        agfs.write(
            &root.join("a.md").expect("join"),
            b"alpha",
            WriteOptions {
                create_only: false,
                create_parents: true,
            },
        )
        .await
        .expect("write");
    }

    #[tokio::test]
    async fn promote_moves_tree_and_enqueues_root_job() {
        let (agfs, semantic, builder) = fixture().await;
        let temp = VikingUri::new_temp_root();
        seed_scratch(&agfs, &temp, "doc").await;

        let target = builder
            .promote(&temp, ScopeKind::Resource)
            .await
            .expect("promote");
        assert_eq!(target.as_str(), "viking://resources/doc");
        assert_eq!(
            agfs.read(&uri("viking://resources/doc/a.md")).await.expect("read"),
            b"alpha"
        );
        assert!(!agfs.exists(&temp).await.expect("exists"), "scratch deleted");
        assert_eq!(semantic.status_for(&target), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn repeated_ingest_gets_numeric_suffixes() {
        let (agfs, _semantic, builder) = fixture().await;
        for expected in ["viking://resources/doc", "viking://resources/doc-1", "viking://resources/doc-2"] {
            let temp = VikingUri::new_temp_root();
            seed_scratch(&agfs, &temp, "doc").await;
            let target = builder
                .promote(&temp, ScopeKind::Resource)
                .await
                .expect("promote");
            assert_eq!(target.as_str(), expected);
        }
    }

    #[tokio::test]
    async fn promote_rejects_ambiguous_scratch_trees() {
        let (agfs, _semantic, builder) = fixture().await;
        let temp = VikingUri::new_temp_root();
        seed_scratch(&agfs, &temp, "doc-a").await;
        seed_scratch(&agfs, &temp, "doc-b").await;

        let error = builder
            .promote(&temp, ScopeKind::Resource)
            .await
            .expect_err("ambiguous");
        assert_eq!(error.code, ErrorCode::InvariantViolation);
    }
}
