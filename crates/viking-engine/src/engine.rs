//! The engine handle.
//!
//! `ContextEngine` owns the two adapters, the queues and their workers, the
//! parser registry, the retriever, and the session store, and exposes the
//! programmatic surface the HTTP collaborator maps one-to-one onto routes.
//! It is an explicit value threaded through the call graph; there are no
//! hidden singletons.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use viking_agfs::{
    Agfs, AgfsBackend, ListEntry, LocalBackend, LsOptions, MemoryBackend, NodeStat, TreeNode,
    TreeOptions, WriteOptions, PENDING_CLEANUP_MARKER,
};
use viking_ai::{
    Embedder, OpenAiEmbedderClient, OpenAiSummariserClient, Summarizer,
};
use viking_core::{
    AgfsBackendKind, CancelToken, EngineConfig, RequestTrace, ScopeKind, VectorBackendKind,
    VikingError, VikingResult, VikingUri,
};
use viking_parser::{ApproxTokenCounter, ParseContext, ParseInput, ParserRegistry, SplitLimits};
use viking_vector::{HttpVectorConfig, HttpVectorStore, LocalVectorStore, VectorStore};

use crate::embedding::{EmbeddingQueue, EmbeddingWorker};
use crate::extractor::MemoryExtractor;
use crate::fs_ops::{self, GrepMatch};
use crate::queue::QueueCounts;
use crate::retriever::{FindOptions, FindResult, HierarchicalRetriever};
use crate::semantic::{SemanticQueue, SemanticWorker};
use crate::session::{CommitOutcome, MessageRole, SessionStore, SessionSummary};
use crate::tree_builder::TreeBuilder;

const WAIT_POLL_MS: u64 = 50;
const DEFAULT_INGEST_WAIT_S: f64 = 600.0;

/// Injectable adapter set for embedding the engine in tests and services.
pub struct EngineComponents {
    pub agfs_backend: Arc<dyn AgfsBackend>,
    pub vector: Arc<dyn VectorStore>,
    pub summarizer: Arc<dyn Summarizer>,
    pub embedder: Arc<dyn Embedder>,
}

/// Options for `add_resource`.
#[derive(Debug, Clone, Default)]
pub struct AddResourceOptions {
    pub reason: Option<String>,
    pub wait: bool,
    pub trace: bool,
}

/// Outcome of `add_resource` / `add_skill`.
#[derive(Debug, Clone)]
pub struct AddResourceOutcome {
    pub target_uri: VikingUri,
    pub trace: Option<Value>,
}

/// Outcome of `find`.
#[derive(Debug, Clone)]
pub struct FindOutcome {
    pub results: Vec<FindResult>,
    pub trace: Option<Value>,
}

/// Readiness report: per-component checks.
#[derive(Debug, Clone)]
pub struct ReadyReport {
    pub status: &'static str,
    pub checks: BTreeMap<String, String>,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    agfs: Agfs,
    vector: Arc<dyn VectorStore>,
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn Embedder>,
    registry: ParserRegistry,
    parse_ctx: ParseContext,
    semantic: Arc<SemanticQueue>,
    embedding: Arc<EmbeddingQueue>,
    tree_builder: TreeBuilder,
    retriever: HierarchicalRetriever,
    sessions: SessionStore,
    extractor: MemoryExtractor,
    cancel: CancelToken,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Handle to one workspace's context engine.
#[derive(Clone)]
pub struct ContextEngine {
    inner: Arc<EngineInner>,
}

impl ContextEngine {
    /// Starts an engine with backends resolved from configuration.
    pub async fn start(config: EngineConfig) -> VikingResult<Self> {
        config.validate()?;

        let agfs_resolution = config.resolve_agfs_backend();
        let agfs_backend: Arc<dyn AgfsBackend> = match agfs_resolution.backend {
            AgfsBackendKind::Local => Arc::new(LocalBackend::open(config.agfs_root())?),
            AgfsBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        tracing::info!(
            backend = agfs_resolution.backend.label(),
            reason = agfs_resolution.reason_code.as_str(),
            "resolved AGFS backend"
        );

        let vector_resolution = config.resolve_vector_backend();
        let vector: Arc<dyn VectorStore> = match vector_resolution.backend {
            VectorBackendKind::Local => Arc::new(LocalVectorStore::open(config.vectors_root())?),
            VectorBackendKind::Http => Arc::new(HttpVectorStore::new(HttpVectorConfig {
                api_base: config.vector_http_base.clone(),
                api_key: config.vector_http_key.clone(),
                request_timeout_ms: config.vector_search_timeout_ms,
                max_retries: viking_core::backoff::MAX_ATTEMPTS,
            })?),
        };
        tracing::info!(
            backend = vector_resolution.backend.label(),
            reason = vector_resolution.reason_code.as_str(),
            "resolved vector backend"
        );

        let summarizer: Arc<dyn Summarizer> = Arc::new(
            OpenAiSummariserClient::new(config.summariser.clone())
                .map_err(VikingError::from)?,
        );
        let embedder: Arc<dyn Embedder> = Arc::new(
            OpenAiEmbedderClient::new(config.embedder.clone()).map_err(VikingError::from)?,
        );

        Self::start_with(
            config,
            EngineComponents {
                agfs_backend,
                vector,
                summarizer,
                embedder,
            },
        )
        .await
    }

    /// Starts an engine around injected adapters.
    pub async fn start_with(
        config: EngineConfig,
        components: EngineComponents,
    ) -> VikingResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let agfs = Agfs::new(components.agfs_backend);
        agfs.init_scope_roots().await?;

        let semantic = Arc::new(SemanticQueue::open(agfs.clone()).await?);
        let embedding = Arc::new(EmbeddingQueue::open(agfs.clone()).await?);
        let tree_builder = TreeBuilder::new(agfs.clone(), Arc::clone(&semantic));
        let retriever = HierarchicalRetriever::new(
            agfs.clone(),
            Arc::clone(&components.vector),
            Arc::clone(&components.embedder),
            config.default_score_threshold,
            config.memory_half_life_days,
        );
        let sessions = SessionStore::new(agfs.clone());
        let extractor = MemoryExtractor::new(agfs.clone(), Arc::clone(&components.summarizer));
        let parse_ctx = ParseContext::new(
            agfs.clone(),
            Arc::new(ApproxTokenCounter),
            SplitLimits {
                split_token_limit: config.split_token_limit,
                merge_token_floor: config.merge_token_floor,
            },
        );

        let cancel = CancelToken::new();
        let inner = Arc::new(EngineInner {
            config: Arc::clone(&config),
            agfs: agfs.clone(),
            vector: Arc::clone(&components.vector),
            summarizer: Arc::clone(&components.summarizer),
            embedder: Arc::clone(&components.embedder),
            registry: ParserRegistry::with_default_parsers(),
            parse_ctx,
            semantic: Arc::clone(&semantic),
            embedding: Arc::clone(&embedding),
            tree_builder,
            retriever,
            sessions,
            extractor,
            cancel: cancel.clone(),
            workers: std::sync::Mutex::new(Vec::new()),
        });

        let semantic_worker = Arc::new(SemanticWorker::new(
            agfs.clone(),
            Arc::clone(&semantic),
            Arc::clone(&embedding),
            Arc::clone(&components.summarizer),
            Arc::clone(&config),
        ));
        let embedding_worker = Arc::new(EmbeddingWorker::new(
            agfs,
            embedding,
            components.vector,
            components.embedder,
            config,
        ));
        {
            let mut workers = inner.workers.lock().expect("worker registry lock");
            workers.push(tokio::spawn(semantic_worker.run(cancel.clone())));
            workers.push(tokio::spawn(embedding_worker.run(cancel.clone())));
            workers.push(tokio::spawn(run_temp_gc(
                inner.agfs.clone(),
                inner.config.temp_grace_period_ms,
                cancel,
            )));
        }
        Ok(Self { inner })
    }

    /// Stops the queue workers, releasing their claims.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let workers: Vec<_> = {
            let mut workers = self.inner.workers.lock().expect("worker registry lock");
            workers.drain(..).collect()
        };
        for worker in workers {
            if let Err(error) = worker.await {
                tracing::warn!(%error, "worker task ended abnormally");
            }
        }
    }

    fn trace_for(&self, operation: &str, enabled: bool) -> RequestTrace {
        if enabled {
            RequestTrace::enabled(operation, self.inner.config.trace_max_events)
        } else {
            RequestTrace::disabled(operation)
        }
    }

    // --- filesystem surface ---

    pub async fn ls(&self, uri: &VikingUri, options: LsOptions) -> VikingResult<Vec<ListEntry>> {
        self.inner.agfs.ls(uri, options).await
    }

    pub async fn tree(&self, uri: &VikingUri, options: TreeOptions) -> VikingResult<TreeNode> {
        self.inner.agfs.tree(uri, options).await
    }

    pub async fn stat(&self, uri: &VikingUri) -> VikingResult<NodeStat> {
        self.inner.agfs.stat(uri).await
    }

    /// Reads file content, optionally a byte window of it.
    pub async fn read(
        &self,
        uri: &VikingUri,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> VikingResult<Vec<u8>> {
        let bytes = self.inner.agfs.read(uri).await?;
        let start = offset.unwrap_or(0).min(bytes.len());
        let end = limit
            .map(|limit| start.saturating_add(limit))
            .unwrap_or(bytes.len())
            .min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    pub async fn write(&self, uri: &VikingUri, bytes: &[u8]) -> VikingResult<()> {
        self.inner
            .agfs
            .write(uri, bytes, WriteOptions::default())
            .await
    }

    pub async fn delete(&self, uri: &VikingUri, recursive: bool) -> VikingResult<()> {
        self.inner.agfs.delete(uri, recursive).await
    }

    pub async fn abstract_of(&self, dir_uri: &VikingUri) -> VikingResult<String> {
        self.inner.agfs.abstract_of(dir_uri).await
    }

    pub async fn overview_of(&self, dir_uri: &VikingUri) -> VikingResult<String> {
        self.inner.agfs.overview_of(dir_uri).await
    }

    // --- ingest surface ---

    /// Ingests a local path or URL into `viking://resources/`.
    pub async fn add_resource(
        &self,
        path_or_url: &str,
        options: &AddResourceOptions,
    ) -> VikingResult<AddResourceOutcome> {
        let trace = self.trace_for("resource.add", options.trace);
        if let Some(reason) = &options.reason {
            trace.event("ingest", "requested", "ok", json!({ "reason": reason }));
        }

        let input = self.resolve_input(path_or_url).await?;
        trace.event("ingest", "parse", "ok", json!({ "input": input.file_name() }));
        let parsed = self.inner.registry.parse(&input, &self.inner.parse_ctx).await;
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                trace.set_error("parse", error.code.as_str(), &error.message);
                trace.finish("error");
                return Err(error);
            }
        };
        trace.event(
            "ingest",
            "parsed",
            "ok",
            json!({
                "parser": parsed.parser_name,
                "format": parsed.source_format,
                "duration_ms": parsed.parse_duration_ms,
            }),
        );

        let target_uri = self
            .inner
            .tree_builder
            .promote(&parsed.temp_dir_uri, ScopeKind::Resource)
            .await?;
        trace.event("ingest", "promoted", "ok", json!({ "target": target_uri.as_str() }));

        if options.wait {
            self.wait(DEFAULT_INGEST_WAIT_S).await?;
            self.record_semantic_gauges(&trace);
        }
        Ok(AddResourceOutcome {
            target_uri,
            trace: trace.finish("ok").map(|result| result.to_value()),
        })
    }

    /// Stores a named skill under `viking://agent/skills/`.
    pub async fn add_skill(&self, name: &str, content: &str) -> VikingResult<VikingUri> {
        if name.trim().is_empty() {
            return Err(VikingError::invalid_argument("skill name cannot be empty"));
        }
        let input = ParseInput::Bytes {
            name: format!("{}.md", viking_parser::sanitize_name(name)),
            bytes: content.as_bytes().to_vec(),
        };
        let parsed = self
            .inner
            .registry
            .parse(&input, &self.inner.parse_ctx)
            .await?;
        self.inner
            .tree_builder
            .promote(&parsed.temp_dir_uri, ScopeKind::Skill)
            .await
    }

    /// Removes a subtree everywhere: AGFS nodes, vectors, queued jobs.
    pub async fn remove(&self, uri: &VikingUri, recursive: bool) -> VikingResult<()> {
        self.inner.agfs.delete(uri, recursive).await?;
        self.inner.vector.delete_prefix(uri).await?;
        self.inner.semantic.store().purge_prefix(uri).await?;
        self.inner.embedding.store().purge_prefix(uri).await?;
        Ok(())
    }

    async fn resolve_input(&self, path_or_url: &str) -> VikingResult<ParseInput> {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            let response = reqwest::get(path_or_url)
                .await
                .map_err(|error| VikingError::dependency(format!("fetch failed: {error}")))?;
            if !response.status().is_success() {
                return Err(VikingError::dependency(format!(
                    "fetch of '{path_or_url}' returned status {}",
                    response.status()
                )));
            }
            let name = path_or_url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|segment| !segment.is_empty() && segment.contains('.'))
                .unwrap_or("download.md")
                .to_string();
            let bytes = response
                .bytes()
                .await
                .map_err(|error| VikingError::dependency(format!("fetch failed: {error}")))?;
            Ok(ParseInput::Bytes {
                name,
                bytes: bytes.to_vec(),
            })
        } else {
            Ok(ParseInput::Path(path_or_url.into()))
        }
    }

    // --- search surface ---

    pub async fn find(
        &self,
        query: &str,
        options: &FindOptions,
        trace_enabled: bool,
    ) -> VikingResult<FindOutcome> {
        let trace = self.trace_for("search.find", trace_enabled);
        match self.inner.retriever.find(query, options, &trace).await {
            Ok(results) => Ok(FindOutcome {
                results,
                trace: trace.finish("ok").map(|result| result.to_value()),
            }),
            Err(error) => {
                trace.set_error("search", error.code.as_str(), &error.message);
                trace.finish("error");
                Err(error)
            }
        }
    }

    pub async fn grep(
        &self,
        pattern: &str,
        target_uri: Option<&VikingUri>,
        case_insensitive: bool,
    ) -> VikingResult<Vec<GrepMatch>> {
        let root = VikingUri::root();
        let target = target_uri.unwrap_or(&root);
        fs_ops::grep(&self.inner.agfs, pattern, target, case_insensitive).await
    }

    pub async fn glob(&self, pattern: &str, target_uri: &VikingUri) -> VikingResult<Vec<VikingUri>> {
        fs_ops::glob(&self.inner.agfs, pattern, target_uri).await
    }

    // --- session surface ---

    pub async fn session_create(&self) -> VikingResult<String> {
        self.inner.sessions.create().await
    }

    pub async fn session_add_message(
        &self,
        id: &str,
        role: MessageRole,
        content: &str,
    ) -> VikingResult<()> {
        self.inner.sessions.append(id, role, content).await
    }

    pub async fn session_delete(&self, id: &str) -> VikingResult<()> {
        self.inner.sessions.delete(id).await
    }

    pub async fn sessions_list(&self) -> VikingResult<Vec<SessionSummary>> {
        self.inner.sessions.list_all().await
    }

    /// Commits a session: distil memories, promote them, seal the log.
    ///
    /// Serialised per session; a committed session returns its recorded
    /// result without re-running distillation.
    pub async fn session_commit(
        &self,
        id: &str,
        trace_enabled: bool,
    ) -> VikingResult<(CommitOutcome, Option<Value>)> {
        let trace = self.trace_for("session.commit", trace_enabled);
        let lock = self.inner.sessions.commit_lock(id).await;
        let _guard = lock.lock().await;

        if let Some(cached) = self.inner.sessions.begin_commit(id).await? {
            trace.event("commit", "cached", "ok", json!({ "target": cached.target_uri }));
            trace.gauge("memory.memories_extracted", json!(cached.extracted));
            return Ok((cached, trace.finish("ok").map(|result| result.to_value())));
        }

        let messages = self.inner.sessions.messages(id).await?;
        trace.event("commit", "loaded", "ok", json!({ "messages": messages.len() }));

        let candidates = match self.inner.extractor.distil(&messages).await {
            Ok(candidates) => candidates,
            Err(error) => {
                // The session stays `committing`; restart recovery re-runs.
                trace.set_error("distil", error.code.as_str(), &error.message);
                trace.finish("error");
                return Err(error);
            }
        };
        trace.gauge("memory.memories_extracted", json!(candidates.len()));

        let (target_uri, extracted) = if candidates.is_empty() {
            (None, 0)
        } else {
            let scratch = self
                .inner
                .extractor
                .write_scratch(id, &candidates)
                .await?;
            let target = self
                .inner
                .tree_builder
                .promote(&scratch, ScopeKind::Memory)
                .await?;
            (Some(target), candidates.len() as u64)
        };

        let outcome = self
            .inner
            .sessions
            .finish_commit(id, target_uri, extracted)
            .await?;
        trace.event("commit", "committed", "ok", json!({ "target": outcome.target_uri }));
        Ok((outcome, trace.finish("ok").map(|result| result.to_value())))
    }

    // --- system surface ---

    /// Process liveness: always ok.
    pub fn health(&self) -> Value {
        json!({ "status": "ok" })
    }

    /// Verifies adapter and provider reachability plus leftover partial-move
    /// markers.
    pub async fn ready(&self) -> ReadyReport {
        let mut checks = BTreeMap::new();
        checks.insert(
            "agfs".to_string(),
            match self.inner.agfs.stat(&VikingUri::root()).await {
                Ok(_) => "ok".to_string(),
                Err(error) => format!("error: {error}"),
            },
        );
        checks.insert(
            "vector".to_string(),
            match self.inner.vector.ping().await {
                Ok(()) => "ok".to_string(),
                Err(error) => format!("error: {error}"),
            },
        );
        checks.insert(
            "summariser".to_string(),
            match self.inner.summarizer.ping().await {
                Ok(()) => "ok".to_string(),
                Err(error) => format!("error: {error}"),
            },
        );
        checks.insert(
            "embedder".to_string(),
            match self.inner.embedder.ping().await {
                Ok(()) => "ok".to_string(),
                Err(error) => format!("error: {error}"),
            },
        );
        checks.insert(
            "cleanup_markers".to_string(),
            match self.pending_cleanup_count().await {
                Ok(0) => "ok".to_string(),
                Ok(count) => format!("error: {count} pending cleanup markers"),
                Err(error) => format!("error: {error}"),
            },
        );

        let status = if checks.values().all(|value| value == "ok") {
            "ok"
        } else {
            "error"
        };
        ReadyReport { status, checks }
    }

    async fn pending_cleanup_count(&self) -> VikingResult<usize> {
        let mut count = 0;
        for root in ["viking://resources", "viking://user/memories", "viking://agent/skills"] {
            let entries = self
                .inner
                .agfs
                .ls(
                    &VikingUri::parse(root)?,
                    LsOptions {
                        recursive: true,
                        include_hidden: true,
                        node_limit: None,
                    },
                )
                .await?;
            count += entries
                .iter()
                .filter(|entry| entry.uri.name() == Some(PENDING_CLEANUP_MARKER))
                .count();
        }
        Ok(count)
    }

    /// Blocks until both queues drain or the timeout elapses.
    pub async fn wait(&self, timeout_s: f64) -> VikingResult<QueueCounts> {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs_f64(timeout_s.max(0.0));
        loop {
            let counts = self
                .inner
                .semantic
                .counts()
                .merge(self.inner.embedding.counts());
            if counts.drained() {
                return Ok(counts);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(counts);
            }
            tokio::time::sleep(std::time::Duration::from_millis(WAIT_POLL_MS)).await;
        }
    }

    fn record_semantic_gauges(&self, trace: &RequestTrace) {
        let counts = self.inner.semantic.counts();
        trace.gauge(
            "semantic_nodes.total_nodes",
            json!(counts.pending + counts.in_progress + counts.processed + counts.errors),
        );
        trace.gauge("semantic_nodes.done_nodes", json!(counts.processed));
        trace.gauge("semantic_nodes.pending_nodes", json!(counts.pending));
        trace.gauge("semantic_nodes.in_progress_nodes", json!(counts.in_progress));
    }

    /// Snapshot of queue counts without waiting.
    pub fn queue_counts(&self) -> QueueCounts {
        self.inner
            .semantic
            .counts()
            .merge(self.inner.embedding.counts())
    }
}

/// Deletes scratch roots whose owners never promoted them.
///
/// An ingest that fails after creating its temp tree leaves the root behind;
/// after the grace period it is fair game for collection.
async fn run_temp_gc(agfs: Agfs, grace_ms: u64, cancel: CancelToken) {
    let interval =
        std::time::Duration::from_millis((grace_ms / 2).clamp(1_000, 600_000));
    let Ok(temp_root) = VikingUri::parse("viking://temp") else {
        return;
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let entries = match agfs
            .ls(
                &temp_root,
                LsOptions {
                    recursive: false,
                    include_hidden: true,
                    node_limit: None,
                },
            )
            .await
        {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let now_ms = viking_core::current_unix_timestamp_ms();
        for entry in entries {
            if !entry.is_dir {
                continue;
            }
            let age_ms = now_ms.saturating_sub(entry.mtime.saturating_mul(1_000));
            if age_ms < grace_ms {
                continue;
            }
            match agfs.delete(&entry.uri, true).await {
                Ok(()) => {
                    tracing::info!(uri = %entry.uri, "garbage-collected stale scratch tree");
                }
                Err(error) => {
                    tracing::warn!(uri = %entry.uri, %error, "scratch tree GC failed");
                }
            }
        }
    }
}
