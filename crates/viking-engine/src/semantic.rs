//! Semantic queue and worker.
//!
//! Jobs fan out from a promoted root to every descendant directory and are
//! processed strictly bottom-up: a directory becomes eligible only once all
//! of its child directories are done. Processing a directory summarises its
//! file children, composes the L1 overview from child abstracts, derives the
//! L0 abstract, and enqueues embedding work.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use viking_agfs::{Agfs, ListEntry, LsOptions, WriteOptions, ABSTRACT_FILE_NAME, OVERVIEW_FILE_NAME};
use viking_ai::{ImageSource, SummariseRequest, Summarizer};
use viking_core::backoff::{next_backoff_ms_with_jitter, MAX_ATTEMPTS};
use viking_core::{
    current_unix_timestamp_ms, CancelToken, CodeSummaryMode, EngineConfig, ErrorCode, ScopeKind,
    VikingError, VikingResult, VikingUri,
};
use viking_parser::{extract_skeleton, CodeLanguage, SKELETON_MIN_LINES};
use viking_vector::{Modality, VectorSource};

use crate::embedding::EmbeddingQueue;
use crate::queue::{JobStatus, QueueCounts, QueueJob, QueueStore};

pub const SEMANTIC_QUEUE_DIR: &str = "viking://.system/queues/semantic";

/// Hidden per-directory cache of file-child summaries.
pub const FILE_SUMMARIES_NAME: &str = ".file_summaries.json";

const WORKER_POLL_MS: u64 = 50;
const FILE_SUMMARY_MAX_CHARS: usize = 16_000;
const ABSTRACT_MAX_WORDS: usize = 200;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

fn queue_schema_version() -> u32 {
    crate::queue::QUEUE_SCHEMA_VERSION
}

/// One unit of semantic work: produce the two artefacts for a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticJobRecord {
    #[serde(default = "queue_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub uri: VikingUri,
    pub kind: ScopeKind,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: u64,
    pub updated_at: u64,
    pub parent_uri: Option<VikingUri>,
    pub lease_expires_at: Option<u64>,
    pub not_before: Option<u64>,
}

impl SemanticJobRecord {
    pub fn new(uri: VikingUri, kind: ScopeKind, parent_uri: Option<VikingUri>) -> Self {
        let now_ms = current_unix_timestamp_ms();
        Self {
            schema_version: queue_schema_version(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            uri,
            kind,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: now_ms,
            updated_at: now_ms,
            parent_uri,
            lease_expires_at: None,
            not_before: None,
        }
    }
}

impl QueueJob for SemanticJobRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn uri(&self) -> &VikingUri {
        &self.uri
    }
    fn status(&self) -> JobStatus {
        self.status
    }
    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }
    fn enqueued_at(&self) -> u64 {
        self.enqueued_at
    }
    fn set_updated_at(&mut self, now_ms: u64) {
        self.updated_at = now_ms;
    }
    fn attempts(&self) -> u32 {
        self.attempts
    }
    fn bump_attempts(&mut self) {
        self.attempts += 1;
    }
    fn set_last_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }
    fn lease_expires_at(&self) -> Option<u64> {
        self.lease_expires_at
    }
    fn set_lease_expires_at(&mut self, lease: Option<u64>) {
        self.lease_expires_at = lease;
    }
    fn not_before(&self) -> Option<u64> {
        self.not_before
    }
    fn set_not_before(&mut self, not_before: Option<u64>) {
        self.not_before = not_before;
    }
}

/// The persistent semantic queue.
pub struct SemanticQueue {
    store: QueueStore<SemanticJobRecord>,
}

impl SemanticQueue {
    pub async fn open(agfs: Agfs) -> VikingResult<Self> {
        let dir = VikingUri::parse(SEMANTIC_QUEUE_DIR)?;
        Ok(Self {
            store: QueueStore::open(agfs, dir).await?,
        })
    }

    pub fn store(&self) -> &QueueStore<SemanticJobRecord> {
        &self.store
    }

    /// Latest job status for a directory, if any job exists.
    pub fn status_for(&self, uri: &VikingUri) -> Option<JobStatus> {
        self.store
            .snapshot()
            .into_iter()
            .filter(|job| job.uri == *uri)
            .max_by_key(|job| job.enqueued_at)
            .map(|job| job.status)
    }

    /// Enqueues a job unless a live (pending/in-progress) one already covers
    /// the URI.
    pub async fn enqueue_unique(
        &self,
        uri: VikingUri,
        kind: ScopeKind,
        parent_uri: Option<VikingUri>,
    ) -> VikingResult<bool> {
        let live = self.store.snapshot().into_iter().any(|job| {
            job.uri == uri && !job.status.is_terminal()
        });
        if live {
            return Ok(false);
        }
        self.store
            .enqueue(SemanticJobRecord::new(uri, kind, parent_uri))
            .await?;
        Ok(true)
    }

    pub fn counts(&self) -> QueueCounts {
        self.store.counts()
    }
}

/// Background worker draining the semantic queue.
pub struct SemanticWorker {
    agfs: Agfs,
    queue: Arc<SemanticQueue>,
    embedding: Arc<EmbeddingQueue>,
    summarizer: Arc<dyn Summarizer>,
    config: Arc<EngineConfig>,
    llm_slots: Arc<Semaphore>,
}

impl SemanticWorker {
    pub fn new(
        agfs: Agfs,
        queue: Arc<SemanticQueue>,
        embedding: Arc<EmbeddingQueue>,
        summarizer: Arc<dyn Summarizer>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let llm_slots = Arc::new(Semaphore::new(config.max_concurrent_llm.max(1)));
        Self {
            agfs,
            queue,
            embedding,
            summarizer,
            config,
            llm_slots,
        }
    }

    /// Runs until cancelled, processing eligible jobs bottom-up.
    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        let mut tasks: JoinSet<(String, u32, VikingResult<()>)> = JoinSet::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(error) = self.queue.store().recover_expired_leases().await {
                tracing::warn!(%error, "semantic lease recovery failed");
            }

            while let Some(joined) = tasks.try_join_next() {
                self.handle_outcome(joined).await;
            }

            while tasks.len() < self.config.max_concurrent_semantic_jobs {
                match self.claim_eligible().await {
                    Ok(Some(job)) => {
                        let worker = Arc::clone(&self);
                        let job_cancel = cancel.clone();
                        tasks.spawn(async move {
                            let outcome = worker.process_directory(&job, &job_cancel).await;
                            (job.id.clone(), job.attempts, outcome)
                        });
                    }
                    Ok(None) => break,
                    Err(error) => {
                        tracing::warn!(%error, "semantic claim sweep failed");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(WORKER_POLL_MS)) => {}
            }
        }

        // Release claims so a restart (or manual drain) can pick them up.
        tasks.shutdown().await;
        if let Err(error) = self.release_in_progress().await {
            tracing::warn!(%error, "failed to release semantic leases on shutdown");
        }
    }

    async fn release_in_progress(&self) -> VikingResult<()> {
        for job in self.queue.store().snapshot() {
            if job.status == JobStatus::InProgress {
                self.queue.store().release(&job.id).await?;
            }
        }
        Ok(())
    }

    async fn handle_outcome(
        &self,
        joined: Result<(String, u32, VikingResult<()>), tokio::task::JoinError>,
    ) {
        let (id, attempts, outcome) = match joined {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(%error, "semantic job task aborted");
                return;
            }
        };
        let result = match outcome {
            Ok(()) => self.queue.store().complete(&id).await,
            Err(error) if error.code.is_transient() && (attempts as usize) + 1 < MAX_ATTEMPTS => {
                let delay_ms = next_backoff_ms_with_jitter(attempts as usize);
                self.queue
                    .store()
                    .retry_later(&id, &error.to_string(), current_unix_timestamp_ms() + delay_ms)
                    .await
            }
            Err(error) => self.queue.store().fail(&id, &error.to_string()).await,
        };
        if let Err(error) = result {
            tracing::error!(%error, id, "failed to persist semantic job outcome");
        }
    }

    /// Finds the oldest pending job whose children are all settled, fanning
    /// out jobs for unprocessed child directories along the way.
    async fn claim_eligible(&self) -> VikingResult<Option<SemanticJobRecord>> {
        let now_ms = current_unix_timestamp_ms();
        let mut pending: Vec<SemanticJobRecord> = self
            .queue
            .store()
            .snapshot()
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending)
            .filter(|job| job.not_before.map_or(true, |at| at <= now_ms))
            .collect();
        pending.sort_by(|left, right| {
            left.enqueued_at
                .cmp(&right.enqueued_at)
                .then_with(|| left.id.cmp(&right.id))
        });

        for job in pending {
            if self.ensure_children_settled(&job).await? {
                let claimed = self
                    .queue
                    .store()
                    .claim_next(self.config.job_lease_timeout_ms, |candidate| {
                        candidate.id == job.id
                    })
                    .await?;
                if claimed.is_some() {
                    return Ok(claimed);
                }
            }
        }
        Ok(None)
    }

    /// Returns true when every child directory is done; enqueues jobs for
    /// children that have none yet.
    async fn ensure_children_settled(&self, job: &SemanticJobRecord) -> VikingResult<bool> {
        let children = self.agfs.ls(&job.uri, LsOptions::default()).await?;
        let mut settled = true;
        for child in children.iter().filter(|entry| entry.is_dir) {
            match self.queue.status_for(&child.uri) {
                Some(JobStatus::Done) => {}
                Some(_) => settled = false,
                None => {
                    // A directory processed in a previous life needs no job.
                    if child.abstract_text.is_some() {
                        continue;
                    }
                    self.queue
                        .enqueue_unique(child.uri.clone(), job.kind, Some(job.uri.clone()))
                        .await?;
                    settled = false;
                }
            }
        }
        Ok(settled)
    }

    /// Produces `.overview.md` and `.abstract.md` for one directory.
    async fn process_directory(
        &self,
        job: &SemanticJobRecord,
        cancel: &CancelToken,
    ) -> VikingResult<()> {
        if cancel.is_cancelled() {
            return Err(VikingError::cancelled("semantic job cancelled"));
        }
        let children = self.agfs.ls(&job.uri, LsOptions::default()).await?;

        let summaries = self.summarise_file_children(job, &children, cancel).await?;

        let mut context_entries: Vec<(String, &'static str, String)> = Vec::new();
        for child in &children {
            let name = child
                .uri
                .name()
                .ok_or_else(|| VikingError::invariant_violation("child without a name"))?
                .to_string();
            if child.is_dir {
                let child_abstract = match self.agfs.abstract_of(&child.uri).await {
                    Ok(text) => text,
                    Err(error) if error.code == ErrorCode::NotProcessed => {
                        return Err(VikingError::invariant_violation(format!(
                            "child '{}' of '{}' has no abstract despite eligibility",
                            child.uri, job.uri
                        )));
                    }
                    Err(error) => return Err(error),
                };
                context_entries.push((name, "dir", first_line(&child_abstract)));
            } else {
                let summary = summaries.get(&name).cloned().unwrap_or_default();
                context_entries.push((name, "file", first_line(&summary)));
            }
        }

        let overview = self.compose_overview(job, &context_entries, cancel).await?;
        let abstract_text = derive_abstract(&overview);

        // Overview first: a reader that sees the abstract also sees the
        // overview.
        self.agfs
            .write(
                &job.uri.join(OVERVIEW_FILE_NAME)?,
                overview.as_bytes(),
                WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await?;
        self.agfs
            .write(
                &job.uri.join(ABSTRACT_FILE_NAME)?,
                abstract_text.as_bytes(),
                WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await?;

        self.embedding
            .enqueue_unique(job.uri.clone(), VectorSource::Abstract, Modality::Text)
            .await?;
        self.embedding
            .enqueue_unique(job.uri.clone(), VectorSource::Overview, Modality::Text)
            .await?;
        for child in children.iter().filter(|entry| !entry.is_dir) {
            self.embedding
                .enqueue_unique(child.uri.clone(), VectorSource::Raw, Modality::Text)
                .await?;
        }
        tracing::info!(uri = %job.uri, "semantic artefacts written");
        Ok(())
    }

    /// Summarises file children, reusing the hidden per-directory cache.
    async fn summarise_file_children(
        &self,
        job: &SemanticJobRecord,
        children: &[ListEntry],
        cancel: &CancelToken,
    ) -> VikingResult<BTreeMap<String, String>> {
        let cache_uri = job.uri.join(FILE_SUMMARIES_NAME)?;
        let mut summaries: BTreeMap<String, String> = match self.agfs.read(&cache_uri).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => BTreeMap::new(),
        };

        let mut tasks: JoinSet<VikingResult<(String, String)>> = JoinSet::new();
        for child in children.iter().filter(|entry| !entry.is_dir) {
            let name = match child.uri.name() {
                Some(name) => name.to_string(),
                None => continue,
            };
            if summaries.contains_key(&name) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(VikingError::cancelled("semantic job cancelled"));
            }
            let worker_agfs = self.agfs.clone();
            let summarizer = Arc::clone(&self.summarizer);
            let slots = Arc::clone(&self.llm_slots);
            let mode = self.config.code_summary_mode;
            let uri = child.uri.clone();
            tasks.spawn(async move {
                let summary =
                    summarise_file(&worker_agfs, summarizer.as_ref(), &slots, &uri, mode).await?;
                Ok((uri.name().unwrap_or_default().to_string(), summary))
            });
        }

        let mut changed = false;
        while let Some(joined) = tasks.join_next().await {
            let (name, summary) = joined
                .map_err(|error| VikingError::dependency(format!("summary task failed: {error}")))??;
            summaries.insert(name, summary);
            changed = true;
        }

        if changed {
            self.agfs
                .write(
                    &cache_uri,
                    &serde_json::to_vec(&summaries)?,
                    WriteOptions {
                        create_only: false,
                        create_parents: true,
                    },
                )
                .await?;
        }
        Ok(summaries)
    }

    /// Builds the L1 overview, batching when a directory has many children.
    async fn compose_overview(
        &self,
        job: &SemanticJobRecord,
        entries: &[(String, &'static str, String)],
        cancel: &CancelToken,
    ) -> VikingResult<String> {
        let name = job.uri.name().unwrap_or("root");
        if entries.len() <= self.config.max_sections_per_call {
            return self.overview_call(name, job.kind, entries, cancel).await;
        }

        let mut partials = Vec::new();
        for chunk in entries.chunks(self.config.max_sections_per_call) {
            partials.push(self.overview_call(name, job.kind, chunk, cancel).await?);
        }
        let merged: Vec<(String, &'static str, String)> = partials
            .into_iter()
            .enumerate()
            .map(|(index, partial)| (format!("part-{}", index + 1), "dir", first_line(&partial)))
            .collect();
        self.overview_call(name, job.kind, &merged, cancel).await
    }

    async fn overview_call(
        &self,
        name: &str,
        kind: ScopeKind,
        entries: &[(String, &'static str, String)],
        cancel: &CancelToken,
    ) -> VikingResult<String> {
        if cancel.is_cancelled() {
            return Err(VikingError::cancelled("semantic job cancelled"));
        }
        let mut prompt = format!(
            "Write an overview of the {} directory '{name}'. Start with one paragraph \
             (at most {ABSTRACT_MAX_WORDS} words) stating its purpose and contents, then \
             list every child with a one-line role.\n\nChildren:\n",
            kind.as_str(),
        );
        for (child_name, child_kind, child_abstract) in entries {
            prompt.push_str(&format!("- {child_name} ({child_kind}): {child_abstract}\n"));
        }

        let _permit = self
            .llm_slots
            .acquire()
            .await
            .map_err(|_| VikingError::cancelled("llm semaphore closed"))?;
        let outcome = self
            .summarizer
            .summarise(SummariseRequest::text(prompt))
            .await
            .map_err(VikingError::from)?;
        if outcome.text.trim().is_empty() {
            return Err(VikingError::dependency("summariser returned empty overview"));
        }
        Ok(outcome.text)
    }
}

/// Summarises one file child: skeleton shortcut for large code files,
/// multimodal call for images, plain LLM call otherwise.
async fn summarise_file(
    agfs: &Agfs,
    summarizer: &dyn Summarizer,
    slots: &Semaphore,
    uri: &VikingUri,
    mode: CodeSummaryMode,
) -> VikingResult<String> {
    let name = uri.name().unwrap_or_default().to_string();
    let extension = name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();
    let bytes = agfs.read(uri).await?;

    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        let _permit = slots
            .acquire()
            .await
            .map_err(|_| VikingError::cancelled("llm semaphore closed"))?;
        let request = SummariseRequest {
            prompt: format!("Describe the image '{name}' in one short paragraph."),
            images: vec![ImageSource::Base64 {
                mime_type: format!("image/{extension}"),
                data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            }],
        };
        let outcome = summarizer.summarise(request).await.map_err(VikingError::from)?;
        return Ok(outcome.text);
    }

    let text = String::from_utf8_lossy(&bytes);
    let language = CodeLanguage::from_extension(&extension);
    let line_count = text.lines().count();

    let skeleton = match (mode, language) {
        (CodeSummaryMode::Llm, _) | (_, None) => None,
        (_, Some(language)) if line_count >= SKELETON_MIN_LINES => {
            extract_skeleton(language, &text)
        }
        _ => None,
    };

    match (mode, skeleton) {
        // The skeleton itself is the summary; no LLM call.
        (CodeSummaryMode::Ast, Some(skeleton)) => Ok(skeleton),
        (CodeSummaryMode::AstLlm, Some(skeleton)) => {
            let prompt = format!(
                "Summarise the source file '{name}' in one short paragraph. Its \
                 structural skeleton:\n\n{skeleton}\n\nUse full docstrings where helpful."
            );
            let _permit = slots
                .acquire()
                .await
                .map_err(|_| VikingError::cancelled("llm semaphore closed"))?;
            let outcome = summarizer
                .summarise(SummariseRequest::text(prompt))
                .await
                .map_err(VikingError::from)?;
            Ok(outcome.text)
        }
        _ => {
            let mut content: String = text.chars().take(FILE_SUMMARY_MAX_CHARS).collect();
            if content.len() < text.len() {
                content.push_str("\n[truncated]");
            }
            let prompt = format!(
                "Summarise the file '{name}' in one short paragraph focused on what it \
                 contains and what it is for.\n\n{content}"
            );
            let _permit = slots
                .acquire()
                .await
                .map_err(|_| VikingError::cancelled("llm semaphore closed"))?;
            let outcome = summarizer
                .summarise(SummariseRequest::text(prompt))
                .await
                .map_err(VikingError::from)?;
            Ok(outcome.text)
        }
    }
}

/// First paragraph of the overview, truncated to the abstract word budget.
pub fn derive_abstract(overview: &str) -> String {
    let first_paragraph = overview
        .split("\n\n")
        .map(str::trim)
        .find(|paragraph| !paragraph.is_empty())
        .unwrap_or("");
    let words: Vec<&str> = first_paragraph.split_whitespace().collect();
    if words.len() <= ABSTRACT_MAX_WORDS {
        first_paragraph.to_string()
    } else {
        words[..ABSTRACT_MAX_WORDS].join(" ")
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .chars()
        .take(240)
        .collect()
}
