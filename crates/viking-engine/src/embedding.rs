//! Embedding queue and worker.
//!
//! Jobs carry no ordering dependency. The worker coalesces same-modality
//! jobs into one provider call per batch, then upserts one vector per job
//! keyed by `(uri, source)`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;
use viking_agfs::{Agfs, ABSTRACT_FILE_NAME, OVERVIEW_FILE_NAME};
use viking_ai::{EmbedModality, Embedder};
use viking_core::backoff::{next_backoff_ms_with_jitter, MAX_ATTEMPTS};
use viking_core::{
    current_unix_timestamp, current_unix_timestamp_ms, CancelToken, EngineConfig, Scope,
    VikingError, VikingResult, VikingUri,
};
use viking_vector::{Modality, VectorRecord, VectorSource, VectorStore};

use crate::queue::{JobStatus, QueueCounts, QueueJob, QueueStore};
use crate::semantic::FILE_SUMMARIES_NAME;

pub const EMBEDDING_QUEUE_DIR: &str = "viking://.system/queues/embedding";

const WORKER_POLL_MS: u64 = 50;
const PAYLOAD_TEXT_MAX_CHARS: usize = 800;

fn queue_schema_version() -> u32 {
    crate::queue::QUEUE_SCHEMA_VERSION
}

/// One unit of embedding work: vectorise an artefact of `uri`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJobRecord {
    #[serde(default = "queue_schema_version")]
    pub schema_version: u32,
    pub id: String,
    pub uri: VikingUri,
    pub source: VectorSource,
    pub modality: Modality,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: u64,
    pub updated_at: u64,
    pub lease_expires_at: Option<u64>,
    pub not_before: Option<u64>,
}

impl EmbeddingJobRecord {
    pub fn new(uri: VikingUri, source: VectorSource, modality: Modality) -> Self {
        let now_ms = current_unix_timestamp_ms();
        Self {
            schema_version: queue_schema_version(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            uri,
            source,
            modality,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: now_ms,
            updated_at: now_ms,
            lease_expires_at: None,
            not_before: None,
        }
    }
}

impl QueueJob for EmbeddingJobRecord {
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

/// The persistent embedding queue.
pub struct EmbeddingQueue {
    store: QueueStore<EmbeddingJobRecord>,
}

impl EmbeddingQueue {
    pub async fn open(agfs: Agfs) -> VikingResult<Self> {
        let dir = VikingUri::parse(EMBEDDING_QUEUE_DIR)?;
        Ok(Self {
            store: QueueStore::open(agfs, dir).await?,
        })
    }

    pub fn store(&self) -> &QueueStore<EmbeddingJobRecord> {
        &self.store
    }

    /// Enqueues unless a live job already covers `(uri, source)`.
    pub async fn enqueue_unique(
        &self,
        uri: VikingUri,
        source: VectorSource,
        modality: Modality,
    ) -> VikingResult<bool> {
        let live = self.store.snapshot().into_iter().any(|job| {
            job.uri == uri && job.source == source && !job.status.is_terminal()
        });
        if live {
            return Ok(false);
        }
        self.store
            .enqueue(EmbeddingJobRecord::new(uri, source, modality))
            .await?;
        Ok(true)
    }

    pub fn counts(&self) -> QueueCounts {
        self.store.counts()
    }
}

/// Background worker draining the embedding queue in batches.
pub struct EmbeddingWorker {
    agfs: Agfs,
    queue: Arc<EmbeddingQueue>,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    config: Arc<EngineConfig>,
}

impl EmbeddingWorker {
    pub fn new(
        agfs: Agfs,
        queue: Arc<EmbeddingQueue>,
        vector: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            agfs,
            queue,
            vector,
            embedder,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        let mut batches: JoinSet<()> = JoinSet::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(error) = self.queue.store().recover_expired_leases().await {
                tracing::warn!(%error, "embedding lease recovery failed");
            }
            while batches.try_join_next().is_some() {}

            while batches.len() < self.config.max_concurrent_embedding_jobs.max(1) {
                match self.claim_batch().await {
                    Ok(batch) if batch.is_empty() => break,
                    Ok(batch) => {
                        let worker = Arc::clone(&self);
                        batches.spawn(async move {
                            worker.process_batch(batch).await;
                        });
                    }
                    Err(error) => {
                        tracing::warn!(%error, "embedding claim sweep failed");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(WORKER_POLL_MS)) => {}
            }
        }

        batches.shutdown().await;
        if let Err(error) = self.release_in_progress().await {
            tracing::warn!(%error, "failed to release embedding leases on shutdown");
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

    /// Claims up to `embedding_batch_size` jobs sharing one modality.
    async fn claim_batch(&self) -> VikingResult<Vec<EmbeddingJobRecord>> {
        let lease_ms = self.config.job_lease_timeout_ms;
        let Some(first) = self.queue.store().claim_next(lease_ms, |_| true).await? else {
            return Ok(Vec::new());
        };
        let modality = first.modality;
        let mut batch = vec![first];
        while batch.len() < self.config.embedding_batch_size {
            let claimed = self
                .queue
                .store()
                .claim_next(lease_ms, |job| job.modality == modality)
                .await?;
            match claimed {
                Some(job) => batch.push(job),
                None => break,
            }
        }
        Ok(batch)
    }

    async fn process_batch(&self, batch: Vec<EmbeddingJobRecord>) {
        let mut ready: Vec<(EmbeddingJobRecord, String)> = Vec::new();
        for job in batch {
            match self.artefact_text(&job).await {
                Ok(text) => ready.push((job, text)),
                Err(error) => {
                    let outcome = if error.code.is_transient()
                        && (job.attempts as usize) + 1 < MAX_ATTEMPTS
                    {
                        let delay_ms = next_backoff_ms_with_jitter(job.attempts as usize);
                        self.queue
                            .store()
                            .retry_later(
                                &job.id,
                                &error.to_string(),
                                current_unix_timestamp_ms() + delay_ms,
                            )
                            .await
                    } else {
                        self.queue.store().fail(&job.id, &error.to_string()).await
                    };
                    if let Err(error) = outcome {
                        tracing::error!(%error, "failed to persist embedding job outcome");
                    }
                }
            }
        }
        if ready.is_empty() {
            return;
        }

        let modality = match ready[0].0.modality {
            Modality::Text => EmbedModality::Text,
            Modality::Multimodal => EmbedModality::Multimodal,
        };
        let texts: Vec<String> = ready.iter().map(|(_, text)| text.clone()).collect();
        match self.embedder.embed(&texts, modality).await {
            Ok(outcome) if outcome.vectors.len() == ready.len() => {
                for ((job, text), vector) in ready.into_iter().zip(outcome.vectors) {
                    self.finish_upsert(job, text, vector).await;
                }
            }
            Ok(outcome) => {
                let error = VikingError::dependency(format!(
                    "embedder returned {} vectors for {} inputs",
                    outcome.vectors.len(),
                    ready.len()
                ));
                self.park_batch(ready, &error).await;
            }
            Err(error) => {
                let transient = error.is_transient();
                let error = VikingError::from(error);
                if transient {
                    self.park_batch(ready, &error).await;
                } else {
                    for (job, _) in ready {
                        if let Err(persist_error) =
                            self.queue.store().fail(&job.id, &error.to_string()).await
                        {
                            tracing::error!(%persist_error, "failed to fail embedding job");
                        }
                    }
                }
            }
        }
    }

    /// Returns transiently failed jobs to the queue with backoff.
    async fn park_batch(&self, ready: Vec<(EmbeddingJobRecord, String)>, error: &VikingError) {
        for (job, _) in ready {
            let outcome = if (job.attempts as usize) + 1 < MAX_ATTEMPTS {
                let delay_ms = next_backoff_ms_with_jitter(job.attempts as usize);
                self.queue
                    .store()
                    .retry_later(
                        &job.id,
                        &error.to_string(),
                        current_unix_timestamp_ms() + delay_ms,
                    )
                    .await
            } else {
                self.queue.store().fail(&job.id, &error.to_string()).await
            };
            if let Err(persist_error) = outcome {
                tracing::error!(%persist_error, "failed to park embedding job");
            }
        }
    }

    async fn finish_upsert(&self, job: EmbeddingJobRecord, text: String, vector: Vec<f32>) {
        let payload_text: String = text.chars().take(PAYLOAD_TEXT_MAX_CHARS).collect();
        let record = VectorRecord {
            uri: job.uri.clone(),
            source: job.source,
            modality: job.modality,
            vector,
            payload: json!({
                "text": payload_text,
                "source": job.source.as_str(),
                "category": memory_category(&job.uri),
                "active_count": 0,
                "updated_at": current_unix_timestamp(),
            }),
            updated_at: current_unix_timestamp(),
        };
        let outcome = match self.vector.upsert(record).await {
            Ok(()) => self.queue.store().complete(&job.id).await,
            Err(error) if error.code.is_transient() && (job.attempts as usize) + 1 < MAX_ATTEMPTS => {
                let delay_ms = next_backoff_ms_with_jitter(job.attempts as usize);
                self.queue
                    .store()
                    .retry_later(
                        &job.id,
                        &error.to_string(),
                        current_unix_timestamp_ms() + delay_ms,
                    )
                    .await
            }
            Err(error) => self.queue.store().fail(&job.id, &error.to_string()).await,
        };
        if let Err(error) = outcome {
            tracing::error!(%error, "failed to persist embedding upsert outcome");
        }
    }

    /// Loads the text a job embeds: an artefact file, or leaf raw content
    /// (falling back to the cached summary for binary leaves).
    async fn artefact_text(&self, job: &EmbeddingJobRecord) -> VikingResult<String> {
        match job.source {
            VectorSource::Abstract => {
                let bytes = self.agfs.read(&job.uri.join(ABSTRACT_FILE_NAME)?).await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            VectorSource::Overview => {
                let bytes = self.agfs.read(&job.uri.join(OVERVIEW_FILE_NAME)?).await?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            VectorSource::Raw => {
                let bytes = self.agfs.read(&job.uri).await?;
                match String::from_utf8(bytes) {
                    Ok(text) => Ok(text),
                    Err(_) => self.cached_summary_for(&job.uri).await,
                }
            }
        }
    }

    async fn cached_summary_for(&self, uri: &VikingUri) -> VikingResult<String> {
        let parent = uri
            .parent()
            .ok_or_else(|| VikingError::invariant_violation("leaf without a parent"))?;
        let name = uri
            .name()
            .ok_or_else(|| VikingError::invariant_violation("leaf without a name"))?;
        let bytes = self.agfs.read(&parent.join(FILE_SUMMARIES_NAME)?).await.map_err(|_| {
            VikingError::invalid_argument(format!(
                "binary leaf '{uri}' has no cached summary to embed"
            ))
        })?;
        let summaries: std::collections::BTreeMap<String, String> =
            serde_json::from_slice(&bytes)?;
        summaries.get(name).cloned().ok_or_else(|| {
            VikingError::invalid_argument(format!(
                "binary leaf '{uri}' has no cached summary to embed"
            ))
        })
    }
}

/// Memory category segment of a URI under `viking://user/memories/<root>/`.
pub fn memory_category(uri: &VikingUri) -> Option<String> {
    if uri.scope() != Some(Scope::User) {
        return None;
    }
    let segments: Vec<&str> = uri.segments().collect();
    // user / memories / <root> / <category> / ...
    if segments.len() >= 4 && segments[1] == "memories" {
        Some(segments[3].to_string())
    } else {
        None
    }
}
