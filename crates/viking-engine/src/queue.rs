//! Persistent job queues backed by AGFS.
//!
//! Each job is one JSON file under the reserved `viking://.system/queues/`
//! prefix. A claim transitions `pending → in_progress` under the store lock
//! and stamps a lease; jobs whose lease expires (crashed worker) revert to
//! `pending` on the next recovery sweep.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use viking_agfs::{Agfs, LsOptions, WriteOptions};
use viking_core::{current_unix_timestamp_ms, VikingError, VikingResult, VikingUri};

pub const QUEUE_SCHEMA_VERSION: u32 = 1;

pub const QUEUE_REASON_ENQUEUED: &str = "job_enqueued";
pub const QUEUE_REASON_CLAIMED: &str = "job_claimed";
pub const QUEUE_REASON_DONE: &str = "job_done";
pub const QUEUE_REASON_FAILED: &str = "job_failed";
pub const QUEUE_REASON_RETRY_SCHEDULED: &str = "job_retry_scheduled";
pub const QUEUE_REASON_LEASE_EXPIRED: &str = "job_lease_expired";

/// Enumerates the lifecycle states of a queued job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl JobStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Returns true when the job cannot transition any further on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Aggregate queue counts reported by `wait` and readiness probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub processed: u64,
    pub errors: u64,
}

impl QueueCounts {
    pub fn drained(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            pending: self.pending + other.pending,
            in_progress: self.in_progress + other.in_progress,
            processed: self.processed + other.processed,
            errors: self.errors + other.errors,
        }
    }
}

/// Contract a job record implements to live in a [`QueueStore`].
pub trait QueueJob:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn id(&self) -> &str;
    fn uri(&self) -> &VikingUri;
    fn status(&self) -> JobStatus;
    fn set_status(&mut self, status: JobStatus);
    fn enqueued_at(&self) -> u64;
    fn set_updated_at(&mut self, now_ms: u64);
    fn attempts(&self) -> u32;
    fn bump_attempts(&mut self);
    fn set_last_error(&mut self, error: Option<String>);
    fn lease_expires_at(&self) -> Option<u64>;
    fn set_lease_expires_at(&mut self, lease: Option<u64>);
    fn not_before(&self) -> Option<u64>;
    fn set_not_before(&mut self, not_before: Option<u64>);
}

/// One persistent FIFO queue of JSON job files.
pub struct QueueStore<T: QueueJob> {
    agfs: Agfs,
    dir: VikingUri,
    jobs: Mutex<BTreeMap<String, T>>,
}

impl<T: QueueJob> QueueStore<T> {
    /// Opens the queue directory and replays every persisted job.
    pub async fn open(agfs: Agfs, dir: VikingUri) -> VikingResult<Self> {
        agfs.mkdirp(&dir).await?;
        let store = Self {
            agfs,
            dir,
            jobs: Mutex::new(BTreeMap::new()),
        };
        store.load().await?;
        Ok(store)
    }

    async fn load(&self) -> VikingResult<()> {
        let entries = self
            .agfs
            .ls(
                &self.dir,
                LsOptions {
                    recursive: false,
                    include_hidden: true,
                    node_limit: None,
                },
            )
            .await?;
        let mut jobs = BTreeMap::new();
        for entry in entries {
            if entry.is_dir {
                continue;
            }
            let Some(name) = entry.uri.name() else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let bytes = self.agfs.read(&entry.uri).await?;
            match serde_json::from_slice::<T>(&bytes) {
                Ok(job) => {
                    jobs.insert(job.id().to_string(), job);
                }
                Err(error) => {
                    tracing::warn!(uri = %entry.uri, %error, "skipping unreadable job record");
                }
            }
        }
        *self.jobs.lock().expect("queue lock") = jobs;
        Ok(())
    }

    fn job_file(&self, id: &str) -> VikingResult<VikingUri> {
        self.dir.join(&format!("{id}.json"))
    }

    async fn persist(&self, job: &T) -> VikingResult<()> {
        let uri = self.job_file(job.id())?;
        let bytes = serde_json::to_vec(job)?;
        self.agfs
            .write(
                &uri,
                &bytes,
                WriteOptions {
                    create_only: false,
                    create_parents: true,
                },
            )
            .await
    }

    /// Adds a new pending job.
    pub async fn enqueue(&self, job: T) -> VikingResult<()> {
        self.persist(&job).await?;
        tracing::debug!(
            id = job.id(),
            uri = %job.uri(),
            reason = QUEUE_REASON_ENQUEUED,
            "enqueued job"
        );
        self.jobs
            .lock()
            .expect("queue lock")
            .insert(job.id().to_string(), job);
        Ok(())
    }

    /// Claims the oldest eligible pending job, if any.
    ///
    /// `eligible` runs under the store lock and must not block.
    pub async fn claim_next(
        &self,
        lease_ms: u64,
        eligible: impl Fn(&T) -> bool,
    ) -> VikingResult<Option<T>> {
        let now_ms = current_unix_timestamp_ms();
        let claimed = {
            let mut jobs = self.jobs.lock().expect("queue lock");
            let mut candidates: Vec<&T> = jobs
                .values()
                .filter(|job| job.status() == JobStatus::Pending)
                .filter(|job| job.not_before().map_or(true, |at| at <= now_ms))
                .collect();
            candidates.sort_by(|left, right| {
                left.enqueued_at()
                    .cmp(&right.enqueued_at())
                    .then_with(|| left.id().cmp(right.id()))
            });
            let chosen = candidates
                .into_iter()
                .find(|job| eligible(job))
                .map(|job| job.id().to_string());
            match chosen {
                Some(id) => {
                    let job = jobs.get_mut(&id).expect("chosen job present");
                    job.set_status(JobStatus::InProgress);
                    job.set_lease_expires_at(Some(now_ms + lease_ms));
                    job.set_updated_at(now_ms);
                    Some(job.clone())
                }
                None => None,
            }
        };
        if let Some(job) = &claimed {
            self.persist(job).await?;
            tracing::debug!(id = job.id(), reason = QUEUE_REASON_CLAIMED, "claimed job");
        }
        Ok(claimed)
    }

    /// Marks a claimed job done.
    pub async fn complete(&self, id: &str) -> VikingResult<()> {
        self.transition(id, |job, now_ms| {
            job.set_status(JobStatus::Done);
            job.set_lease_expires_at(None);
            job.set_last_error(None);
            job.set_updated_at(now_ms);
            QUEUE_REASON_DONE
        })
        .await
    }

    /// Marks a claimed job failed with its terminal error.
    pub async fn fail(&self, id: &str, error: &str) -> VikingResult<()> {
        let error = error.to_string();
        self.transition(id, move |job, now_ms| {
            job.set_status(JobStatus::Failed);
            job.set_lease_expires_at(None);
            job.set_last_error(Some(error.clone()));
            job.set_updated_at(now_ms);
            QUEUE_REASON_FAILED
        })
        .await
    }

    /// Returns a claimed job to `pending` with a retry delay.
    pub async fn retry_later(
        &self,
        id: &str,
        error: &str,
        not_before_ms: u64,
    ) -> VikingResult<()> {
        let error = error.to_string();
        self.transition(id, move |job, now_ms| {
            job.set_status(JobStatus::Pending);
            job.set_lease_expires_at(None);
            job.bump_attempts();
            job.set_last_error(Some(error.clone()));
            job.set_not_before(Some(not_before_ms));
            job.set_updated_at(now_ms);
            QUEUE_REASON_RETRY_SCHEDULED
        })
        .await
    }

    /// Returns a claimed job to `pending` without counting an attempt, e.g.
    /// on worker shutdown.
    pub async fn release(&self, id: &str) -> VikingResult<()> {
        self.transition(id, |job, now_ms| {
            job.set_status(JobStatus::Pending);
            job.set_lease_expires_at(None);
            job.set_updated_at(now_ms);
            QUEUE_REASON_ENQUEUED
        })
        .await
    }

    /// Re-enqueues a failed job (manual intervention path).
    pub async fn requeue_failed(&self, id: &str) -> VikingResult<()> {
        self.transition(id, |job, now_ms| {
            job.set_status(JobStatus::Pending);
            job.set_not_before(None);
            job.set_updated_at(now_ms);
            QUEUE_REASON_ENQUEUED
        })
        .await
    }

    async fn transition(
        &self,
        id: &str,
        apply: impl FnOnce(&mut T, u64) -> &'static str,
    ) -> VikingResult<()> {
        let now_ms = current_unix_timestamp_ms();
        let (job, reason) = {
            let mut jobs = self.jobs.lock().expect("queue lock");
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| VikingError::not_found(format!("job '{id}'")))?;
            let reason = apply(job, now_ms);
            (job.clone(), reason)
        };
        self.persist(&job).await?;
        tracing::debug!(id, reason, status = job.status().as_str(), "job transition");
        Ok(())
    }

    /// Reverts in-progress jobs with expired leases back to pending.
    pub async fn recover_expired_leases(&self) -> VikingResult<u64> {
        let now_ms = current_unix_timestamp_ms();
        let expired: Vec<T> = {
            let mut jobs = self.jobs.lock().expect("queue lock");
            let ids: Vec<String> = jobs
                .values()
                .filter(|job| {
                    job.status() == JobStatus::InProgress
                        && job.lease_expires_at().map_or(false, |at| at <= now_ms)
                })
                .map(|job| job.id().to_string())
                .collect();
            ids.into_iter()
                .map(|id| {
                    let job = jobs.get_mut(&id).expect("expired job present");
                    job.set_status(JobStatus::Pending);
                    job.set_lease_expires_at(None);
                    job.set_updated_at(now_ms);
                    job.clone()
                })
                .collect()
        };
        for job in &expired {
            self.persist(job).await?;
            tracing::warn!(
                id = job.id(),
                uri = %job.uri(),
                reason = QUEUE_REASON_LEASE_EXPIRED,
                "recovered job from expired lease"
            );
        }
        Ok(expired.len() as u64)
    }

    /// Drops every job whose URI sits under `prefix`. Returns removed count.
    pub async fn purge_prefix(&self, prefix: &VikingUri) -> VikingResult<u64> {
        let removed: Vec<String> = {
            let mut jobs = self.jobs.lock().expect("queue lock");
            let ids: Vec<String> = jobs
                .values()
                .filter(|job| job.uri().starts_with(prefix))
                .map(|job| job.id().to_string())
                .collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };
        for id in &removed {
            let uri = self.job_file(id)?;
            if let Err(error) = self.agfs.delete(&uri, false).await {
                if error.code != viking_core::ErrorCode::NotFound {
                    return Err(error);
                }
            }
        }
        Ok(removed.len() as u64)
    }

    /// Point-in-time snapshot of every job.
    pub fn snapshot(&self) -> Vec<T> {
        self.jobs
            .lock()
            .expect("queue lock")
            .values()
            .cloned()
            .collect()
    }

    /// Aggregate counts over all jobs.
    pub fn counts(&self) -> QueueCounts {
        let jobs = self.jobs.lock().expect("queue lock");
        let mut counts = QueueCounts::default();
        for job in jobs.values() {
            match job.status() {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::InProgress => counts.in_progress += 1,
                JobStatus::Done => counts.processed += 1,
                JobStatus::Failed => counts.errors += 1,
            }
        }
        counts
    }
}
