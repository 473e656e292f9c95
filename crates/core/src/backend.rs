//! Storage abstraction for the job store and the retry registry.
//!
//! Both tables live behind one `Backend` so that the exception handler can
//! resolve a failed job (job status, registry row and successor job) in a
//! single atomic unit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::job::{ExceptionKind, Job, JobId, JobStatus, JobUpdate, NewJob};
use crate::registry::RetryEntry;

/// Job counts per status plus the retry breakdown shown on dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub retry_enqueued: usize,
    pub escalated: usize,
    pub notified: usize,
    /// Pending jobs that are the first retry of their lineage.
    pub first_retry_pending: usize,
    /// Failed jobs that were already retried at least twice.
    pub failed_after_retries: usize,
}

impl QueueStats {
    /// Count one job.
    pub fn add(&mut self, status: JobStatus, attempt_number: u32) {
        self.add_many(status, attempt_number, 1);
    }

    /// Count `n` jobs sharing a status and attempt number.
    pub fn add_many(&mut self, status: JobStatus, attempt_number: u32, n: usize) {
        self.total += n;
        match status {
            JobStatus::Pending => {
                self.pending += n;
                if attempt_number == 1 {
                    self.first_retry_pending += n;
                }
            }
            JobStatus::Claimed => self.claimed += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => {
                self.failed += n;
                if attempt_number >= 2 {
                    self.failed_after_retries += n;
                }
            }
            JobStatus::RetryEnqueued => self.retry_enqueued += n,
            JobStatus::Escalated => self.escalated += n,
            JobStatus::Notified => self.notified += n,
        }
    }

    /// Tally a slice of jobs.
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut stats = Self::default();
        for job in jobs {
            stats.add(job.status, job.attempt_number);
        }
        stats
    }

    /// Number of jobs in `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Claimed => self.claimed,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::RetryEnqueued => self.retry_enqueued,
            JobStatus::Escalated => self.escalated,
            JobStatus::Notified => self.notified,
        }
    }
}

/// Decision taken by the exception handler for one failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Grant a retry: registry gains an attempt, the successor is enqueued
    /// with `new_identifier`, the failed job becomes `RetryEnqueued`.
    Retry {
        job_id: JobId,
        lineage_id: String,
        new_identifier: String,
        requester_contact: Option<String>,
        successor: NewJob,
    },
    /// Retry budget exhausted: registry and job both become `Escalated`.
    Escalate { job_id: JobId, lineage_id: String },
    /// Lineage already escalated: only the job is closed.
    CloseDuplicate { job_id: JobId },
    /// Permanent data fault: the job becomes `Notified`.
    Notify { job_id: JobId },
}

impl Resolution {
    /// The failed job being resolved.
    pub fn job_id(&self) -> &JobId {
        match self {
            Resolution::Retry { job_id, .. }
            | Resolution::Escalate { job_id, .. }
            | Resolution::CloseDuplicate { job_id }
            | Resolution::Notify { job_id } => job_id,
        }
    }

    /// Status the failed job ends up in.
    pub fn target_status(&self) -> JobStatus {
        match self {
            Resolution::Retry { .. } => JobStatus::RetryEnqueued,
            Resolution::Escalate { .. } | Resolution::CloseDuplicate { .. } => {
                JobStatus::Escalated
            }
            Resolution::Notify { .. } => JobStatus::Notified,
        }
    }
}

/// Result of applying a [`Resolution`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// Everything was written. Carries the successor job for retries.
    Applied { successor: Option<Job> },
    /// The job was no longer `Failed`; nothing was written.
    Stale,
}

/// Durable table of job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a Pending job.
    async fn enqueue(&self, job: Job) -> Result<JobId>;

    /// Atomically move the oldest Pending job to Claimed for `worker`.
    ///
    /// At most one caller ever receives a given job.
    async fn claim_next(&self, worker: &str) -> Result<Option<Job>>;

    /// Claimed -> Completed.
    async fn complete(&self, job_id: &JobId) -> Result<()>;

    /// Claimed -> Failed, recording the exception kind.
    async fn fail(&self, job_id: &JobId, kind: ExceptionKind) -> Result<()>;

    /// Generic forward status change. Always refreshes `updated_at`.
    async fn update(&self, job_id: &JobId, update: JobUpdate) -> Result<Job>;

    /// Jobs in `status`, oldest first.
    async fn query_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// A single job.
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>>;

    /// Every job, oldest first.
    async fn all_jobs(&self) -> Result<Vec<Job>>;

    /// Counts per status.
    async fn stats(&self) -> Result<QueueStats>;

    /// Whether any job uses `identifier` as work identifier or lineage.
    async fn identifier_in_use(&self, identifier: &str) -> Result<bool>;
}

/// Durable table of per-lineage retry state.
#[async_trait]
pub trait RetryRegistry: Send + Sync {
    async fn lookup(&self, lineage_id: &str) -> Result<Option<RetryEntry>>;

    /// Create the entry with one attempt, or append one more attempt.
    async fn record_attempt(
        &self,
        lineage_id: &str,
        new_identifier: &str,
        requester_contact: Option<&str>,
    ) -> Result<RetryEntry>;

    /// Mark the lineage escalated. Idempotent.
    async fn escalate(&self, lineage_id: &str) -> Result<RetryEntry>;

    async fn is_escalated(&self, lineage_id: &str) -> Result<bool> {
        Ok(self
            .lookup(lineage_id)
            .await?
            .map(|entry| entry.is_escalated())
            .unwrap_or(false))
    }

    /// Every registry entry.
    async fn entries(&self) -> Result<Vec<RetryEntry>>;
}

/// Combined store. Implementations must be thread-safe.
#[async_trait]
pub trait Backend: JobStore + RetryRegistry {
    /// Apply a resolution as one atomic unit.
    ///
    /// The failed job is moved out of `Failed` with a compare-and-swap; if it
    /// is no longer `Failed` nothing is written and `Stale` is returned.
    async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome>;

    /// Remove every job and registry entry.
    async fn clear(&self) -> Result<()>;
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl JobStore for SharedBackend {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        self.inner.enqueue(job).await
    }

    async fn claim_next(&self, worker: &str) -> Result<Option<Job>> {
        self.inner.claim_next(worker).await
    }

    async fn complete(&self, job_id: &JobId) -> Result<()> {
        self.inner.complete(job_id).await
    }

    async fn fail(&self, job_id: &JobId, kind: ExceptionKind) -> Result<()> {
        self.inner.fail(job_id, kind).await
    }

    async fn update(&self, job_id: &JobId, update: JobUpdate) -> Result<Job> {
        self.inner.update(job_id, update).await
    }

    async fn query_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.inner.query_by_status(status).await
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.inner.get(job_id).await
    }

    async fn all_jobs(&self) -> Result<Vec<Job>> {
        self.inner.all_jobs().await
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.inner.stats().await
    }

    async fn identifier_in_use(&self, identifier: &str) -> Result<bool> {
        self.inner.identifier_in_use(identifier).await
    }
}

#[async_trait]
impl RetryRegistry for SharedBackend {
    async fn lookup(&self, lineage_id: &str) -> Result<Option<RetryEntry>> {
        self.inner.lookup(lineage_id).await
    }

    async fn record_attempt(
        &self,
        lineage_id: &str,
        new_identifier: &str,
        requester_contact: Option<&str>,
    ) -> Result<RetryEntry> {
        self.inner
            .record_attempt(lineage_id, new_identifier, requester_contact)
            .await
    }

    async fn escalate(&self, lineage_id: &str) -> Result<RetryEntry> {
        self.inner.escalate(lineage_id).await
    }

    async fn is_escalated(&self, lineage_id: &str) -> Result<bool> {
        self.inner.is_escalated(lineage_id).await
    }

    async fn entries(&self) -> Result<Vec<RetryEntry>> {
        self.inner.entries().await
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome> {
        self.inner.resolve(resolution).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Payload;

    #[test]
    fn test_stats_breakdown() {
        let mut stats = QueueStats::default();
        stats.add(JobStatus::Pending, 0);
        stats.add(JobStatus::Pending, 1);
        stats.add(JobStatus::Failed, 2);
        stats.add(JobStatus::Failed, 0);
        stats.add(JobStatus::Completed, 0);

        assert_eq!(stats.total, 5);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.first_retry_pending, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.failed_after_retries, 1);
        assert_eq!(stats.count(JobStatus::Completed), 1);
        assert_eq!(stats.count(JobStatus::Escalated), 0);
    }

    #[test]
    fn test_resolution_targets() {
        let job_id = JobId::new();
        let retry = Resolution::Retry {
            job_id: job_id.clone(),
            lineage_id: "L".into(),
            new_identifier: "N".into(),
            requester_contact: None,
            successor: NewJob::new(Payload::default()),
        };
        assert_eq!(retry.target_status(), JobStatus::RetryEnqueued);
        assert_eq!(retry.job_id(), &job_id);
        assert_eq!(
            Resolution::CloseDuplicate {
                job_id: job_id.clone()
            }
            .target_status(),
            JobStatus::Escalated
        );
        assert_eq!(
            Resolution::Notify { job_id }.target_status(),
            JobStatus::Notified
        );
    }
}
