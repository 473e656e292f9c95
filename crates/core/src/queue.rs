//! Queue manager: job lifecycle façade over a [`Backend`].

use chrono::Utc;
use rand::Rng;

use crate::backend::{Backend, QueueStats, SharedBackend};
use crate::config::QueueConfig;
use crate::error::{PlanqError, Result};
use crate::job::{ExceptionKind, Job, JobId, JobStatus, JobUpdate, NewJob, Payload};
use crate::registry::RetryEntry;

/// Characters used in generated work identifiers.
pub const IDENTIFIER_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Draw a random identifier of `length` characters. No uniqueness check.
pub fn generate_work_identifier(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| IDENTIFIER_ALPHABET[rng.gen_range(0..IDENTIFIER_ALPHABET.len())] as char)
        .collect()
}

/// Enqueue request for the successor of a failed job.
///
/// Copies the payload, keeps the lineage, bumps the attempt number and
/// appends the failed attempt to the history.
pub fn successor_of(failed: &Job) -> NewJob {
    let mut history = failed.attempt_history.clone();
    history.push(failed.as_attempt(Utc::now()));

    NewJob::new(failed.payload.clone())
        .lineage_id(failed.lineage_id.clone())
        .attempt_number(failed.attempt_number + 1)
        .attempt_history(history)
}

/// Job lifecycle operations plus identifier policy.
#[derive(Clone)]
pub struct QueueManager<B: Backend + Clone = SharedBackend> {
    backend: B,
    config: QueueConfig,
}

impl QueueManager<SharedBackend> {
    /// Create a queue manager over a shared backend.
    pub fn new(backend: impl Backend + 'static, config: QueueConfig) -> Self {
        Self {
            backend: SharedBackend::new(backend),
            config,
        }
    }
}

impl<B: Backend + Clone> QueueManager<B> {
    /// Create a queue manager over a specific backend.
    pub fn with_backend(backend: B, config: QueueConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Generate a work identifier not used by any job in the store.
    pub async fn new_identifier(&self) -> Result<String> {
        for _ in 0..self.config.identifier_attempts.max(1) {
            let candidate = generate_work_identifier(self.config.identifier_length);
            if !self.backend.identifier_in_use(&candidate).await? {
                return Ok(candidate);
            }
            tracing::debug!(candidate = %candidate, "Generated identifier already in use, redrawing");
        }

        Err(PlanqError::Config(format!(
            "no unused work identifier of length {} after {} attempts",
            self.config.identifier_length, self.config.identifier_attempts
        )))
    }

    /// Enqueue a fresh submission.
    pub async fn add_item(&self, payload: Payload) -> Result<JobId> {
        self.enqueue(NewJob::new(payload)).await
    }

    /// Enqueue a job, generating its work identifier when absent.
    pub async fn enqueue(&self, new: NewJob) -> Result<JobId> {
        let work_identifier = match new.work_identifier.clone() {
            Some(identifier) => identifier,
            None => self.new_identifier().await?,
        };
        let job = Job::from_new(new, work_identifier, Utc::now());
        let (work_identifier, lineage_id, attempt) = (
            job.work_identifier.clone(),
            job.lineage_id.clone(),
            job.attempt_number,
        );

        let job_id = self.backend.enqueue(job).await?;

        tracing::info!(
            job_id = %job_id,
            work_identifier = %work_identifier,
            lineage_id = %lineage_id,
            attempt = attempt,
            "Job enqueued"
        );
        Ok(job_id)
    }

    /// Claim the oldest pending job for `worker`.
    pub async fn claim_next(&self, worker: &str) -> Result<Option<Job>> {
        let job = self.backend.claim_next(worker).await?;
        if let Some(job) = &job {
            tracing::info!(
                job_id = %job.job_id,
                work_identifier = %job.work_identifier,
                worker = %worker,
                "Job claimed"
            );
        }
        Ok(job)
    }

    /// Mark a claimed job completed. Returns false when the job is missing
    /// or not claimed; that is reported, not fatal.
    pub async fn complete(&self, job_id: &JobId) -> Result<bool> {
        let result = self.backend.complete(job_id).await;
        if result.is_ok() {
            tracing::info!(job_id = %job_id, "Job completed");
        }
        reported(job_id, result)
    }

    /// Mark a claimed job failed with `kind`. Same reporting rules as `complete`.
    pub async fn fail(&self, job_id: &JobId, kind: ExceptionKind) -> Result<bool> {
        let reason = kind.to_string();
        let result = self.backend.fail(job_id, kind).await;
        if result.is_ok() {
            tracing::info!(job_id = %job_id, exception = %reason, "Job failed");
        }
        reported(job_id, result)
    }

    pub async fn update(&self, job_id: &JobId, update: JobUpdate) -> Result<Job> {
        self.backend.update(job_id, update).await
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.backend.get(job_id).await
    }

    pub async fn query_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.backend.query_by_status(status).await
    }

    pub async fn all_jobs(&self) -> Result<Vec<Job>> {
        self.backend.all_jobs().await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.backend.stats().await
    }

    /// Registry state of a lineage.
    pub async fn lineage(&self, lineage_id: &str) -> Result<Option<RetryEntry>> {
        self.backend.lookup(lineage_id).await
    }

    pub async fn registry_entries(&self) -> Result<Vec<RetryEntry>> {
        self.backend.entries().await
    }

    /// Remove every job and registry entry.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await?;
        tracing::info!("Queue cleared");
        Ok(())
    }
}

fn reported(job_id: &JobId, result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e @ (PlanqError::JobNotFound(_) | PlanqError::InvalidTransition { .. })) => {
            tracing::warn!(job_id = %job_id, error = %e, "Job update rejected");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn manager() -> QueueManager<MemoryBackend> {
        QueueManager::with_backend(MemoryBackend::new(), QueueConfig::default())
    }

    #[test]
    fn test_generated_identifier_shape() {
        let id = generate_work_identifier(7);
        assert_eq!(id.len(), 7);
        assert!(id.bytes().all(|b| IDENTIFIER_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn test_enqueue_generates_identifier_and_lineage() {
        let queue = manager();
        let job_id = queue.add_item(Payload::new("John Smith")).await.unwrap();
        let job = queue.get(&job_id).await.unwrap().unwrap();

        assert_eq!(job.work_identifier.len(), 7);
        assert_eq!(job.lineage_id, job.work_identifier);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_number, 0);
    }

    #[tokio::test]
    async fn test_enqueue_keeps_supplied_identifier() {
        let queue = manager();
        let job_id = queue
            .enqueue(NewJob::new(Payload::default()).work_identifier("FIXED01"))
            .await
            .unwrap();
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.work_identifier, "FIXED01");
        assert_eq!(job.lineage_id, "FIXED01");
    }

    #[tokio::test]
    async fn test_new_identifier_gives_up_when_space_is_exhausted() {
        // Length 1 leaves 36 candidates; occupy all of them.
        let queue = QueueManager::with_backend(
            MemoryBackend::new(),
            QueueConfig::builder()
                .identifier_length(1)
                .identifier_attempts(4)
                .build(),
        );
        for c in IDENTIFIER_ALPHABET {
            queue
                .enqueue(NewJob::new(Payload::default()).work_identifier((*c as char).to_string()))
                .await
                .unwrap();
        }
        let err = queue.new_identifier().await.unwrap_err();
        assert!(matches!(err, PlanqError::Config(_)));
    }

    #[tokio::test]
    async fn test_successor_propagates_lineage() {
        let queue = manager();
        let job_id = queue
            .enqueue(NewJob::new(Payload::new("Jane Doe")).work_identifier("A1"))
            .await
            .unwrap();
        queue.claim_next("worker-01").await.unwrap();
        queue.fail(&job_id, ExceptionKind::Conflict).await.unwrap();
        let failed = queue.get(&job_id).await.unwrap().unwrap();

        let successor = successor_of(&failed);
        assert_eq!(successor.lineage_id.as_deref(), Some("A1"));
        assert_eq!(successor.attempt_number, 1);
        assert_eq!(successor.payload, failed.payload);
        assert_eq!(successor.attempt_history.len(), 1);
        assert_eq!(successor.attempt_history[0].work_identifier, "A1");
        assert_eq!(
            successor.attempt_history[0].exception_kind,
            ExceptionKind::Conflict
        );
        assert_eq!(successor.attempt_history[0].worker, "worker-01");
        assert!(successor.work_identifier.is_none());
    }

    #[tokio::test]
    async fn test_complete_unknown_job_is_reported() {
        let queue = manager();
        assert!(!queue.complete(&JobId::new()).await.unwrap());

        let job_id = queue.add_item(Payload::default()).await.unwrap();
        // Still pending, not claimed.
        assert!(!queue.complete(&job_id).await.unwrap());
        assert!(!queue.fail(&job_id, ExceptionKind::Conflict).await.unwrap());
    }

    #[tokio::test]
    async fn test_worker_round_trip_and_stats() {
        let queue = manager();
        let ok = queue.add_item(Payload::new("A")).await.unwrap();
        let bad = queue.add_item(Payload::new("B")).await.unwrap();
        queue.add_item(Payload::new("C")).await.unwrap();

        queue.claim_next("w").await.unwrap();
        queue.claim_next("w").await.unwrap();
        assert!(queue.complete(&ok).await.unwrap());
        assert!(queue
            .fail(&bad, ExceptionKind::DataValidation)
            .await
            .unwrap());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);

        queue.clear().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().total, 0);
    }
}
