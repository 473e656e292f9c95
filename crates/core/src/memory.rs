//! In-memory backend.
//!
//! Both tables sit behind one mutex, so every operation, including
//! [`Backend::resolve`], is a single critical section. Useful for tests and
//! single-process demos; nothing survives a restart.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backend::{Backend, JobStore, QueueStats, Resolution, ResolveOutcome, RetryRegistry};
use crate::error::{PlanqError, Result};
use crate::job::{ExceptionKind, Job, JobId, JobStatus, JobUpdate};
use crate::registry::RetryEntry;

#[derive(Default)]
struct MemoryState {
    /// Insertion order is enqueue order.
    jobs: Vec<Job>,
    registry: HashMap<String, RetryEntry>,
}

impl MemoryState {
    fn position(&self, job_id: &JobId) -> Result<usize> {
        self.jobs
            .iter()
            .position(|job| &job.job_id == job_id)
            .ok_or_else(|| PlanqError::JobNotFound(job_id.to_string()))
    }
}

/// Backend keeping everything in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut state = self.state.lock().await;
        let job_id = job.job_id.clone();
        state.jobs.push(job);
        Ok(job_id)
    }

    async fn claim_next(&self, worker: &str) -> Result<Option<Job>> {
        let mut state = self.state.lock().await;
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|job| job.status == JobStatus::Pending)
        else {
            return Ok(None);
        };

        job.transition(JobStatus::Claimed, Utc::now())?;
        job.assigned_worker = worker.to_string();
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: &JobId) -> Result<()> {
        self.update(job_id, JobUpdate::status(JobStatus::Completed))
            .await
            .map(|_| ())
    }

    async fn fail(&self, job_id: &JobId, kind: ExceptionKind) -> Result<()> {
        self.update(
            job_id,
            JobUpdate::status(JobStatus::Failed).exception_kind(kind),
        )
        .await
        .map(|_| ())
    }

    async fn update(&self, job_id: &JobId, update: JobUpdate) -> Result<Job> {
        let mut state = self.state.lock().await;
        let idx = state.position(job_id)?;
        let job = &mut state.jobs[idx];
        job.apply(&update, Utc::now())?;
        Ok(job.clone())
    }

    async fn query_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|job| job.status == status)
            .cloned()
            .collect())
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|job| &job.job_id == job_id).cloned())
    }

    async fn all_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.state.lock().await.jobs.clone())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        Ok(QueueStats::from_jobs(&state.jobs))
    }

    async fn identifier_in_use(&self, identifier: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .any(|job| job.work_identifier == identifier || job.lineage_id == identifier))
    }
}

#[async_trait]
impl RetryRegistry for MemoryBackend {
    async fn lookup(&self, lineage_id: &str) -> Result<Option<RetryEntry>> {
        Ok(self.state.lock().await.registry.get(lineage_id).cloned())
    }

    async fn record_attempt(
        &self,
        lineage_id: &str,
        new_identifier: &str,
        requester_contact: Option<&str>,
    ) -> Result<RetryEntry> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let entry = state
            .registry
            .entry(lineage_id.to_string())
            .or_insert_with(|| RetryEntry::new(lineage_id, now));
        entry.record_attempt(new_identifier, requester_contact.map(str::to_string), now)?;
        Ok(entry.clone())
    }

    async fn escalate(&self, lineage_id: &str) -> Result<RetryEntry> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let entry = state
            .registry
            .entry(lineage_id.to_string())
            .or_insert_with(|| RetryEntry::new(lineage_id, now));
        entry.escalate(now);
        Ok(entry.clone())
    }

    async fn entries(&self) -> Result<Vec<RetryEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<RetryEntry> = state.registry.values().cloned().collect();
        entries.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        Ok(entries)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let idx = state.position(resolution.job_id())?;
        if state.jobs[idx].status != JobStatus::Failed {
            return Ok(ResolveOutcome::Stale);
        }

        // Everything fallible runs on copies first; the writes below cannot fail.
        let mut failed = state.jobs[idx].clone();
        failed.transition(resolution.target_status(), now)?;

        let (entry, successor) = match resolution {
            Resolution::Retry {
                lineage_id,
                new_identifier,
                requester_contact,
                successor,
                ..
            } => {
                let mut entry = state
                    .registry
                    .get(&lineage_id)
                    .cloned()
                    .unwrap_or_else(|| RetryEntry::new(lineage_id.clone(), now));
                entry.record_attempt(new_identifier.clone(), requester_contact, now)?;
                let successor = Job::from_new(successor, new_identifier, now);
                (Some(entry), Some(successor))
            }
            Resolution::Escalate { lineage_id, .. } => {
                let mut entry = state
                    .registry
                    .get(&lineage_id)
                    .cloned()
                    .unwrap_or_else(|| RetryEntry::new(lineage_id.clone(), now));
                entry.escalate(now);
                (Some(entry), None)
            }
            Resolution::CloseDuplicate { .. } | Resolution::Notify { .. } => (None, None),
        };

        state.jobs[idx] = failed;
        if let Some(entry) = entry {
            state.registry.insert(entry.lineage_id.clone(), entry);
        }
        if let Some(successor) = &successor {
            state.jobs.push(successor.clone());
        }

        Ok(ResolveOutcome::Applied { successor })
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.clear();
        state.registry.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{NewJob, Payload};

    fn job(identifier: &str) -> Job {
        Job::from_new(
            NewJob::new(Payload::new("Jane Doe")),
            identifier.to_string(),
            Utc::now(),
        )
    }

    async fn failed_job(backend: &MemoryBackend, identifier: &str) -> JobId {
        let job_id = backend.enqueue(job(identifier)).await.unwrap();
        backend.claim_next("worker-01").await.unwrap().unwrap();
        backend
            .fail(&job_id, ExceptionKind::Conflict)
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_pending() {
        let backend = MemoryBackend::new();
        let first = backend.enqueue(job("A1")).await.unwrap();
        backend.enqueue(job("B1")).await.unwrap();

        let claimed = backend.claim_next("worker-01").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, first);
        assert_eq!(claimed.status, JobStatus::Claimed);
        assert_eq!(claimed.assigned_worker, "worker-01");
    }

    #[tokio::test]
    async fn test_claim_empty_queue() {
        let backend = MemoryBackend::new();
        assert!(backend.claim_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let backend = MemoryBackend::new();
        for i in 0..20 {
            backend.enqueue(job(&format!("ID{:05}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = backend.claim_next(&format!("w{}", w)).await.unwrap() {
                    mine.push(job.job_id);
                }
                mine
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_complete_requires_claimed() {
        let backend = MemoryBackend::new();
        let job_id = backend.enqueue(job("A1")).await.unwrap();
        let err = backend.complete(&job_id).await.unwrap_err();
        assert!(matches!(err, PlanqError::InvalidTransition { .. }));

        let missing = backend.complete(&JobId::new()).await.unwrap_err();
        assert!(matches!(missing, PlanqError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_retry_is_atomic_and_replay_safe() {
        let backend = MemoryBackend::new();
        let job_id = failed_job(&backend, "A1").await;

        let resolution = Resolution::Retry {
            job_id: job_id.clone(),
            lineage_id: "A1".into(),
            new_identifier: "A2".into(),
            requester_contact: Some("jane@example.com".into()),
            successor: NewJob::new(Payload::new("Jane Doe"))
                .lineage_id("A1")
                .attempt_number(1),
        };

        let outcome = backend.resolve(resolution.clone()).await.unwrap();
        let ResolveOutcome::Applied {
            successor: Some(successor),
        } = outcome
        else {
            panic!("expected a successor");
        };
        assert_eq!(successor.work_identifier, "A2");
        assert_eq!(successor.lineage_id, "A1");

        // Replaying the same decision writes nothing.
        assert_eq!(
            backend.resolve(resolution).await.unwrap(),
            ResolveOutcome::Stale
        );
        let entry = backend.lookup("A1").await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(backend.all_jobs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_retry_on_escalated_lineage_writes_nothing() {
        let backend = MemoryBackend::new();
        let job_id = failed_job(&backend, "A1").await;
        backend.escalate("A1").await.unwrap();

        let result = backend
            .resolve(Resolution::Retry {
                job_id: job_id.clone(),
                lineage_id: "A1".into(),
                new_identifier: "A2".into(),
                requester_contact: None,
                successor: NewJob::new(Payload::default()).lineage_id("A1"),
            })
            .await;

        assert!(result.is_err());
        let job = backend.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(backend.all_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_identifier_in_use() {
        let backend = MemoryBackend::new();
        backend.enqueue(job("A1")).await.unwrap();
        assert!(backend.identifier_in_use("A1").await.unwrap());
        assert!(!backend.identifier_in_use("Z9").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_empties_both_tables() {
        let backend = MemoryBackend::new();
        failed_job(&backend, "A1").await;
        backend.record_attempt("A1", "A2", None).await.unwrap();
        backend.clear().await.unwrap();
        assert!(backend.all_jobs().await.unwrap().is_empty());
        assert!(backend.entries().await.unwrap().is_empty());
    }
}
