//! Intake: the entry point for new submissions.

use std::sync::Arc;

use crate::backend::{Backend, SharedBackend};
use crate::error::Result;
use crate::handler::ExceptionHandler;
use crate::job::{JobId, NewJob, Payload};
use crate::queue::QueueManager;

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Enqueued(JobId),
    /// The lineage is escalated; nothing was enqueued.
    DuplicateEscalated,
}

/// Enqueues validated submissions after the escalated-lineage check.
#[derive(Clone)]
pub struct Intake<B: Backend + Clone = SharedBackend> {
    queue: QueueManager<B>,
    handler: Arc<ExceptionHandler<B>>,
}

impl<B: Backend + Clone> Intake<B> {
    pub fn new(queue: QueueManager<B>, handler: Arc<ExceptionHandler<B>>) -> Self {
        Self { queue, handler }
    }

    /// Submit a payload. With `lineage_id` the submission continues an
    /// existing lineage and is refused when that lineage is escalated.
    pub async fn submit(&self, payload: Payload, lineage_id: Option<&str>) -> Result<SubmitOutcome> {
        let mut new = NewJob::new(payload);
        if let Some(lineage_id) = lineage_id {
            if self
                .handler
                .check_duplicate_submission(lineage_id, &new.payload)
                .await?
            {
                return Ok(SubmitOutcome::DuplicateEscalated);
            }
            new = new.lineage_id(lineage_id);
        }

        let job_id = self.queue.enqueue(new).await?;
        Ok(SubmitOutcome::Enqueued(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RetryRegistry;
    use crate::config::{HandlerConfig, QueueConfig};
    use crate::environment::SimulatedReset;
    use crate::job::ExceptionKind;
    use crate::memory::MemoryBackend;
    use crate::notify::RecordingSink;
    use std::time::Duration;

    fn setup() -> (QueueManager<MemoryBackend>, Intake<MemoryBackend>, RecordingSink) {
        let queue = QueueManager::with_backend(MemoryBackend::new(), QueueConfig::default());
        let sink = RecordingSink::new();
        let handler = ExceptionHandler::new(
            queue.clone(),
            Arc::new(sink.clone()),
            Arc::new(SimulatedReset::new("vdi-test", Duration::ZERO)),
            HandlerConfig::builder().max_retries(2).build(),
        );
        let intake = Intake::new(queue.clone(), Arc::new(handler));
        (queue, intake, sink)
    }

    #[tokio::test]
    async fn test_fresh_submission_is_enqueued() {
        let (queue, intake, sink) = setup();
        let outcome = intake.submit(Payload::new("John Smith"), None).await.unwrap();
        let SubmitOutcome::Enqueued(job_id) = outcome else {
            panic!("expected enqueue");
        };
        let job = queue.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.lineage_id, job.work_identifier);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_submission_after_escalation_is_short_circuited() {
        let (queue, intake, sink) = setup();
        let handler = intake.handler.clone();

        let SubmitOutcome::Enqueued(_) = intake
            .submit(Payload::new("Jane Doe").requester_contact("jane@example.com"), None)
            .await
            .unwrap()
        else {
            panic!("expected enqueue");
        };

        // Three conflicts exhaust the lineage.
        for _ in 0..3 {
            let job = queue.claim_next("worker-01").await.unwrap().unwrap();
            queue.fail(&job.job_id, ExceptionKind::Conflict).await.unwrap();
            handler.tick().await.unwrap();
        }
        let lineage = queue.all_jobs().await.unwrap()[0].lineage_id.clone();
        assert!(queue.backend().is_escalated(&lineage).await.unwrap());
        let jobs_before = queue.all_jobs().await.unwrap().len();

        let outcome = intake
            .submit(Payload::new("Jane Doe"), Some(&lineage))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::DuplicateEscalated);
        assert_eq!(queue.all_jobs().await.unwrap().len(), jobs_before);

        let last = sink.sent().pop().unwrap();
        assert_eq!(
            last.subject,
            "Plan Setup - Duplicate Submission, Already Escalated"
        );
        assert_eq!(last.recipient, "jane@example.com");
    }

    #[tokio::test]
    async fn test_submission_continuing_open_lineage() {
        let (queue, intake, _sink) = setup();
        let outcome = intake
            .submit(Payload::new("Alice"), Some("OPEN001"))
            .await
            .unwrap();
        let SubmitOutcome::Enqueued(job_id) = outcome else {
            panic!("expected enqueue");
        };
        assert_eq!(
            queue.get(&job_id).await.unwrap().unwrap().lineage_id,
            "OPEN001"
        );
    }
}
