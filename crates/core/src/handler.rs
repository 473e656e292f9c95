//! Exception handler: the retry / escalation state machine.
//!
//! Each cycle picks up `Failed` jobs and resolves them by exception kind:
//!
//! - conflict: retry under a fresh identifier until the lineage has used up
//!   `max_retries`, then escalate. Failures on an escalated lineage are
//!   closed as duplicates.
//! - data validation: tell the submitter, never retry.
//! - anything else: leave the job in `Failed` and warn once per job.
//!
//! Every decision is committed through [`Backend::resolve`], so a job that
//! was already handled (for example after a crash between commit and the
//! next poll) comes back as `Stale` and is skipped.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::backend::{Backend, Resolution, ResolveOutcome, SharedBackend};
use crate::config::HandlerConfig;
use crate::environment::ExecutionEnvironment;
use crate::error::Result;
use crate::job::{ExceptionKind, Job, JobId, JobStatus, Payload};
use crate::notify::{self, Notification, NotificationSink};
use crate::queue::{successor_of, QueueManager};
use crate::registry::RetryEntry;

/// What happened to one failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A successor was enqueued under `new_identifier`.
    Retried {
        successor: JobId,
        new_identifier: String,
    },
    /// The lineage hit its retry budget.
    Escalated,
    /// The lineage was already escalated; the job was closed.
    ClosedDuplicate,
    /// The submitter was told the data is invalid.
    Notified,
    /// Unrecognized exception kind, left in `Failed`.
    Unrecognized,
    /// Someone else resolved the job first.
    Stale,
}

/// Per-cycle counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub retried: usize,
    pub escalated: usize,
    pub duplicates: usize,
    pub notified: usize,
    pub unrecognized: usize,
    pub stale: usize,
    pub errors: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: &HandleOutcome) {
        match outcome {
            HandleOutcome::Retried { .. } => self.retried += 1,
            HandleOutcome::Escalated => self.escalated += 1,
            HandleOutcome::ClosedDuplicate => self.duplicates += 1,
            HandleOutcome::Notified => self.notified += 1,
            HandleOutcome::Unrecognized => self.unrecognized += 1,
            HandleOutcome::Stale => self.stale += 1,
        }
    }

    /// Jobs that changed state this cycle.
    pub fn resolved(&self) -> usize {
        self.retried + self.escalated + self.duplicates + self.notified
    }
}

/// Polls for failed jobs and applies the retry policy.
pub struct ExceptionHandler<B: Backend + Clone = SharedBackend> {
    queue: QueueManager<B>,
    sink: Arc<dyn NotificationSink>,
    environment: Arc<dyn ExecutionEnvironment>,
    config: HandlerConfig,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    /// Failed jobs already reported as unrecognized.
    unrecognized: Mutex<HashSet<JobId>>,
}

impl<B: Backend + Clone> ExceptionHandler<B> {
    pub fn new(
        queue: QueueManager<B>,
        sink: Arc<dyn NotificationSink>,
        environment: Arc<dyn ExecutionEnvironment>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            queue,
            sink,
            environment,
            config,
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            unrecognized: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub fn queue(&self) -> &QueueManager<B> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask a running loop to stop after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Run the poll loop until [`stop`](Self::stop) is called.
    ///
    /// Returns an error only when the store itself fails; every job-level
    /// problem is logged and the loop carries on.
    pub async fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.poll_loop().await
    }

    /// Run the poll loop until `shutdown` resolves.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.running.store(true, Ordering::SeqCst);
        let run = self.poll_loop();
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => return result,
            _ = shutdown => {
                tracing::info!("Shutdown requested");
                self.stop();
            }
        }
        run.await
    }

    async fn poll_loop(&self) -> Result<()> {
        tracing::info!(
            max_retries = self.config.max_retries,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Exception handler started"
        );

        while self.running.load(Ordering::SeqCst) {
            match self.tick().await {
                Ok(summary) if summary.resolved() > 0 || summary.errors > 0 => {
                    tracing::info!(
                        retried = summary.retried,
                        escalated = summary.escalated,
                        duplicates = summary.duplicates,
                        notified = summary.notified,
                        errors = summary.errors,
                        "Exception handler cycle"
                    );
                }
                Ok(_) => {}
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(error = %e, "Exception handler cycle failed, retrying next cycle");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Exception handler stopping on store failure");
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        tracing::info!("Exception handler stopped");
        Ok(())
    }

    /// Handle one batch of failed jobs.
    pub async fn tick(&self) -> Result<TickSummary> {
        let failed = self.queue.query_by_status(JobStatus::Failed).await?;
        self.forget_unrecognized(&failed);

        // Unrecognized jobs stay Failed and do not count against the batch.
        let mut summary = TickSummary::default();
        for job in &failed {
            if summary.resolved() + summary.errors >= self.config.batch_size {
                break;
            }
            match self.process(job).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        job_id = %job.job_id,
                        lineage_id = %job.lineage_id,
                        error = %e,
                        "Failed to handle job"
                    );
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Apply the policy to one failed job.
    pub async fn process(&self, job: &Job) -> Result<HandleOutcome> {
        match &job.exception_kind {
            Some(ExceptionKind::Conflict) => self.handle_conflict(job).await,
            Some(ExceptionKind::DataValidation) => self.handle_data_error(job).await,
            other => {
                if self.first_unrecognized(&job.job_id) {
                    tracing::warn!(
                        job_id = %job.job_id,
                        work_identifier = %job.work_identifier,
                        exception = ?other,
                        "Unrecognized exception, leaving job failed"
                    );
                } else {
                    tracing::debug!(
                        job_id = %job.job_id,
                        exception = ?other,
                        "Unrecognized exception still unresolved"
                    );
                }
                Ok(HandleOutcome::Unrecognized)
            }
        }
    }

    /// True the first time `job_id` turns up with an unrecognized exception.
    fn first_unrecognized(&self, job_id: &JobId) -> bool {
        match self.unrecognized.lock() {
            Ok(mut seen) => seen.insert(job_id.clone()),
            Err(_) => true,
        }
    }

    /// Drop jobs that have left `Failed` since they were reported.
    fn forget_unrecognized(&self, failed: &[Job]) {
        if let Ok(mut seen) = self.unrecognized.lock() {
            if seen.is_empty() {
                return;
            }
            let still_failed: HashSet<&JobId> = failed.iter().map(|job| &job.job_id).collect();
            seen.retain(|job_id| still_failed.contains(job_id));
        }
    }

    /// Intake-side guard: true when `lineage_id` is already escalated, in
    /// which case the submitter is told and nothing must be enqueued.
    pub async fn check_duplicate_submission(
        &self,
        lineage_id: &str,
        payload: &Payload,
    ) -> Result<bool> {
        let Some(entry) = self.queue.lineage(lineage_id).await? else {
            return Ok(false);
        };
        if !entry.is_escalated() {
            return Ok(false);
        }

        tracing::warn!(lineage_id = %lineage_id, "Submission for escalated lineage rejected");
        let recipient = self.recipient(payload, Some(&entry));
        self.notify(notify::duplicate_submission_notice(
            &recipient, lineage_id, payload, &entry,
        ))
        .await;
        Ok(true)
    }

    async fn handle_conflict(&self, job: &Job) -> Result<HandleOutcome> {
        let entry = self.queue.lineage(&job.lineage_id).await?;
        let recipient = self.recipient(&job.payload, entry.as_ref());

        if entry.as_ref().is_some_and(RetryEntry::is_escalated) {
            let resolution = Resolution::CloseDuplicate {
                job_id: job.job_id.clone(),
            };
            if self.commit(resolution).await? == ResolveOutcome::Stale {
                return Ok(HandleOutcome::Stale);
            }
            tracing::info!(
                job_id = %job.job_id,
                lineage_id = %job.lineage_id,
                "Closed duplicate of escalated lineage"
            );
            self.notify(notify::duplicate_escalated_notice(&recipient, job))
                .await;
            return Ok(HandleOutcome::ClosedDuplicate);
        }

        let retry_count = entry.as_ref().map_or(0, |entry| entry.retry_count);
        if retry_count >= self.config.max_retries {
            let resolution = Resolution::Escalate {
                job_id: job.job_id.clone(),
                lineage_id: job.lineage_id.clone(),
            };
            if self.commit(resolution).await? == ResolveOutcome::Stale {
                return Ok(HandleOutcome::Stale);
            }
            tracing::warn!(
                job_id = %job.job_id,
                lineage_id = %job.lineage_id,
                retry_count = retry_count,
                "Retry budget exhausted, lineage escalated"
            );
            self.notify(notify::escalation_notice(&recipient, job))
                .await;
            return Ok(HandleOutcome::Escalated);
        }

        let new_identifier = self.queue.new_identifier().await?;

        if let Err(e) = self.environment.reset().await {
            tracing::warn!(
                environment = %self.environment.name(),
                error = %e,
                "Environment reset failed, continuing"
            );
        }

        let resolution = Resolution::Retry {
            job_id: job.job_id.clone(),
            lineage_id: job.lineage_id.clone(),
            new_identifier: new_identifier.clone(),
            requester_contact: job.payload.requester_contact.clone(),
            successor: successor_of(job),
        };
        let successor = match self.commit(resolution).await? {
            ResolveOutcome::Applied {
                successor: Some(successor),
            } => successor,
            _ => return Ok(HandleOutcome::Stale),
        };

        let retry_number = retry_count + 1;
        tracing::info!(
            job_id = %job.job_id,
            successor = %successor.job_id,
            lineage_id = %job.lineage_id,
            old_identifier = %job.work_identifier,
            new_identifier = %new_identifier,
            retry = retry_number,
            "Retry enqueued"
        );
        self.notify(notify::retry_notice(
            &recipient,
            job,
            &new_identifier,
            retry_number,
            self.config.max_retries,
        ))
        .await;

        Ok(HandleOutcome::Retried {
            successor: successor.job_id,
            new_identifier,
        })
    }

    async fn handle_data_error(&self, job: &Job) -> Result<HandleOutcome> {
        let resolution = Resolution::Notify {
            job_id: job.job_id.clone(),
        };
        if self.commit(resolution).await? == ResolveOutcome::Stale {
            return Ok(HandleOutcome::Stale);
        }

        tracing::info!(
            job_id = %job.job_id,
            work_identifier = %job.work_identifier,
            "Data error reported to submitter"
        );
        let recipient = self.recipient(&job.payload, None);
        self.notify(notify::data_error_notice(&recipient, job)).await;
        Ok(HandleOutcome::Notified)
    }

    async fn commit(&self, resolution: Resolution) -> Result<ResolveOutcome> {
        let job_id = resolution.job_id().clone();
        let outcome = self.queue.backend().resolve(resolution).await?;
        if outcome == ResolveOutcome::Stale {
            tracing::debug!(job_id = %job_id, "Job already resolved, skipping");
        }
        Ok(outcome)
    }

    fn recipient(&self, payload: &Payload, entry: Option<&RetryEntry>) -> String {
        payload
            .requester_contact
            .clone()
            .or_else(|| entry.and_then(|entry| entry.requester_contact.clone()))
            .unwrap_or_else(|| self.config.fallback_contact.clone())
    }

    async fn notify(&self, notification: Notification) {
        if let Err(e) = self
            .sink
            .send(
                &notification.recipient,
                &notification.subject,
                &notification.body,
            )
            .await
        {
            tracing::warn!(
                recipient = %notification.recipient,
                subject = %notification.subject,
                error = %e,
                "Notification failed"
            );
        }
    }
}
