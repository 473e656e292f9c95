//! Workers that claim jobs and push them through the external system.

use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use crate::backend::{Backend, SharedBackend};
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::job::{ExceptionKind, Job};
use crate::queue::QueueManager;

/// Performs the work a job describes.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one job. An `Err` carries the exception the external system raised.
    async fn execute(&self, job: &Job) -> std::result::Result<(), ExceptionKind>;
}

/// Executor standing in for the external system.
///
/// A customer name it has already seen is rejected as a conflict, and a
/// source document whose name contains `exception_data_error` is rejected
/// as invalid data.
#[derive(Debug, Default)]
pub struct SimulatedExecutor {
    seen: Mutex<HashSet<String>>,
    step_delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            step_delay,
        }
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, job: &Job) -> std::result::Result<(), ExceptionKind> {
        let name = job.payload.name.as_deref().unwrap_or("Unknown");
        tracing::debug!(work_identifier = %job.work_identifier, name = %name, "Entering plan");
        tokio::time::sleep(self.step_delay).await;

        {
            let mut seen = self
                .seen
                .lock()
                .map_err(|_| ExceptionKind::Other("executor state poisoned".to_string()))?;
            if !seen.insert(name.to_string()) {
                return Err(ExceptionKind::Conflict);
            }
        }

        tokio::time::sleep(self.step_delay).await;

        let invalid = job
            .payload
            .source_document
            .as_deref()
            .is_some_and(|doc| doc.to_lowercase().contains("exception_data_error"));
        if invalid {
            return Err(ExceptionKind::DataValidation);
        }
        Ok(())
    }
}

/// A single worker loop.
pub struct Worker<B: Backend + Clone = SharedBackend> {
    label: String,
    queue: QueueManager<B>,
    executor: Arc<dyn Executor>,
    poll_interval: Duration,
    idle_delay: Duration,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl<B: Backend + Clone> Worker<B> {
    pub fn new(
        label: impl Into<String>,
        queue: QueueManager<B>,
        executor: Arc<dyn Executor>,
        config: &WorkerConfig,
        running: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            label: label.into(),
            queue,
            executor,
            poll_interval: config.poll_interval,
            idle_delay: config.idle_delay,
            running,
            wake,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn run(&self) -> Result<()> {
        tracing::debug!(worker = %self.label, "Worker started");

        while self.running.load(Ordering::SeqCst) {
            let delay = match self.run_once().await {
                Ok(true) => self.idle_delay,
                Ok(false) => self.poll_interval,
                Err(e) if e.is_fatal() => {
                    tracing::error!(worker = %self.label, error = %e, "Worker stopping on store failure");
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(worker = %self.label, error = %e, "Worker error");
                    Duration::from_secs(1)
                }
            };

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }

        tracing::debug!(worker = %self.label, "Worker stopped");
        Ok(())
    }

    /// Claim and process one job. Returns false when the queue is empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.claim_next(&self.label).await? else {
            return Ok(false);
        };

        match self.executor.execute(&job).await {
            Ok(()) => {
                self.queue.complete(&job.job_id).await?;
            }
            Err(kind) => {
                tracing::warn!(
                    worker = %self.label,
                    job_id = %job.job_id,
                    work_identifier = %job.work_identifier,
                    exception = %kind,
                    "Job raised exception"
                );
                self.queue.fail(&job.job_id, kind).await?;
            }
        }
        Ok(true)
    }
}

/// A set of workers sharing one queue and executor.
pub struct WorkerPool<B: Backend + Clone = SharedBackend> {
    config: WorkerConfig,
    queue: QueueManager<B>,
    executor: Arc<dyn Executor>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl<B: Backend + Clone + 'static> WorkerPool<B> {
    pub fn new(config: WorkerConfig, queue: QueueManager<B>, executor: Arc<dyn Executor>) -> Self {
        Self {
            config,
            queue,
            executor,
            running: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Run until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run every worker until `shutdown` resolves, then wait for them to stop.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        self.running.store(true, Ordering::SeqCst);

        let mut tasks = JoinSet::new();
        for n in 1..=self.config.num_workers {
            let worker = Worker::new(
                format!("{}-{:02}", self.config.label, n),
                self.queue.clone(),
                self.executor.clone(),
                &self.config,
                self.running.clone(),
                self.wake.clone(),
            );
            tasks.spawn(async move { worker.run().await });
        }

        tracing::info!(
            workers = self.config.num_workers,
            label = %self.config.label,
            "Worker pool started"
        );

        shutdown.await;
        tracing::info!("Shutdown requested, stopping workers");
        self.stop();

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Err(e)) => tracing::error!(error = %e, "Worker exited with error"),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
                Ok(Ok(())) => {}
            }
        }

        tracing::info!("Worker pool stopped");
        Ok(())
    }

    /// Stop fetching; in-flight jobs finish first.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }
}
