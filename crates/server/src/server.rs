//! Server implementation that runs the API, the exception handler and
//! optional workers concurrently.

use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use tokio::sync::watch;

use planq_core::{
    Backend, ExceptionHandler, ExecutionEnvironment, Executor, Intake, LogSink, NotificationSink,
    PlanqError, QueueManager, Result, SharedBackend, SimulatedExecutor, SimulatedReset, WorkerPool,
};

use crate::api::{self, AppState};
use crate::config::ServerConfig;

const DEMO_STEP_DELAY: Duration = Duration::from_millis(500);

/// The planq server: admin API plus the exception handler loop.
pub struct Server {
    config: ServerConfig,
    backend: SharedBackend,
    sink: Arc<dyn NotificationSink>,
    environment: Arc<dyn ExecutionEnvironment>,
    executor: Option<Arc<dyn Executor>>,
}

impl Server {
    /// Create a server over `backend`.
    ///
    /// Notifications go to the log and environment resets are simulated
    /// until replaced with [`with_sink`](Self::with_sink) and
    /// [`with_environment`](Self::with_environment).
    pub fn new(config: ServerConfig, backend: impl Backend + 'static) -> Self {
        let environment = Arc::new(SimulatedReset::new(
            "vdi-server-01",
            config.reset_duration,
        ));
        let executor: Option<Arc<dyn Executor>> = if config.run_demo_worker {
            Some(Arc::new(SimulatedExecutor::new(DEMO_STEP_DELAY)))
        } else {
            None
        };

        Self {
            config,
            backend: SharedBackend::new(backend),
            sink: Arc::new(LogSink),
            environment,
            executor,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_environment(mut self, environment: Arc<dyn ExecutionEnvironment>) -> Self {
        self.environment = environment;
        self
    }

    /// Run workers with `executor` alongside the handler.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the server until `shutdown` resolves or the exception handler
    /// stops on a store failure.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let queue = QueueManager::with_backend(self.backend.clone(), self.config.queue.clone());
        let handler = Arc::new(ExceptionHandler::new(
            queue.clone(),
            self.sink.clone(),
            self.environment.clone(),
            self.config.handler.clone(),
        ));

        let listener = TcpListener::bind(self.config.api_addr).map_err(|e| {
            PlanqError::Config(format!("failed to bind {}: {}", self.config.api_addr, e))
        })?;
        let api_addr = listener
            .local_addr()
            .map_err(|e| PlanqError::Config(e.to_string()))?;

        let app_state = web::Data::new(AppState {
            queue: queue.clone(),
            intake: Intake::new(queue.clone(), handler.clone()),
        });

        let server = HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .configure(api::configure)
        })
        .listen(listener)
        .map_err(|e| PlanqError::Config(format!("failed to listen on {}: {}", api_addr, e)))?
        .disable_signals()
        .run();
        let server_handle = server.handle();

        // Flipped once to tell every task to wind down.
        let (stop_tx, stop_rx) = watch::channel(false);

        let api_task = {
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = server => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "API server error");
                        }
                    }
                    _ = stopped(stop_rx) => {
                        tracing::info!("Shutting down API server...");
                        server_handle.stop(true).await;
                    }
                }
            })
        };
        tracing::info!(addr = %api_addr, "API server started");

        let mut handler_task = {
            let handler = handler.clone();
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move { handler.run_until(stopped(stop_rx)).await })
        };

        let pool_task = self.executor.clone().map(|executor| {
            let pool = WorkerPool::new(self.config.worker.clone(), queue.clone(), executor);
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move { pool.run_until(stopped(stop_rx)).await })
        });

        let finished = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown requested");
                None
            }
            result = &mut handler_task => Some(result),
        };
        let _ = stop_tx.send(true);

        let handler_result = match finished {
            Some(result) => result,
            None => handler_task.await,
        };

        if let Some(pool_task) = pool_task {
            match pool_task.await {
                Ok(Err(e)) => tracing::error!(error = %e, "Worker pool exited with error"),
                Err(e) => tracing::error!(error = %e, "Worker pool task panicked"),
                Ok(Ok(())) => {}
            }
        }
        let _ = api_task.await;

        tracing::info!("Server stopped");

        handler_result
            .map_err(|e| PlanqError::Config(format!("exception handler task failed: {}", e)))?
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use planq_core::{
        HandlerConfig, MemoryBackend, Payload, RecordingSink, RegistryStatus, WorkerConfig,
    };

    fn config() -> ServerConfig {
        ServerConfig::builder()
            .api_addr_str("127.0.0.1:0")
            .unwrap()
            .handler(
                HandlerConfig::builder()
                    .max_retries(2)
                    .poll_interval(Duration::from_millis(10))
                    .build(),
            )
            .reset_duration(Duration::ZERO)
            .worker(
                WorkerConfig::builder()
                    .poll_interval(Duration::from_millis(10))
                    .idle_delay(Duration::ZERO)
                    .build(),
            )
            .build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_conflict_runs_to_escalation() {
        let backend = MemoryBackend::new();
        let queue = QueueManager::new(backend.clone(), config().queue);
        let jane = Payload::new("Jane Doe").requester_contact("jane@example.com");
        queue.add_item(jane.clone()).await.unwrap();
        queue.add_item(jane).await.unwrap();

        let sink = RecordingSink::new();
        let server = Server::new(config(), backend)
            .with_sink(Arc::new(sink.clone()))
            .with_executor(Arc::new(SimulatedExecutor::new(Duration::ZERO)));

        let watched = queue.clone();
        let shutdown = async move {
            while watched.stats().await.map(|s| s.escalated).unwrap_or(0) < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), server.run_until(shutdown))
            .await
            .expect("server did not reach escalation")
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.retry_enqueued, 2);
        assert_eq!(stats.escalated, 1);

        let entries = queue.registry_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, RegistryStatus::Escalated);
        assert!(sink
            .sent()
            .iter()
            .any(|n| n.subject == "URGENT: Plan Setup Failed After 2 Attempts"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig::builder()
            .api_addr(taken.local_addr().unwrap())
            .build();

        let result = Server::new(config, MemoryBackend::new())
            .run_until(async {})
            .await;
        assert!(matches!(result, Err(PlanqError::Config(_))));
    }
}
