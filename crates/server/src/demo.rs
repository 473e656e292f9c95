//! Canned submissions that exercise each path through the queue.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use planq_core::{
    Backend, ExceptionHandler, ExecutionEnvironment, Executor, HandlerConfig, Intake,
    NotificationSink, Payload, QueueManager, QueueStats, Result, WorkerConfig, WorkerPool,
};

const DEMO_CONTACT: &str = "requester@example.com";

/// Which demo scenario to enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DemoCase {
    /// Completes on the first attempt.
    Success,
    /// Same customer twice; the second submission conflicts until escalated.
    Conflict,
    /// Rejected as invalid data.
    DataError,
    /// Five distinct customers that all complete.
    Batch,
    /// Every case above.
    All,
}

fn customer(name: &str, address: &str, phone: &str, document: &str) -> Payload {
    Payload::new(name)
        .address(address)
        .phone_number(phone)
        .source_document(document)
        .requester_contact(DEMO_CONTACT)
}

/// Payloads for `case`, in submission order.
pub fn demo_payloads(case: DemoCase) -> Vec<Payload> {
    match case {
        DemoCase::Success => vec![customer(
            "John Smith",
            "123 Main Street, New York, NY 10001",
            "+1-555-0100",
            "demo_success_case.pdf",
        )],
        DemoCase::Conflict => {
            let jane = customer(
                "Jane Doe",
                "456 Oak Avenue, Los Angeles, CA 90001",
                "+1-555-0200",
                "demo_exception_plan_exists.pdf",
            );
            vec![jane.clone(), jane]
        }
        DemoCase::DataError => vec![customer(
            "Bob Johnson",
            "789 Pine Road, Chicago, IL 60601",
            "INVALID_PHONE",
            "demo_exception_data_error.pdf",
        )],
        DemoCase::Batch => [
            "Alice Brown",
            "Charlie Davis",
            "Diana Wilson",
            "Ethan Moore",
            "Fiona Taylor",
        ]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            customer(
                name,
                &format!("{} Test Street, Boston, MA 02101", 100 + i * 10),
                &format!("+1-555-0{}", 300 + i),
                &format!("demo_batch_{}.pdf", i + 1),
            )
        })
        .collect(),
        DemoCase::All => [
            DemoCase::Success,
            DemoCase::Conflict,
            DemoCase::DataError,
            DemoCase::Batch,
        ]
        .into_iter()
        .flat_map(demo_payloads)
        .collect(),
    }
}

/// Collaborators for one demo run.
pub struct DemoRun {
    pub handler: HandlerConfig,
    pub worker: WorkerConfig,
    pub sink: Arc<dyn NotificationSink>,
    pub environment: Arc<dyn ExecutionEnvironment>,
    pub executor: Arc<dyn Executor>,
}

/// Whether every job has reached a state the handler will not act on again.
fn settled(stats: &QueueStats) -> bool {
    stats.pending == 0 && stats.claimed == 0 && stats.failed == 0
}

/// Enqueue the payloads for `case`, then run workers and the exception
/// handler until the queue settles. Returns the final stats.
pub async fn run_demo<B>(queue: QueueManager<B>, case: DemoCase, run: DemoRun) -> Result<QueueStats>
where
    B: Backend + Clone + 'static,
{
    let handler = Arc::new(ExceptionHandler::new(
        queue.clone(),
        run.sink,
        run.environment,
        run.handler,
    ));
    let intake = Intake::new(queue.clone(), handler.clone());

    for payload in demo_payloads(case) {
        let name = payload.display_name().to_string();
        let outcome = intake.submit(payload, None).await?;
        tracing::info!(name = %name, outcome = ?outcome, "Demo submission");
    }

    let pool = WorkerPool::new(run.worker, queue.clone(), run.executor);
    let watched = queue.clone();
    let wait = async move {
        loop {
            match watched.stats().await {
                Ok(stats) if settled(&stats) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Demo stopped on store failure");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };

    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    let handler_loop = handler.run_until(async {
        done_rx.await.ok();
    });
    let workers = pool.run_until(async move {
        wait.await;
        let _ = done_tx.send(());
    });
    let (handler_result, pool_result) = tokio::join!(handler_loop, workers);
    handler_result?;
    pool_result?;

    queue.stats().await
}
