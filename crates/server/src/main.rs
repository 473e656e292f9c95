//! planq - work queue with automatic retry and escalation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use planq_core::{
    ExceptionHandler, HandlerConfig, Intake, LogSink, Payload, QueueConfig, QueueManager,
    SimulatedExecutor, SimulatedReset, SubmitOutcome, WorkerConfig,
};
use planq_server::{run_demo, DemoCase, DemoRun, Server, ServerConfig};
use planq_sqlite::SqliteBackend;

/// planq - Work queue with a retry registry and escalation
#[derive(Parser)]
#[command(name = "planq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (can also be set via DATABASE_URL environment variable)
    #[arg(long, env = "DATABASE_URL", global = true, default_value = "sqlite:planq.db")]
    database_url: String,

    /// Table prefix inside the database
    #[arg(long, env = "PLANQ_NAMESPACE", global = true, default_value = "planq")]
    namespace: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the admin API and the exception handler
    Serve {
        /// Address for the admin API
        #[arg(long, env = "PLANQ_API_ADDR", default_value = "127.0.0.1:8080")]
        api_addr: String,

        /// Retries per lineage before escalation
        #[arg(long, default_value_t = 2)]
        max_retries: u32,

        /// Seconds between exception handler cycles
        #[arg(long, default_value_t = 10)]
        poll_interval: u64,

        /// Seconds the simulated environment reset takes
        #[arg(long, default_value_t = 3)]
        reset_secs: u64,

        /// Recipient when a submission carries no contact
        #[arg(long, default_value = "support@localhost")]
        fallback_contact: String,

        /// Also run this many simulated workers
        #[arg(long, default_value_t = 0)]
        demo_workers: usize,
    },

    /// Submit one job
    Submit {
        #[arg(long)]
        name: String,

        #[arg(long)]
        address: Option<String>,

        #[arg(long)]
        phone: Option<String>,

        #[arg(long)]
        source_document: Option<String>,

        /// Where notifications about this submission go
        #[arg(long)]
        contact: Option<String>,

        /// Continue an existing lineage
        #[arg(long)]
        lineage: Option<String>,
    },

    /// Print queue statistics
    Stats,

    /// Delete every job and registry entry
    Clear,

    /// Enqueue canned submissions and process them with simulated workers
    Demo {
        #[arg(long, value_enum, default_value = "all")]
        case: DemoCase,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let backend = SqliteBackend::new(&cli.database_url, &cli.namespace)
        .await
        .with_context(|| format!("Failed to open {}", cli.database_url))?;

    match cli.command {
        Commands::Serve {
            api_addr,
            max_retries,
            poll_interval,
            reset_secs,
            fallback_contact,
            demo_workers,
        } => {
            let config = ServerConfig::builder()
                .api_addr_str(&api_addr)
                .with_context(|| format!("Invalid API address: {}", api_addr))?
                .namespace(&cli.namespace)
                .database_url(&cli.database_url)
                .handler(
                    HandlerConfig::builder()
                        .max_retries(max_retries)
                        .poll_interval(Duration::from_secs(poll_interval))
                        .fallback_contact(fallback_contact)
                        .build(),
                )
                .worker(
                    WorkerConfig::builder()
                        .num_workers(demo_workers.max(1))
                        .build(),
                )
                .reset_duration(Duration::from_secs(reset_secs))
                .run_demo_worker(demo_workers > 0)
                .build();

            Server::new(config, backend)
                .run()
                .await
                .context("Server failed")?;
        }

        Commands::Submit {
            name,
            address,
            phone,
            source_document,
            contact,
            lineage,
        } => {
            let mut payload = Payload::new(name);
            payload.address = address;
            payload.phone_number = phone;
            payload.source_document = source_document;
            payload.requester_contact = contact;

            let queue = QueueManager::new(backend, QueueConfig::default());
            let handler = ExceptionHandler::new(
                queue.clone(),
                Arc::new(LogSink),
                Arc::new(SimulatedReset::default()),
                HandlerConfig::default(),
            );
            let intake = Intake::new(queue, Arc::new(handler));

            match intake.submit(payload, lineage.as_deref()).await? {
                SubmitOutcome::Enqueued(job_id) => println!("Enqueued {}", job_id),
                SubmitOutcome::DuplicateEscalated => {
                    println!("Lineage already escalated; submission not queued")
                }
            }
        }

        Commands::Stats => {
            let queue = QueueManager::new(backend, QueueConfig::default());
            let stats = queue.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);

            for entry in queue.registry_entries().await? {
                println!(
                    "{}  {}  retries={}",
                    entry.lineage_id, entry.status, entry.retry_count
                );
            }
        }

        Commands::Clear => {
            let queue = QueueManager::new(backend, QueueConfig::default());
            queue.clear().await?;
            println!("Queue cleared");
        }

        Commands::Demo { case } => {
            let queue = QueueManager::new(backend, QueueConfig::default());
            let run = DemoRun {
                handler: HandlerConfig::builder()
                    .poll_interval(Duration::from_secs(2))
                    .build(),
                worker: WorkerConfig::builder()
                    .label("vdi")
                    .poll_interval(Duration::from_secs(1))
                    .idle_delay(Duration::from_millis(200))
                    .build(),
                sink: Arc::new(LogSink),
                environment: Arc::new(SimulatedReset::new(
                    "vdi-server-01",
                    Duration::from_secs(1),
                )),
                executor: Arc::new(SimulatedExecutor::new(Duration::from_millis(200))),
            };

            let stats = run_demo(queue, case, run).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
