//! # planq-core - Work queue with retry registry and escalation
//!
//! This crate provides the core of the planq work queue:
//! - `JobStore`, `RetryRegistry` and `Backend` traits for storage implementations
//! - `MemoryBackend` for tests and single-process use
//! - `QueueManager` for identifier generation and lineage propagation
//! - `ExceptionHandler`, the retry / escalation state machine
//! - `Intake`, `Worker` and `WorkerPool` collaborators
//! - Error types

mod backend;
mod config;
mod environment;
mod error;
mod handler;
mod intake;
mod job;
mod memory;
pub mod notify;
mod queue;
mod registry;
mod worker;

// Re-export main types
pub use backend::{
    Backend, DynBackend, JobStore, QueueStats, Resolution, ResolveOutcome, RetryRegistry,
    SharedBackend,
};
pub use config::{
    HandlerConfig, HandlerConfigBuilder, QueueConfig, QueueConfigBuilder, WorkerConfig,
    WorkerConfigBuilder,
};
pub use environment::{ExecutionEnvironment, SimulatedReset};
pub use error::{PlanqError, Result};
pub use handler::{ExceptionHandler, HandleOutcome, TickSummary};
pub use intake::{Intake, SubmitOutcome};
pub use job::{
    AttemptRecord, ExceptionKind, Job, JobId, JobStatus, JobUpdate, NewJob, Payload,
    CONFLICT_REASON, DATA_ERROR_REASON,
};
pub use memory::MemoryBackend;
pub use notify::{LogSink, Notification, NotificationSink, RecordingSink};
pub use queue::{generate_work_identifier, successor_of, QueueManager, IDENTIFIER_ALPHABET};
pub use registry::{RegistryStatus, RetryAttempt, RetryEntry};
pub use worker::{Executor, SimulatedExecutor, Worker, WorkerPool};
