//! Error types for the planq work queue.

use thiserror::Error;

/// The main error type for the planq crates.
#[derive(Error, Debug)]
pub enum PlanqError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable store could not be read or written.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Another writer holds the store lock. Retried on the next cycle.
    #[error("Store busy: {0}")]
    Busy(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A status change that would move a job backwards or sideways.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The notification sink rejected a message.
    #[error("Notification error: {0}")]
    Notification(String),

    /// The execution environment reset failed.
    #[error("Environment error: {0}")]
    Environment(String),
}

impl PlanqError {
    /// Whether the error means the store itself is unusable.
    ///
    /// Poll loops stop on fatal errors instead of retrying on the next tick.
    /// Lock contention (`Busy`) is never fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlanqError::Storage(_) | PlanqError::Serialization(_))
    }
}

/// Result type alias using PlanqError.
pub type Result<T> = std::result::Result<T, PlanqError>;
