//! Execution environment reset performed before a retry is enqueued.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// The machine or session a worker drives the external system from.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Restart the environment. Runs for a bounded time and is not retried.
    async fn reset(&self) -> Result<()>;
}

/// Reset that only sleeps through its steps and logs them.
#[derive(Debug, Clone)]
pub struct SimulatedReset {
    name: String,
    duration: Duration,
}

impl SimulatedReset {
    const STEPS: [&'static str; 3] = [
        "Sending shutdown signal",
        "Waiting for clean shutdown",
        "Starting environment",
    ];

    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }
}

impl Default for SimulatedReset {
    fn default() -> Self {
        Self::new("vdi-server-01", Duration::from_secs(3))
    }
}

#[async_trait]
impl ExecutionEnvironment for SimulatedReset {
    fn name(&self) -> &str {
        &self.name
    }

    async fn reset(&self) -> Result<()> {
        tracing::info!(environment = %self.name, "Restarting execution environment");
        let step = self.duration / Self::STEPS.len() as u32;
        for description in Self::STEPS {
            tracing::debug!(environment = %self.name, step = description, "Reset step");
            tokio::time::sleep(step).await;
        }
        tracing::info!(environment = %self.name, "Execution environment restarted");
        Ok(())
    }
}
