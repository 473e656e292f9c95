//! Configuration types passed to each component at construction.

use std::time::Duration;

/// Configuration for the queue manager.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Length of generated work identifiers.
    pub identifier_length: usize,
    /// Candidates drawn before giving up on finding an unused identifier.
    pub identifier_attempts: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            identifier_length: 7,
            identifier_attempts: 16,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }
}

/// Builder for QueueConfig.
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    pub fn identifier_length(mut self, length: usize) -> Self {
        self.config.identifier_length = length;
        self
    }

    pub fn identifier_attempts(mut self, attempts: usize) -> Self {
        self.config.identifier_attempts = attempts;
        self
    }

    pub fn build(self) -> QueueConfig {
        self.config
    }
}

/// Configuration for the exception handler.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Retries granted to a lineage before escalation.
    pub max_retries: u32,
    /// Sleep between poll cycles.
    pub poll_interval: Duration,
    /// Maximum failed jobs handled per cycle.
    pub batch_size: usize,
    /// Recipient used when a payload carries no requester contact.
    pub fallback_contact: String,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            poll_interval: Duration::from_secs(10),
            batch_size: 100,
            fallback_contact: "support@localhost".to_string(),
        }
    }
}

impl HandlerConfig {
    pub fn builder() -> HandlerConfigBuilder {
        HandlerConfigBuilder::default()
    }
}

/// Builder for HandlerConfig.
#[derive(Debug, Default)]
pub struct HandlerConfigBuilder {
    config: HandlerConfig,
}

impl HandlerConfigBuilder {
    /// Set the retry budget per lineage.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.config.max_retries = max;
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the per-cycle batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the fallback notification recipient.
    pub fn fallback_contact(mut self, contact: impl Into<String>) -> Self {
        self.config.fallback_contact = contact.into();
        self
    }

    pub fn build(self) -> HandlerConfig {
        self.config
    }
}

/// Configuration for a pool of workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Label prefix; worker `n` is labelled `{label}-{n:02}`.
    pub label: String,
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Sleep when the queue is empty.
    pub poll_interval: Duration,
    /// Pause between two processed items.
    pub idle_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            label: "worker".to_string(),
            num_workers: 1,
            poll_interval: Duration::from_secs(5),
            idle_delay: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = label.into();
        self
    }

    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn idle_delay(mut self, delay: Duration) -> Self {
        self.config.idle_delay = delay;
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let queue = QueueConfig::default();
        assert_eq!(queue.identifier_length, 7);

        let handler = HandlerConfig::default();
        assert_eq!(handler.max_retries, 2);
        assert_eq!(handler.poll_interval, Duration::from_secs(10));
        assert_eq!(handler.batch_size, 100);

        let worker = WorkerConfig::default();
        assert_eq!(worker.num_workers, 1);
        assert_eq!(worker.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_handler_builder_fluent_chain() {
        let config = HandlerConfig::builder()
            .max_retries(5)
            .poll_interval(Duration::from_millis(50))
            .batch_size(10)
            .fallback_contact("ops@example.com")
            .build();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.fallback_contact, "ops@example.com");
    }

    #[test]
    fn test_queue_and_worker_builders() {
        let queue = QueueConfig::builder()
            .identifier_length(10)
            .identifier_attempts(3)
            .build();
        assert_eq!(queue.identifier_length, 10);
        assert_eq!(queue.identifier_attempts, 3);

        let worker = WorkerConfig::builder()
            .label("vdi")
            .num_workers(3)
            .idle_delay(Duration::ZERO)
            .build();
        assert_eq!(worker.label, "vdi");
        assert_eq!(worker.num_workers, 3);
        assert_eq!(worker.idle_delay, Duration::ZERO);
    }
}
