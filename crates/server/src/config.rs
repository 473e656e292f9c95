//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use planq_core::{HandlerConfig, QueueConfig, WorkerConfig};

/// Configuration for the planq server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the API server to.
    pub api_addr: SocketAddr,
    /// Table prefix in the database.
    pub namespace: String,
    /// SQLite URL, e.g. `sqlite:planq.db`.
    pub database_url: String,
    pub queue: QueueConfig,
    pub handler: HandlerConfig,
    pub worker: WorkerConfig,
    /// How long the simulated environment reset before each retry takes.
    pub reset_duration: Duration,
    /// Also run simulated workers against the queue.
    pub run_demo_worker: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            namespace: "planq".to_string(),
            database_url: "sqlite:planq.db".to_string(),
            queue: QueueConfig::default(),
            handler: HandlerConfig::default(),
            worker: WorkerConfig::default(),
            reset_duration: Duration::from_secs(3),
            run_demo_worker: false,
        }
    }
}

impl ServerConfig {
    /// Create a new builder.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for ServerConfig.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API bind address.
    pub fn api_addr(mut self, addr: SocketAddr) -> Self {
        self.config.api_addr = addr;
        self
    }

    /// Set the API bind address from a string.
    pub fn api_addr_str(mut self, addr: &str) -> Result<Self, std::net::AddrParseError> {
        self.config.api_addr = addr.parse()?;
        Ok(self)
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    pub fn handler(mut self, handler: HandlerConfig) -> Self {
        self.config.handler = handler;
        self
    }

    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.config.worker = worker;
        self
    }

    /// Set the simulated environment reset duration.
    pub fn reset_duration(mut self, duration: Duration) -> Self {
        self.config.reset_duration = duration;
        self
    }

    pub fn run_demo_worker(mut self, enabled: bool) -> Self {
        self.config.run_demo_worker = enabled;
        self
    }

    /// Build the ServerConfig.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.api_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.namespace, "planq");
        assert_eq!(config.database_url, "sqlite:planq.db");
        assert_eq!(config.handler.max_retries, 2);
        assert_eq!(config.reset_duration, Duration::from_secs(3));
        assert!(!config.run_demo_worker);
    }

    #[test]
    fn test_server_config_builder_api_addr_str_invalid() {
        assert!(ServerConfig::builder().api_addr_str("not-an-address").is_err());
    }

    #[test]
    fn test_server_config_builder_fluent_chain() {
        let config = ServerConfig::builder()
            .api_addr_str("0.0.0.0:9000")
            .unwrap()
            .namespace("staging")
            .database_url("sqlite::memory:")
            .handler(
                HandlerConfig::builder()
                    .max_retries(3)
                    .poll_interval(Duration::from_secs(1))
                    .build(),
            )
            .worker(WorkerConfig::builder().num_workers(2).build())
            .reset_duration(Duration::ZERO)
            .run_demo_worker(true)
            .build();

        assert_eq!(config.api_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.namespace, "staging");
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.handler.max_retries, 3);
        assert_eq!(config.worker.num_workers, 2);
        assert_eq!(config.reset_duration, Duration::ZERO);
        assert!(config.run_demo_worker);
    }
}
