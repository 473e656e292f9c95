//! # planq-server - Admin API and exception handler runner
//!
//! This crate runs the exception handler loop next to an HTTP API for
//! monitoring and managing the queue. Simulated workers can run in the same
//! process for demos.
//!
//! ## Endpoints
//!
//! - Health check (`GET /health`)
//! - Queue statistics (`GET /api/stats`)
//! - List jobs, optionally by status (`GET /api/jobs?status=failed`)
//! - Fetch one job (`GET /api/jobs/{id}`)
//! - Submit a job (`POST /api/jobs`)
//! - Clear the queue and registry (`DELETE /api/jobs`)
//! - Retry registry (`GET /api/registry`, `GET /api/registry/{lineage_id}`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use planq_server::{Server, ServerConfig};
//! use planq_sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> planq_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:planq.db", "planq").await?;
//!
//!     let config = ServerConfig::builder()
//!         .api_addr_str("0.0.0.0:8080")
//!         .expect("valid address")
//!         .namespace("planq")
//!         .build();
//!
//!     Server::new(config, backend).run().await
//! }
//! ```

pub mod api;
mod config;
pub mod demo;
mod server;

pub use config::{ServerConfig, ServerConfigBuilder};
pub use demo::{demo_payloads, run_demo, DemoCase, DemoRun};
pub use server::Server;
