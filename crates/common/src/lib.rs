#![deny(missing_docs)]

//! Shared configuration, error types, API value types, and observability
//! primitives for fastforge crates.
//!
//! Architecture role:
//! - defines the backplane/worker configuration passed across layers
//! - provides common [`FfxError`] / [`Result`] contracts
//! - hosts the Remote Execution-compatible value types that travel through
//!   the work queue
//! - hosts the metrics registry
//!
//! Key modules:
//! - [`api`]
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Remote Execution-compatible value types.
pub mod api;
/// Shared backplane/worker configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::BackplaneConfig;
pub use error::{FfxError, Result};
pub use ids::{QueueName, WorkerId};
pub use metrics::MetricsRegistry;
