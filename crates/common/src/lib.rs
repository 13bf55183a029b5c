#![deny(missing_docs)]

//! Shared configuration, error types, IDs, metrics, and memory accounting
//! for Rill crates.
//!
//! Architecture role:
//! - defines the error taxonomy every component propagates
//! - provides typed identifiers and the configuration passed across layers
//! - hosts the metrics registry and the memory pool / allocator pair the
//!   query controller threads through the storage read path
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

/// Shared component configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Memory pool and per-query allocator.
pub mod memory;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{ControllerConfig, ExecutorConfig, SchedulerConfig, ServerConfig};
pub use error::{ErrorKind, Result, RillError};
pub use ids::*;
pub use memory::{Allocator, MemoryPool};
pub use metrics::MetricsRegistry;
