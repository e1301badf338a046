//! Common utilities and types shared across ringproxy

pub mod config;
pub mod error;
pub mod metrics;
pub mod tracing_middleware;

pub use config::{Config, ShardBackend, ShardConfig, TopologyConfig, TopologyKind, TransformRule};
pub use error::{Error, Result, ShardFailure, WireError};
pub use metrics::{MetricsRegistry, METRICS};
