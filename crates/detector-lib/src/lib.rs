//! CDN abuse detection library
//!
//! This crate provides the core functionality for:
//! - Threshold evaluation of per-distribution traffic samples
//! - Idempotent consecutive-violation counters over a key-value store
//! - Tiered alert gating, hourly deduplication and bounded dispatch
//! - Detection cycles over accounts and their distributions
//! - Health checks and observability

pub mod alerting;
pub mod clock;
pub mod config;
pub mod detection;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod processor;
pub mod source;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DetectorConfig;
pub use error::{
    ConfigError, DetectionError, EventValidationError, NotifyError, SourceError, StoreError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{DetectorMetrics, StructuredLogger};
