//! Account and distribution processing
//!
//! Validates inbound account events, runs each distribution through the
//! detector and alert gate, and drives whole detection cycles.

mod accounts;
mod cycle;
mod distribution;


pub use accounts::{parse_event, validate_event, FailedAccountRecord, FailedAccountRegistry};
pub use cycle::{AccountOutcome, CycleSummary, DetectionCycle};
pub use distribution::{metrics_summary, DistributionProcessor, DistributionReport, MetricOutcome};
