//! Abuse detection
//!
//! This module provides:
//! - Dual-threshold evaluation (relative spike AND absolute volume)
//! - The detection engine that folds each evaluation into a durable counter

mod engine;
mod evaluator;

pub use engine::AbuseDetector;
pub use evaluator::{percentage_change, AbuseEvaluation, Severity, ThresholdEvaluator};
