//! Dual-threshold abuse evaluation
//!
//! A sample is abuse only when it is anomalous relative to its own history
//! AND large in absolute terms. Either signal alone is reported in the
//! diagnostic reason but does not count as abuse.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::config::ThresholdConfig;
use crate::error::DetectionError;
use crate::models::MetricKind;

/// Severity tier of an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    None,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "None",
            Severity::Warning => "Warning",
            Severity::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating one metric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseEvaluation {
    pub is_abuse: bool,
    /// Relative tier: Critical if the critical multiplier was exceeded, else Warning, else None
    pub severity: Severity,
    pub percentage_change: f64,
    pub meets_critical: bool,
    pub meets_warning: bool,
    pub meets_absolute: bool,
    /// Highest absolute floor reached, independent of the relative check
    pub absolute_tier: Severity,
    /// Multiplier responsible for the relative tier (0 when none)
    pub multiplier_level: f64,
    pub reason: String,
}

/// Stateless evaluator over a fixed threshold configuration
#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    thresholds: Arc<ThresholdConfig>,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: Arc<ThresholdConfig>) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    /// Evaluate a sample against relative and absolute thresholds
    ///
    /// # Errors
    /// Returns [`DetectionError::InvalidSample`] when either value is NaN,
    /// infinite or negative. Such samples are never coerced to zero.
    pub fn evaluate(
        &self,
        metric: MetricKind,
        current: f64,
        baseline: f64,
    ) -> Result<AbuseEvaluation, DetectionError> {
        check_value(metric, "current_value", current)?;
        check_value(metric, "baseline_value", baseline)?;

        let t = &*self.thresholds;
        let metric_thresholds = t.for_metric(metric);

        let meets_critical = exceeds_multiple(current, baseline, t.critical_multiplier);
        let meets_warning = exceeds_multiple(current, baseline, t.warning_multiplier);

        let absolute_tier = if current >= metric_thresholds.critical_absolute {
            Severity::Critical
        } else if current >= metric_thresholds.warning_absolute {
            Severity::Warning
        } else {
            Severity::None
        };
        let meets_absolute = absolute_tier != Severity::None;

        let percentage_change =
            percentage_change(current, baseline, metric_thresholds.minimum_baseline);

        let (severity, multiplier_level) = if meets_critical {
            (Severity::Critical, t.critical_multiplier)
        } else if meets_warning {
            (Severity::Warning, t.warning_multiplier)
        } else {
            (Severity::None, 0.0)
        };

        let relative = meets_critical || meets_warning;
        let is_abuse = relative && meets_absolute;

        let reason = match (relative, meets_absolute) {
            (true, true) => format!(
                "{metric} abuse detected: current={current:.2}, avg={baseline:.2}, \
                 threshold={:.2} ({multiplier_level}x), change={percentage_change:.1}%, severity={severity}",
                baseline * multiplier_level
            ),
            (true, false) => format!(
                "{metric} exceeds relative threshold but below absolute significance: \
                 current={current:.2}, avg={baseline:.2}, change={percentage_change:.1}%"
            ),
            (false, true) => format!(
                "{metric} exceeds absolute threshold but not relative: \
                 current={current:.2}, avg={baseline:.2}, change={percentage_change:.1}%"
            ),
            (false, false) => format!(
                "{metric} within normal range: current={current:.2}, avg={baseline:.2}, \
                 change={percentage_change:.1}%"
            ),
        };

        Ok(AbuseEvaluation {
            is_abuse,
            severity,
            percentage_change,
            meets_critical,
            meets_warning,
            meets_absolute,
            absolute_tier,
            multiplier_level,
            reason,
        })
    }
}

fn check_value(metric: MetricKind, field: &'static str, value: f64) -> Result<(), DetectionError> {
    let reason = if value.is_nan() {
        "not a number"
    } else if value.is_infinite() {
        "not finite"
    } else if value < 0.0 {
        "negative"
    } else {
        return Ok(());
    };
    Err(DetectionError::InvalidSample {
        metric,
        field,
        value,
        reason,
    })
}

/// Strictly greater than `baseline * multiplier`; a zero baseline is exceeded by any traffic
fn exceeds_multiple(current: f64, baseline: f64, multiplier: f64) -> bool {
    if baseline == 0.0 {
        return current > 0.0;
    }
    current > baseline * multiplier
}

/// Percentage change against `max(baseline, minimum_baseline)`
pub fn percentage_change(current: f64, baseline: f64, minimum_baseline: f64) -> f64 {
    let denominator = baseline.max(minimum_baseline);
    if denominator == 0.0 {
        return if current == 0.0 { 0.0 } else { f64::INFINITY };
    }
    (current - baseline) / denominator * 100.0
}
