//! One distribution through both metrics

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerting::{format_count, AlertContext, AlertGate};
use crate::config::TrafficFloor;
use crate::detection::{AbuseDetector, Severity};
use crate::models::{Account, DistributionMetrics, EntityId, MetricKind};
use crate::observability::{DetectorMetrics, StructuredLogger};
use crate::source::MetricsSource;

/// Result of one metric of one distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricOutcome {
    Evaluated {
        metric: MetricKind,
        is_abuse: bool,
        severity: Severity,
        consecutive_count: u64,
        alert_queued: bool,
    },
    Rejected {
        metric: MetricKind,
        error: String,
    },
}

/// Result of processing one distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionReport {
    pub entity: EntityId,
    /// The metrics source failed and zero metrics were used
    pub source_fallback: bool,
    /// Both current values were below the traffic floor
    pub skipped: bool,
    pub metrics: Vec<MetricOutcome>,
}

impl DistributionReport {
    pub fn alerts_queued(&self) -> usize {
        self.metrics
            .iter()
            .filter(|m| {
                matches!(
                    m,
                    MetricOutcome::Evaluated {
                        alert_queued: true,
                        ..
                    }
                )
            })
            .count()
    }
}

pub struct DistributionProcessor {
    source: Arc<dyn MetricsSource>,
    detector: AbuseDetector,
    gate: Arc<AlertGate>,
    floor: TrafficFloor,
    logger: StructuredLogger,
    metrics: DetectorMetrics,
}

impl DistributionProcessor {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        detector: AbuseDetector,
        gate: Arc<AlertGate>,
        floor: TrafficFloor,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            source,
            detector,
            gate,
            floor,
            logger,
            metrics: DetectorMetrics::new(),
        }
    }

    /// Fetch, evaluate and gate both metrics of one distribution
    ///
    /// Never fails: a source error falls back to zero metrics, and a rejected
    /// sample is reported without affecting the other metric.
    pub async fn process(&self, account: &Account, distribution_id: &str) -> DistributionReport {
        let entity = EntityId::new(account.id.clone(), distribution_id);

        let (metrics, source_fallback) = match self.source.fetch(&entity).await {
            Ok(metrics) => (metrics, false),
            Err(e) => {
                warn!(
                    account_id = %entity.account_id,
                    distribution_id = %entity.distribution_id,
                    error = %e,
                    "Metrics fetch failed, using zero metrics"
                );
                self.metrics.inc_distributions("source_fallback");
                (DistributionMetrics::zero(), true)
            }
        };

        self.logger
            .log_distribution_metrics(&entity, &metrics, &metrics_summary(&entity, &metrics));

        if self
            .floor
            .is_below(metrics.current_requests, metrics.current_bytes)
        {
            self.logger.log_low_traffic_skip(&entity, &metrics);
            self.metrics.inc_distributions("skipped_low_traffic");
            return DistributionReport {
                entity,
                source_fallback,
                skipped: true,
                metrics: Vec::new(),
            };
        }
        self.metrics.inc_distributions("evaluated");

        let mut outcomes = Vec::with_capacity(MetricKind::ALL.len());
        for sample in metrics.samples(&entity) {
            let outcome = match self.detector.process(&sample).await {
                Ok((evaluation, count)) => {
                    self.logger
                        .log_detection(&entity, sample.metric, &evaluation, count);
                    let context = AlertContext {
                        account: account.clone(),
                        distribution_id: entity.distribution_id.clone(),
                        metric: sample.metric,
                        current_value: sample.current_value,
                        baseline_value: sample.baseline_value,
                    };
                    let alert_queued = self.gate.maybe_alert(&evaluation, count, &context).await;
                    MetricOutcome::Evaluated {
                        metric: sample.metric,
                        is_abuse: evaluation.is_abuse,
                        severity: evaluation.severity,
                        consecutive_count: count,
                        alert_queued,
                    }
                }
                Err(e) => MetricOutcome::Rejected {
                    metric: sample.metric,
                    error: e.to_string(),
                },
            };
            outcomes.push(outcome);
        }

        let report = DistributionReport {
            entity,
            source_fallback,
            skipped: false,
            metrics: outcomes,
        };
        let alerts = report.alerts_queued();
        if alerts > 0 {
            warn!(
                account_id = %report.entity.account_id,
                distribution_id = %report.entity.distribution_id,
                alerts_queued = alerts,
                "Distribution triggered alerts"
            );
        } else {
            info!(
                account_id = %report.entity.account_id,
                distribution_id = %report.entity.distribution_id,
                "Distribution processed, no alerts"
            );
        }
        report
    }
}

/// One-line `current (avg, delta)` summary for both metrics
pub fn metrics_summary(entity: &EntityId, metrics: &DistributionMetrics) -> String {
    format!(
        "[METRICS] {} | {} | Requests: {} (avg: {}, {:+.1}%) | Bytes: {} (avg: {}, {:+.1}%)",
        entity.account_id,
        entity.distribution_id,
        format_count(metrics.current_requests),
        format_count(metrics.avg_requests),
        relative_delta(metrics.current_requests, metrics.avg_requests),
        compact_bytes(metrics.current_bytes),
        compact_bytes(metrics.avg_bytes),
        relative_delta(metrics.current_bytes, metrics.avg_bytes),
    )
}

/// Change against the average, with the average floored at 1
fn relative_delta(current: f64, average: f64) -> f64 {
    (current / average.max(1.0) - 1.0) * 100.0
}

fn compact_bytes(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    if bytes >= KIB * KIB * KIB {
        format!("{:.2}GB", bytes / (KIB * KIB * KIB))
    } else if bytes >= KIB * KIB {
        format!("{:.2}MB", bytes / (KIB * KIB))
    } else if bytes >= KIB {
        format!("{:.2}KB", bytes / KIB)
    } else {
        format!("{bytes:.0}B")
    }
}
