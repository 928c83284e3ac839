//! Observability infrastructure for the abuse detector
//!
//! Provides:
//! - Prometheus metrics (detections, alert outcomes, store errors, cycle latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

use crate::detection::{AbuseEvaluation, Severity};
use crate::models::{DistributionMetrics, EntityId, MetricKind};

/// Cycle latency buckets (in seconds); a full cycle fans out over every account
const CYCLE_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Global metrics instance (registered once). `None` when registration failed.
static GLOBAL_METRICS: OnceLock<Option<DetectorMetricsInner>> = OnceLock::new();

struct DetectorMetricsInner {
    samples_evaluated: IntCounterVec,
    invalid_samples: IntCounterVec,
    abuse_detections: IntCounterVec,
    alerts: IntCounterVec,
    notify_attempts: IntCounterVec,
    store_errors: IntCounterVec,
    store_retries: IntCounterVec,
    distributions: IntCounterVec,
    accounts: IntCounterVec,
    failed_accounts: IntCounter,
    alert_queue_depth: IntGauge,
    cycle_duration_seconds: Histogram,
}

impl DetectorMetricsInner {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            samples_evaluated: register_int_counter_vec!(
                "cfad_samples_evaluated_total",
                "Metric samples evaluated against thresholds",
                &["metric"]
            )?,
            invalid_samples: register_int_counter_vec!(
                "cfad_invalid_samples_total",
                "Metric samples rejected as malformed",
                &["metric"]
            )?,
            abuse_detections: register_int_counter_vec!(
                "cfad_abuse_detections_total",
                "Samples classified as abuse",
                &["metric", "severity"]
            )?,
            alerts: register_int_counter_vec!(
                "cfad_alerts_total",
                "Alert gate outcomes",
                &["outcome"]
            )?,
            notify_attempts: register_int_counter_vec!(
                "cfad_notify_attempts_total",
                "Notification sink attempts by result",
                &["result"]
            )?,
            store_errors: register_int_counter_vec!(
                "cfad_store_errors_total",
                "Key-value store failures after retries",
                &["operation", "code"]
            )?,
            store_retries: register_int_counter_vec!(
                "cfad_store_retries_total",
                "Retried key-value store operations",
                &["operation"]
            )?,
            distributions: register_int_counter_vec!(
                "cfad_distributions_total",
                "Distributions visited per cycle by outcome",
                &["outcome"]
            )?,
            accounts: register_int_counter_vec!(
                "cfad_accounts_total",
                "Accounts visited per cycle by outcome",
                &["outcome"]
            )?,
            failed_accounts: register_int_counter!(
                "cfad_failed_accounts_total",
                "Accounts recorded in the failed-account registry"
            )?,
            alert_queue_depth: register_int_gauge!(
                "cfad_alert_queue_depth",
                "Alerts queued or in flight"
            )?,
            cycle_duration_seconds: register_histogram!(
                "cfad_cycle_duration_seconds",
                "Wall time of one detection cycle",
                CYCLE_BUCKETS.to_vec()
            )?,
        })
    }
}

/// Detector metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance. Clones share the same
/// underlying metrics; every method is a no-op if registration failed.
#[derive(Clone)]
pub struct DetectorMetrics {
    _private: (),
}

impl Default for DetectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(|| match DetectorMetricsInner::new() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register detector metrics, metrics disabled");
                None
            }
        });
        Self { _private: () }
    }

    fn inner(&self) -> Option<&DetectorMetricsInner> {
        GLOBAL_METRICS.get().and_then(Option::as_ref)
    }

    pub fn inc_samples_evaluated(&self, metric: MetricKind) {
        if let Some(m) = self.inner() {
            m.samples_evaluated.with_label_values(&[metric.as_str()]).inc();
        }
    }

    pub fn inc_invalid_samples(&self, metric: MetricKind) {
        if let Some(m) = self.inner() {
            m.invalid_samples.with_label_values(&[metric.as_str()]).inc();
        }
    }

    pub fn inc_abuse_detections(&self, metric: MetricKind, severity: Severity) {
        if let Some(m) = self.inner() {
            m.abuse_detections
                .with_label_values(&[metric.as_str(), severity.as_str()])
                .inc();
        }
    }

    /// `outcome` is one of queued, deduplicated, rejected, sent, failed
    pub fn inc_alerts(&self, outcome: &str) {
        if let Some(m) = self.inner() {
            m.alerts.with_label_values(&[outcome]).inc();
        }
    }

    pub fn inc_notify_attempts(&self, result: &str) {
        if let Some(m) = self.inner() {
            m.notify_attempts.with_label_values(&[result]).inc();
        }
    }

    pub fn inc_store_errors(&self, operation: &str, code: &str) {
        if let Some(m) = self.inner() {
            m.store_errors.with_label_values(&[operation, code]).inc();
        }
    }

    pub fn inc_store_retries(&self, operation: &str) {
        if let Some(m) = self.inner() {
            m.store_retries.with_label_values(&[operation]).inc();
        }
    }

    /// `outcome` is one of evaluated, skipped_low_traffic, source_fallback
    pub fn inc_distributions(&self, outcome: &str) {
        if let Some(m) = self.inner() {
            m.distributions.with_label_values(&[outcome]).inc();
        }
    }

    /// `outcome` is one of processed, skipped, failed
    pub fn inc_accounts(&self, outcome: &str) {
        if let Some(m) = self.inner() {
            m.accounts.with_label_values(&[outcome]).inc();
        }
    }

    pub fn inc_failed_accounts(&self) {
        if let Some(m) = self.inner() {
            m.failed_accounts.inc();
        }
    }

    pub fn set_alert_queue_depth(&self, depth: i64) {
        if let Some(m) = self.inner() {
            m.alert_queue_depth.set(depth);
        }
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        if let Some(m) = self.inner() {
            m.cycle_duration_seconds.observe(duration_secs);
        }
    }
}

/// Structured logger for detector events
///
/// Provides consistent JSON-formatted logging for detections, alerts and
/// cycle lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Per-distribution metrics line, emitted before evaluation
    pub fn log_distribution_metrics(
        &self,
        entity: &EntityId,
        metrics: &DistributionMetrics,
        summary: &str,
    ) {
        info!(
            event = "distribution_metrics",
            instance = %self.instance,
            account_id = %entity.account_id,
            distribution_id = %entity.distribution_id,
            current_requests = metrics.current_requests,
            avg_requests = metrics.avg_requests,
            current_bytes = metrics.current_bytes,
            avg_bytes = metrics.avg_bytes,
            "{}",
            summary
        );
    }

    pub fn log_low_traffic_skip(&self, entity: &EntityId, metrics: &DistributionMetrics) {
        info!(
            event = "distribution_skipped",
            instance = %self.instance,
            account_id = %entity.account_id,
            distribution_id = %entity.distribution_id,
            current_requests = metrics.current_requests,
            current_bytes = metrics.current_bytes,
            "Traffic below floor, skipping distribution"
        );
    }

    /// Log one evaluated sample; abuse is logged at warn
    pub fn log_detection(
        &self,
        entity: &EntityId,
        metric: MetricKind,
        evaluation: &AbuseEvaluation,
        consecutive_count: u64,
    ) {
        if evaluation.is_abuse {
            warn!(
                event = "abuse_detected",
                instance = %self.instance,
                account_id = %entity.account_id,
                distribution_id = %entity.distribution_id,
                metric = %metric,
                severity = %evaluation.severity,
                percentage_change = evaluation.percentage_change,
                consecutive_count = consecutive_count,
                reason = %evaluation.reason,
                "Abuse detected"
            );
        } else {
            info!(
                event = "sample_evaluated",
                instance = %self.instance,
                account_id = %entity.account_id,
                distribution_id = %entity.distribution_id,
                metric = %metric,
                consecutive_count = consecutive_count,
                reason = %evaluation.reason,
                "Sample within thresholds"
            );
        }
    }

    pub fn log_alert_queued(&self, alert_key: &str, severity: Severity, consecutive_count: u64) {
        info!(
            event = "alert_queued",
            instance = %self.instance,
            alert_key = %alert_key,
            severity = %severity,
            consecutive_count = consecutive_count,
            "Alert queued for delivery"
        );
    }

    pub fn log_alert_delivery(&self, alert_key: &str, delivered: bool) {
        if delivered {
            info!(
                event = "alert_delivered",
                instance = %self.instance,
                alert_key = %alert_key,
                "Alert delivered"
            );
        } else {
            error!(
                event = "alert_delivery_failed",
                instance = %self.instance,
                alert_key = %alert_key,
                "Alert delivery failed, dedup claim released"
            );
        }
    }

    pub fn log_cycle_started(&self, accounts: usize) {
        info!(
            event = "cycle_started",
            instance = %self.instance,
            accounts = accounts,
            "Detection cycle started"
        );
    }

    pub fn log_account_failed(&self, account_id: &str, error: &str) {
        error!(
            event = "account_failed",
            instance = %self.instance,
            account_id = %account_id,
            error = %error,
            "Account processing failed"
        );
    }

    pub fn log_cycle_completed(
        &self,
        accounts_processed: usize,
        accounts_failed: usize,
        alerts_sent: usize,
        alerts_failed: usize,
        duration_secs: f64,
    ) {
        info!(
            event = "cycle_completed",
            instance = %self.instance,
            accounts_processed = accounts_processed,
            accounts_failed = accounts_failed,
            alerts_sent = alerts_sent,
            alerts_failed = alerts_failed,
            duration_secs = duration_secs,
            "Detection cycle completed"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "worker_started",
            instance = %self.instance,
            worker_version = %version,
            "Abuse detection worker started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "worker_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Abuse detection worker shutting down"
        );
    }
}
