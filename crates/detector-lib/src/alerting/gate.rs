//! Tiered duration gate
//!
//! A critical detection alerts once its counter reaches `critical_duration`;
//! a warning detection needs `warning_duration`. Alerts that pass the gate are
//! deduplicated per hour and handed to the dispatcher.

use std::sync::Arc;
use tracing::{debug, warn};

use super::{Alert, AlertDeduplicator, AlertDispatcher};
use crate::clock::Clock;
use crate::config::ThresholdConfig;
use crate::detection::AbuseEvaluation;
use crate::models::{Account, MetricKind};
use crate::observability::{DetectorMetrics, StructuredLogger};

/// Identity and values of the sample behind an evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct AlertContext {
    pub account: Account,
    pub distribution_id: String,
    pub metric: MetricKind,
    pub current_value: f64,
    pub baseline_value: f64,
}

pub struct AlertGate {
    thresholds: Arc<ThresholdConfig>,
    dedup: Arc<AlertDeduplicator>,
    dispatcher: Arc<AlertDispatcher>,
    clock: Arc<dyn Clock>,
    logger: StructuredLogger,
    metrics: DetectorMetrics,
}

impl AlertGate {
    pub fn new(
        thresholds: Arc<ThresholdConfig>,
        dedup: Arc<AlertDeduplicator>,
        dispatcher: Arc<AlertDispatcher>,
        clock: Arc<dyn Clock>,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            thresholds,
            dedup,
            dispatcher,
            clock,
            logger,
            metrics: DetectorMetrics::new(),
        }
    }

    /// Whether an evaluation with counter value `count` clears its duration tier
    pub fn should_alert(&self, evaluation: &AbuseEvaluation, count: u64) -> bool {
        if !evaluation.is_abuse {
            return false;
        }
        if evaluation.meets_critical {
            count >= self.thresholds.critical_duration
        } else if evaluation.meets_warning {
            count >= self.thresholds.warning_duration
        } else {
            false
        }
    }

    /// Gate, deduplicate and queue an alert
    ///
    /// Returns true iff the alert was handed to the dispatcher.
    pub async fn maybe_alert(
        &self,
        evaluation: &AbuseEvaluation,
        new_count: u64,
        context: &AlertContext,
    ) -> bool {
        if !self.should_alert(evaluation, new_count) {
            return false;
        }

        let alert = Alert {
            account: context.account.clone(),
            distribution_id: context.distribution_id.clone(),
            metric: context.metric,
            severity: evaluation.severity,
            current_value: context.current_value,
            baseline_value: context.baseline_value,
            multiplier: evaluation.multiplier_level,
            consecutive_count: new_count,
            timestamp: self.clock.now(),
            percentage_change: evaluation.percentage_change,
        };
        let alert_key = alert.alert_key();

        if !self.dedup.try_claim(&alert_key).await {
            debug!(alert_key = %alert_key, "Duplicate alert suppressed");
            self.metrics.inc_alerts("deduplicated");
            return false;
        }

        let severity = alert.severity;
        match self.dispatcher.enqueue(alert).await {
            Ok(()) => {
                self.metrics.inc_alerts("queued");
                self.logger
                    .log_alert_queued(&alert_key, severity, new_count);
                true
            }
            Err(e) => {
                self.dedup.release(&alert_key);
                self.metrics.inc_alerts("rejected");
                warn!(alert_key = %alert_key, error = %e, "Alert not queued");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{DeliveryPolicy, NotificationSink, Notifier};
    use crate::clock::ManualClock;
    use crate::detection::ThresholdEvaluator;
    use crate::error::NotifyError;
    use crate::store::testing::FlakyStore;
    use crate::store::{RetryPolicy, StoreClient};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingSink(Mutex<usize>);

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn send(&self, _text: &str) -> Result<(), NotifyError> {
            *self.0.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        sink: Arc<CountingSink>,
        dispatcher: Arc<AlertDispatcher>,
        gate: AlertGate,
        evaluator: ThresholdEvaluator,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 6, 5, 0).unwrap(),
        ));
        let thresholds = Arc::new(ThresholdConfig::default());
        let sink = Arc::new(CountingSink(Mutex::new(0)));
        let dedup = Arc::new(AlertDeduplicator::new(
            StoreClient::new(
                Arc::new(FlakyStore::with_clock(clock.clone())),
                RetryPolicy::immediate(),
            ),
            "CF_Sent_Alerts",
            24 * 3600,
        ));
        let dispatcher = Arc::new(AlertDispatcher::start(
            Notifier::new(sink.clone(), DeliveryPolicy::immediate()),
            dedup.clone(),
            clock.clone(),
            8,
            StructuredLogger::new("test"),
            2,
            8,
        ));
        let gate = AlertGate::new(
            thresholds.clone(),
            dedup,
            dispatcher.clone(),
            clock.clone(),
            StructuredLogger::new("test"),
        );
        Fixture {
            clock,
            sink,
            dispatcher,
            gate,
            evaluator: ThresholdEvaluator::new(thresholds),
        }
    }

    fn context(current: f64, baseline: f64) -> AlertContext {
        AlertContext {
            account: Account {
                id: "111122223333".to_string(),
                name: "media".to_string(),
                email: "ops@example.com".to_string(),
            },
            distribution_id: "E2ABC".to_string(),
            metric: MetricKind::Requests,
            current_value: current,
            baseline_value: baseline,
        }
    }

    #[tokio::test]
    async fn test_duration_tiers() {
        let f = fixture();
        let critical = f.evaluator.evaluate(MetricKind::Requests, 3000.0, 500.0).unwrap();
        let warning = f.evaluator.evaluate(MetricKind::Requests, 1300.0, 500.0).unwrap();
        let relative_only = f.evaluator.evaluate(MetricKind::Requests, 900.0, 400.0).unwrap();

        assert!(f.gate.should_alert(&critical, 1));
        assert!(!f.gate.should_alert(&critical, 0));
        assert!(!f.gate.should_alert(&warning, 1));
        assert!(f.gate.should_alert(&warning, 2));
        assert!(!f.gate.should_alert(&relative_only, 10));
    }

    #[tokio::test]
    async fn test_one_alert_per_hour() {
        let f = fixture();
        let eval = f.evaluator.evaluate(MetricKind::Requests, 3000.0, 500.0).unwrap();
        let ctx = context(3000.0, 500.0);

        assert!(f.gate.maybe_alert(&eval, 1, &ctx).await);
        f.dispatcher.drain(Duration::from_secs(5)).await;

        f.clock.advance(chrono::Duration::minutes(15));
        assert!(!f.gate.maybe_alert(&eval, 2, &ctx).await);

        // next hour fires again
        f.clock.set(Utc.with_ymd_and_hms(2026, 2, 3, 7, 0, 0).unwrap());
        assert!(f.gate.maybe_alert(&eval, 3, &ctx).await);
        let report = f.dispatcher.drain(Duration::from_secs(5)).await;
        assert_eq!(report.sent, 1);
        assert_eq!(*f.sink.0.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_abuse_never_queues() {
        let f = fixture();
        let eval = f.evaluator.evaluate(MetricKind::Requests, 900.0, 400.0).unwrap();
        assert!(!f.gate.maybe_alert(&eval, 5, &context(900.0, 400.0)).await);
        assert_eq!(f.dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_dispatcher_releases_claim() {
        let f = fixture();
        f.dispatcher.shutdown(Duration::from_secs(1)).await;
        let eval = f.evaluator.evaluate(MetricKind::Requests, 3000.0, 500.0).unwrap();
        let ctx = context(3000.0, 500.0);
        assert!(!f.gate.maybe_alert(&eval, 1, &ctx).await);
        assert!(!f.gate.dedup.is_claimed("111122223333#E2ABC#Requests#2026020306"));
    }
}
