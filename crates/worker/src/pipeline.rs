//! Wiring of the detection components for one worker process

use anyhow::{Context, Result};
use detector_lib::alerting::{
    AlertDeduplicator, AlertDispatcher, AlertGate, DeliveryPolicy, DrainReport, NotificationSink,
    Notifier,
};
use detector_lib::detection::{AbuseDetector, ThresholdEvaluator};
use detector_lib::processor::{
    parse_event, CycleSummary, DetectionCycle, DistributionProcessor, FailedAccountRegistry,
};
use detector_lib::source::{DistributionDirectory, MetricsSource};
use detector_lib::store::{CounterStore, InMemoryStore, RetryPolicy, StoreClient};
use detector_lib::{Clock, DetectorConfig, StructuredLogger};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Long-lived components shared by every cycle
pub struct Pipeline {
    store: Arc<InMemoryStore>,
    dispatcher: Arc<AlertDispatcher>,
    cycle: DetectionCycle,
    drain_timeout: Duration,
}

/// External collaborators of a pipeline
pub struct Collaborators {
    pub store: Arc<InMemoryStore>,
    pub source: Arc<dyn MetricsSource>,
    pub directory: Arc<dyn DistributionDirectory>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

impl Pipeline {
    /// Build every component; spawns the alert workers, so call inside a runtime
    pub fn build(
        config: &DetectorConfig,
        collaborators: Collaborators,
        logger: StructuredLogger,
    ) -> Self {
        let Collaborators {
            store,
            source,
            directory,
            sink,
            clock,
        } = collaborators;

        let client = StoreClient::new(store.clone(), RetryPolicy::default());
        let counters = CounterStore::new(
            client.clone(),
            config.tables.abuse_counters.clone(),
            config.retention.abuse_counter_secs,
            clock.clone(),
        );
        let dedup = Arc::new(AlertDeduplicator::new(
            client.clone(),
            config.tables.sent_alerts.clone(),
            config.retention.sent_alerts_secs,
        ));
        let registry = Arc::new(FailedAccountRegistry::new(
            client,
            config.tables.failed_accounts.clone(),
            config.retention.failed_accounts_secs,
            clock.clone(),
        ));

        let dispatcher = Arc::new(AlertDispatcher::start(
            Notifier::new(sink, DeliveryPolicy::default()),
            dedup.clone(),
            clock.clone(),
            config.display_timezone_offset,
            logger.clone(),
            config.concurrency.alert_workers,
            config.concurrency.alert_queue_capacity,
        ));

        let thresholds = Arc::new(config.thresholds.clone());
        let gate = Arc::new(AlertGate::new(
            thresholds.clone(),
            dedup,
            dispatcher.clone(),
            clock,
            logger.clone(),
        ));
        let detector = AbuseDetector::new(ThresholdEvaluator::new(thresholds), counters);
        let processor = Arc::new(DistributionProcessor::new(
            source,
            detector,
            gate,
            config.traffic_floor,
            logger.clone(),
        ));
        let cycle = DetectionCycle::new(
            directory,
            processor,
            registry,
            dispatcher.clone(),
            config.concurrency,
            config.drain_timeout(),
            logger,
        );

        Self {
            store,
            dispatcher,
            cycle,
            drain_timeout: config.drain_timeout(),
        }
    }

    /// Read and validate the accounts event, then run one cycle over it
    pub async fn run_tick(&self, accounts_file: &Path) -> Result<CycleSummary> {
        let raw = tokio::fs::read_to_string(accounts_file)
            .await
            .with_context(|| format!("failed to read accounts file {}", accounts_file.display()))?;
        let accounts = parse_event(&raw)
            .with_context(|| format!("invalid accounts event in {}", accounts_file.display()))?;
        info!(accounts = accounts.len(), "Loaded accounts event");
        Ok(self.cycle.run(accounts).await)
    }

    /// Write the store snapshot, if the store is file-backed
    pub async fn flush_store(&self) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .context("store flush task failed")?
    }

    /// Drain queued alerts, stop the workers and flush the store
    pub async fn shutdown(&self) -> Result<DrainReport> {
        let report = self.dispatcher.shutdown(self.drain_timeout).await;
        self.flush_store().await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use detector_lib::{
        Account, DistributionMetrics, EntityId, ManualClock, NotifyError, SourceError,
    };
    use std::io::Write;
    use std::sync::Mutex;

    struct StaticGateway;

    #[async_trait]
    impl MetricsSource for StaticGateway {
        async fn fetch(&self, _entity: &EntityId) -> Result<DistributionMetrics, SourceError> {
            Ok(DistributionMetrics {
                current_requests: 3000.0,
                current_bytes: 0.0,
                avg_requests: 500.0,
                avg_bytes: 0.0,
            })
        }
    }

    #[async_trait]
    impl DistributionDirectory for StaticGateway {
        async fn list_distributions(&self, _account: &Account) -> Result<Vec<String>, SourceError> {
            Ok(vec!["E2ABC".to_string()])
        }
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<String>>);

    #[async_trait]
    impl NotificationSink for Outbox {
        async fn send(&self, text: &str) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn accounts_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    fn pipeline(store: Arc<InMemoryStore>, clock: Arc<ManualClock>, outbox: Arc<Outbox>) -> Pipeline {
        let gateway = Arc::new(StaticGateway);
        Pipeline::build(
            &DetectorConfig::default(),
            Collaborators {
                store,
                source: gateway.clone(),
                directory: gateway,
                sink: outbox,
                clock,
            },
            StructuredLogger::new("test"),
        )
    }

    #[tokio::test]
    async fn test_tick_persists_counters_and_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let store = Arc::new(InMemoryStore::open(&path, clock.clone()).unwrap());
        let outbox = Arc::new(Outbox::default());
        let pipeline = pipeline(store.clone(), clock.clone(), outbox.clone());

        let file = accounts_file(
            r#"{"accounts": [{"Id": "111122223333", "Name": "media", "Email": "ops@example.com"}]}"#,
        );
        let summary = tokio_test::assert_ok!(pipeline.run_tick(file.path()).await);
        assert_eq!(summary.alerts_sent, 1);
        assert_eq!(outbox.0.lock().unwrap().len(), 1);

        let report = pipeline.shutdown().await.unwrap();
        assert_eq!(report.pending, 0);

        // two counters, two window markers and the sent-alert marker survive a reopen
        let reopened = InMemoryStore::open(&path, clock).unwrap();
        assert_eq!(reopened.len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_event_is_reported() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        let pipeline = pipeline(store, clock, Arc::new(Outbox::default()));

        let file = accounts_file(r#"{"accounts": [{"Id": ""}]}"#);
        let err = pipeline.run_tick(file.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("missing required fields"));

        let missing = pipeline
            .run_tick(Path::new("/nonexistent/accounts.json"))
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("failed to read accounts file"));
    }
}
