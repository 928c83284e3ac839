//! Read-only views over a worker's store snapshot

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use detector_lib::alerting::{format_bytes, format_count, AlertDeduplicator};
use detector_lib::config::TableConfig;
use detector_lib::processor::FailedAccountRegistry;
use detector_lib::store::{CounterStore, InMemoryStore, RetryPolicy, StoreClient};
use detector_lib::{Clock, MetricKind, SystemClock};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tabled::Tabled;

use crate::output::{color_severity, print_rows, print_warning, OutputFormat};

/// Items are read through the store API, so expired entries are already hidden
struct Snapshot {
    client: StoreClient,
    clock: Arc<dyn Clock>,
}

impl Snapshot {
    fn load(path: &Path) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = InMemoryStore::load(path, clock.clone())
            .with_context(|| format!("Failed to load store {}", path.display()))?;
        Ok(Self {
            client: StoreClient::new(Arc::new(store), RetryPolicy::immediate()),
            clock,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "Counter")]
    key: String,
    #[tabled(rename = "Count")]
    count: u64,
    #[tabled(rename = "Last Update")]
    last_update: String,
}

#[derive(Serialize)]
struct CounterJson {
    key: String,
    count: u64,
    last_update: DateTime<Utc>,
}

pub async fn counters(
    store: &Path,
    tables: &TableConfig,
    account: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let snapshot = Snapshot::load(store)?;
    let counters = CounterStore::new(
        snapshot.client,
        tables.abuse_counters.clone(),
        0,
        snapshot.clock,
    );

    let mut records = counters.list(account).await;
    records.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(&b.0)));

    let rows: Vec<CounterRow> = records
        .iter()
        .map(|(key, record)| CounterRow {
            key: key.clone(),
            count: record.count,
            last_update: timestamp(record.last_update),
        })
        .collect();
    let json: Vec<CounterJson> = records
        .into_iter()
        .map(|(key, record)| CounterJson {
            key,
            count: record.count,
            last_update: record.last_update,
        })
        .collect();
    print_rows(&rows, &json, format)
}

#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "Alert")]
    key: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Current")]
    current: String,
    #[tabled(rename = "Baseline")]
    baseline: String,
    #[tabled(rename = "Sent At")]
    sent_at: String,
}

fn metric_value(metric: MetricKind, value: f64) -> String {
    match metric {
        MetricKind::Requests => format_count(value),
        MetricKind::BytesDownloaded => format_bytes(value),
    }
}

pub async fn alerts(store: &Path, tables: &TableConfig, format: OutputFormat) -> Result<()> {
    let snapshot = Snapshot::load(store)?;
    let dedup = AlertDeduplicator::new(snapshot.client, tables.sent_alerts.clone(), 0);

    let mut sent = dedup.list_sent().await;
    sent.sort_by(|a, b| b.1.sent_at.cmp(&a.1.sent_at));

    let rows: Vec<AlertRow> = sent
        .iter()
        .map(|(key, record)| AlertRow {
            key: key.clone(),
            severity: color_severity(record.severity),
            current: metric_value(record.metric, record.current_value),
            baseline: metric_value(record.metric, record.baseline_value),
            sent_at: timestamp(record.sent_at),
        })
        .collect();
    let json: Vec<_> = sent.into_iter().map(|(_, record)| record).collect();
    print_rows(&rows, &json, format)
}

#[derive(Tabled)]
struct FailedRow {
    #[tabled(rename = "Account")]
    account_id: String,
    #[tabled(rename = "Failed At")]
    failed_at: String,
    #[tabled(rename = "Error")]
    error: String,
}

pub async fn failed_accounts(
    store: &Path,
    tables: &TableConfig,
    format: OutputFormat,
) -> Result<()> {
    let snapshot = Snapshot::load(store)?;
    let registry = FailedAccountRegistry::new(
        snapshot.client,
        tables.failed_accounts.clone(),
        0,
        snapshot.clock,
    );

    let mut failed = registry.list().await;
    failed.sort_by(|a, b| a.account_id.cmp(&b.account_id));
    if format == OutputFormat::Table && !failed.is_empty() {
        print_warning(&format!(
            "{} accounts are skipped until their markers expire",
            failed.len()
        ));
    }

    let rows: Vec<FailedRow> = failed
        .iter()
        .map(|r| FailedRow {
            account_id: r.account_id.clone(),
            failed_at: timestamp(r.failed_at),
            error: r.error.clone(),
        })
        .collect();
    print_rows(&rows, &failed, format)
}
