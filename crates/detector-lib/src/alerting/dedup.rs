//! Hourly alert deduplication
//!
//! A key is first claimed in the in-process set, so two tasks in one process
//! can never both dispatch it. The durable marker is written only after a
//! successful delivery and is what stops other processes and later cycles.
//! Claims from earlier hours are pruned once a key for a newer hour arrives,
//! so the set only ever holds the current hour.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, error, warn};

use super::Alert;
use crate::detection::Severity;
use crate::models::MetricKind;
use crate::store::{StoreClient, StoreItem};

/// Attributes of a sent-alert marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentAlertRecord {
    pub account_id: String,
    pub distribution_id: String,
    pub metric: MetricKind,
    pub severity: Severity,
    pub current_value: f64,
    pub baseline_value: f64,
    pub sent_at: DateTime<Utc>,
}

pub struct AlertDeduplicator {
    sent: DashSet<String>,
    /// Newest hour bucket seen in a claimed key
    latest_hour: Mutex<String>,
    client: StoreClient,
    table: String,
    ttl_secs: i64,
}

impl AlertDeduplicator {
    pub fn new(client: StoreClient, table: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            sent: DashSet::new(),
            latest_hour: Mutex::new(String::new()),
            client,
            table: table.into(),
            ttl_secs,
        }
    }

    /// Claim `alert_key` for delivery
    ///
    /// Returns false when the key is already claimed in this process or a
    /// durable marker exists. A failed durable lookup fails open.
    pub async fn try_claim(&self, alert_key: &str) -> bool {
        self.prune_on_rollover(alert_key);
        if self.sent.contains(alert_key) {
            debug!(alert_key = %alert_key, "Alert already claimed in this process");
            return false;
        }

        match self.client.get_item(&self.table, alert_key).await {
            Ok(Some(_)) => {
                self.sent.insert(alert_key.to_string());
                debug!(alert_key = %alert_key, "Alert already sent this hour");
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    alert_key = %alert_key,
                    error = %e,
                    "Sent-alert lookup failed, allowing alert"
                );
            }
        }

        // insert is the atomic claim; a concurrent caller that got here first wins
        self.sent.insert(alert_key.to_string())
    }

    /// Drop claims older than the hour of `alert_key` when that hour is new
    fn prune_on_rollover(&self, alert_key: &str) {
        let Some(hour) = hour_of(alert_key) else {
            return;
        };
        let Ok(mut latest) = self.latest_hour.lock() else {
            return;
        };
        if hour <= latest.as_str() {
            return;
        }
        *latest = hour.to_string();

        let before = self.sent.len();
        self.sent
            .retain(|key| hour_of(key).is_some_and(|claimed| claimed >= hour));
        let pruned = before.saturating_sub(self.sent.len());
        if pruned > 0 {
            debug!(hour = %hour, pruned = pruned, "Pruned alert claims from earlier hours");
        }
    }

    /// Give a claim back after a failed delivery so a later detection can retry
    pub fn release(&self, alert_key: &str) {
        self.sent.remove(alert_key);
    }

    /// Persist the sent marker; failures are logged and the in-process claim stands
    pub async fn record_sent(&self, alert: &Alert, sent_at: DateTime<Utc>) {
        let alert_key = alert.alert_key();
        let record = SentAlertRecord {
            account_id: alert.account.id.clone(),
            distribution_id: alert.distribution_id.clone(),
            metric: alert.metric,
            severity: alert.severity,
            current_value: alert.current_value,
            baseline_value: alert.baseline_value,
            sent_at,
        };
        let expires_at = sent_at.timestamp() + self.ttl_secs;

        let result = match StoreItem::encode(alert_key.clone(), &record, expires_at) {
            Ok(item) => self.client.put_item(&self.table, item).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(alert_key = %alert_key, error = %e, "Failed to record sent alert");
        }
    }

    /// Every live sent-alert marker
    pub async fn list_sent(&self) -> Vec<(String, SentAlertRecord)> {
        self.client
            .scan_items(&self.table)
            .await
            .into_iter()
            .filter_map(|item| {
                let record = item.decode::<SentAlertRecord>().ok()?;
                Some((item.key, record))
            })
            .collect()
    }

    pub fn is_claimed(&self, alert_key: &str) -> bool {
        self.sent.contains(alert_key)
    }
}

/// `YYYYmmddHH` suffix of an alert key
fn hour_of(alert_key: &str) -> Option<&str> {
    alert_key.rsplit_once('#').map(|(_, hour)| hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::models::Account;
    use crate::store::testing::{FlakyStore, Op};
    use crate::clock::hour_bucket;
    use crate::store::RetryPolicy;
    use chrono::TimeZone;
    use std::sync::Arc;

    const TABLE: &str = "CF_Sent_Alerts";

    fn dedup(store: Arc<FlakyStore>) -> AlertDeduplicator {
        AlertDeduplicator::new(
            StoreClient::new(store, RetryPolicy::immediate()),
            TABLE,
            24 * 3600,
        )
    }

    fn alert() -> Alert {
        Alert {
            account: Account {
                id: "1".to_string(),
                name: "n".to_string(),
                email: "e".to_string(),
            },
            distribution_id: "D".to_string(),
            metric: MetricKind::Requests,
            severity: Severity::Critical,
            current_value: 3000.0,
            baseline_value: 500.0,
            multiplier: 3.0,
            consecutive_count: 1,
            timestamp: Utc::now(),
            percentage_change: 500.0,
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let d = dedup(Arc::new(FlakyStore::new()));
        assert!(d.try_claim("k").await);
        assert!(!d.try_claim("k").await);
        d.release("k");
        assert!(d.try_claim("k").await);
    }

    #[tokio::test]
    async fn test_durable_marker_blocks_other_process() {
        let store = Arc::new(FlakyStore::new());
        let first = dedup(store.clone());
        let a = alert();
        first.record_sent(&a, Utc::now()).await;

        let second = dedup(store.clone());
        assert!(!second.try_claim(&a.alert_key()).await);
        // the durable hit is cached, no second lookup
        let gets = store.calls(Op::Get);
        assert!(!second.try_claim(&a.alert_key()).await);
        assert_eq!(store.calls(Op::Get), gets);
    }

    #[tokio::test]
    async fn test_lookup_failure_fails_open() {
        let store = Arc::new(FlakyStore::new());
        store.fail(Op::Get, None, StoreError::AccessDenied("x".into()), usize::MAX);
        let d = dedup(store);
        assert!(d.try_claim("k").await);
        assert!(d.is_claimed("k"));
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_winner() {
        let d = Arc::new(dedup(Arc::new(FlakyStore::new())));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let d = d.clone();
            handles.push(tokio::spawn(async move { d.try_claim("same").await }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_list_sent_returns_records() {
        let d = dedup(Arc::new(FlakyStore::new()));
        let a = alert();
        d.record_sent(&a, a.timestamp).await;
        let listed = d.list_sent().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, a.alert_key());
        assert_eq!(listed[0].1.severity, Severity::Critical);
        assert_eq!(listed[0].1.sent_at, a.timestamp);
        assert_eq!(listed[0].1.current_value, 3000.0);
    }

    #[tokio::test]
    async fn test_claims_from_earlier_hours_are_pruned() {
        let d = dedup(Arc::new(FlakyStore::new()));
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let key_at = |hours: i64| {
            let at = start + chrono::Duration::hours(hours);
            format!("1#D#Requests#{}", hour_bucket(at))
        };

        for hour in 0..30 * 24 {
            assert!(d.try_claim(&key_at(hour)).await);
        }

        assert_eq!(d.sent.len(), 1);
        assert!(!d.is_claimed(&key_at(0)));
        assert!(d.is_claimed(&key_at(30 * 24 - 1)));
    }

    #[tokio::test]
    async fn test_current_hour_claims_survive_pruning() {
        let d = dedup(Arc::new(FlakyStore::new()));
        assert!(d.try_claim("1#D#Requests#2026020306").await);
        assert!(d.try_claim("2#E#Requests#2026020306").await);
        // a late alert for an earlier hour does not evict the current one
        assert!(d.try_claim("3#F#Requests#2026020305").await);
        assert!(!d.try_claim("1#D#Requests#2026020306").await);

        assert!(d.try_claim("1#D#Requests#2026020307").await);
        assert!(!d.is_claimed("2#E#Requests#2026020306"));
        assert!(!d.is_claimed("3#F#Requests#2026020305"));
        assert!(d.is_claimed("1#D#Requests#2026020307"));
    }
}
