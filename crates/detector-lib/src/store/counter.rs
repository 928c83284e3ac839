//! Idempotent consecutive-violation counters
//!
//! Each (entity, metric) pair has one canonical counter. An update also
//! writes a window marker keyed by the 15-minute bucket; a replay inside the
//! same bucket finds the marker and returns the recorded value instead of
//! counting twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{StoreClient, StoreItem};
use crate::clock::{quarter_hour_bucket, Clock};
use crate::models::{EntityId, MetricKind};

/// Canonical counter key, `account#distribution#Metric`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub entity: EntityId,
    pub metric: MetricKind,
}

impl CounterKey {
    pub fn new(entity: EntityId, metric: MetricKind) -> Self {
        Self { entity, metric }
    }

    /// Marker key for the window containing `at`
    pub fn window_key(&self, at: DateTime<Utc>) -> String {
        format!("{}#{}", self, quarter_hour_bucket(at))
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.metric)
    }
}

/// Attributes stored for both canonical counters and window markers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub count: u64,
    pub last_update: DateTime<Utc>,
}

/// Durable counter table accessed through a retrying client
#[derive(Clone)]
pub struct CounterStore {
    client: StoreClient,
    table: String,
    ttl_secs: i64,
    clock: Arc<dyn Clock>,
}

impl CounterStore {
    pub fn new(
        client: StoreClient,
        table: impl Into<String>,
        ttl_secs: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            table: table.into(),
            ttl_secs,
            clock,
        }
    }

    /// Current count; absent or unreadable counters read as 0
    pub async fn get(&self, key: &CounterKey) -> u64 {
        self.read_count(&key.to_string()).await.unwrap_or(0)
    }

    /// Apply one detection result to the counter
    ///
    /// Abuse increments, anything else decrements with a floor of 0. Calling
    /// this more than once inside the same 15-minute window returns the value
    /// recorded by the first call. Store failures never propagate: a failed
    /// canonical write returns the previous count, a failed marker write is
    /// logged and the new count is still returned.
    pub async fn update(&self, key: &CounterKey, is_abuse: bool) -> u64 {
        let now = self.clock.now();
        let canonical = key.to_string();
        let window_key = key.window_key(now);

        match self.client.get_item(&self.table, &window_key).await {
            Ok(Some(item)) => match item.decode::<CounterRecord>() {
                Ok(record) => {
                    debug!(
                        key = %canonical,
                        window_key = %window_key,
                        count = record.count,
                        "Counter already updated in this window"
                    );
                    return record.count;
                }
                Err(e) => {
                    warn!(window_key = %window_key, error = %e, "Unreadable window marker, recomputing");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(window_key = %window_key, error = %e, "Window marker lookup failed, treating as miss");
            }
        }

        let current = self.read_count(&canonical).await.unwrap_or(0);
        let next = if is_abuse {
            current.saturating_add(1)
        } else {
            current.saturating_sub(1)
        };

        let record = CounterRecord {
            count: next,
            last_update: now,
        };
        let expires_at = now.timestamp() + self.ttl_secs;

        let written = match StoreItem::encode(canonical.clone(), &record, expires_at) {
            Ok(item) => self.client.put_item(&self.table, item).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(key = %canonical, error = %e, count = current, "Counter write failed, keeping previous count");
            return current;
        }

        let marker = StoreItem::encode(window_key.clone(), &record, expires_at);
        let marked = match marker {
            Ok(item) => self.client.put_item(&self.table, item).await,
            Err(e) => Err(e),
        };
        if let Err(e) = marked {
            warn!(
                window_key = %window_key,
                error = %e,
                "Window marker write failed, a replay in this window may count again"
            );
        }

        debug!(key = %canonical, previous = current, count = next, is_abuse = is_abuse, "Counter updated");
        next
    }

    /// Every canonical counter, optionally limited to one account
    pub async fn list(&self, account_id: Option<&str>) -> Vec<(String, CounterRecord)> {
        self.client
            .scan_items(&self.table)
            .await
            .into_iter()
            .filter(|item| !is_window_key(&item.key))
            .filter(|item| {
                account_id.map_or(true, |id| {
                    item.key.split('#').next().is_some_and(|acct| acct == id)
                })
            })
            .filter_map(|item| {
                let record = item.decode::<CounterRecord>().ok()?;
                Some((item.key, record))
            })
            .collect()
    }

    async fn read_count(&self, key: &str) -> Option<u64> {
        match self.client.get_item(&self.table, key).await {
            Ok(Some(item)) => match item.decode::<CounterRecord>() {
                Ok(record) => Some(record.count),
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable counter record, reading as 0");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Counter read failed, reading as 0");
                None
            }
        }
    }
}

/// Window markers end in a 12-digit `YYYYmmddHHMM` bucket
fn is_window_key(key: &str) -> bool {
    key.rsplit('#')
        .next()
        .is_some_and(|tail| tail.len() == 12 && tail.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::store::testing::{FlakyStore, Op};
    use crate::store::{KeyValueStore, RetryPolicy};
    use chrono::TimeZone;

    const TABLE: &str = "CF_Abuse_Counter";

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<FlakyStore>,
        counters: CounterStore,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 6, 2, 0).unwrap(),
        ));
        let store = Arc::new(FlakyStore::with_clock(clock.clone()));
        let client = StoreClient::new(store.clone(), RetryPolicy::immediate());
        let counters = CounterStore::new(client, TABLE, 30 * 24 * 3600, clock.clone());
        Fixture {
            clock,
            store,
            counters,
        }
    }

    fn key() -> CounterKey {
        CounterKey::new(EntityId::new("111122223333", "E2ABC"), MetricKind::Requests)
    }

    fn next_window(f: &Fixture) {
        f.clock.advance(chrono::Duration::minutes(15));
    }

    #[test]
    fn test_key_formats() {
        let k = key();
        assert_eq!(k.to_string(), "111122223333#E2ABC#Requests");
        let at = Utc.with_ymd_and_hms(2026, 2, 3, 6, 44, 0).unwrap();
        assert_eq!(k.window_key(at), "111122223333#E2ABC#Requests#202602030630");
        assert!(is_window_key(&k.window_key(at)));
        assert!(!is_window_key(&k.to_string()));
    }

    #[tokio::test]
    async fn test_absent_counter_reads_zero() {
        let f = fixture();
        assert_eq!(f.counters.get(&key()).await, 0);
    }

    #[tokio::test]
    async fn test_increments_across_windows() {
        let f = fixture();
        assert_eq!(f.counters.update(&key(), true).await, 1);
        next_window(&f);
        assert_eq!(f.counters.update(&key(), true).await, 2);
        next_window(&f);
        assert_eq!(f.counters.update(&key(), false).await, 1);
        assert_eq!(f.counters.get(&key()).await, 1);
    }

    #[tokio::test]
    async fn test_replay_in_same_window_is_idempotent() {
        let f = fixture();
        assert_eq!(f.counters.update(&key(), true).await, 1);
        // same window, later minute
        f.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(f.counters.update(&key(), true).await, 1);
        // a replay with the opposite outcome still returns the recorded value
        assert_eq!(f.counters.update(&key(), false).await, 1);
        assert_eq!(f.counters.get(&key()).await, 1);
    }

    #[tokio::test]
    async fn test_never_negative() {
        let f = fixture();
        for _ in 0..3 {
            assert_eq!(f.counters.update(&key(), false).await, 0);
            next_window(&f);
        }
    }

    #[tokio::test]
    async fn test_marker_lookup_failure_is_a_miss() {
        let f = fixture();
        let k = key();
        f.store.fail(
            Op::Get,
            Some(&k.window_key(f.clock.now())),
            StoreError::AccessDenied("marker".into()),
            1,
        );
        assert_eq!(f.counters.update(&k, true).await, 1);
    }

    #[tokio::test]
    async fn test_canonical_write_failure_returns_previous_count() {
        let f = fixture();
        let k = key();
        assert_eq!(f.counters.update(&k, true).await, 1);
        next_window(&f);

        f.store.fail(
            Op::Put,
            Some(&k.to_string()),
            StoreError::AccessDenied("write".into()),
            1,
        );
        assert_eq!(f.counters.update(&k, true).await, 1);
        // no marker was written, so the same window may still count
        assert!(f
            .store
            .get(TABLE, &k.window_key(f.clock.now()))
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.counters.update(&k, true).await, 2);
    }

    #[tokio::test]
    async fn test_marker_write_failure_still_returns_new_count() {
        let f = fixture();
        let k = key();
        f.store.fail(
            Op::Put,
            Some(&k.window_key(f.clock.now())),
            StoreError::Throttled("busy".into()),
            usize::MAX,
        );
        assert_eq!(f.counters.update(&k, true).await, 1);
        assert_eq!(f.counters.get(&k).await, 1);
    }

    #[tokio::test]
    async fn test_list_skips_window_markers() {
        let f = fixture();
        let other = CounterKey::new(EntityId::new("999", "D9"), MetricKind::BytesDownloaded);
        f.counters.update(&key(), true).await;
        f.counters.update(&other, true).await;

        let all = f.counters.list(None).await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|(k, _)| !is_window_key(k)));

        let one = f.counters.list(Some("999")).await;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].0, "999#D9#BytesDownloaded");
        assert_eq!(one[0].1.count, 1);
    }

    #[tokio::test]
    async fn test_counter_expires_after_ttl() {
        let f = fixture();
        f.counters.update(&key(), true).await;
        f.clock.advance(chrono::Duration::days(31));
        assert_eq!(f.counters.get(&key()).await, 0);
    }
}
