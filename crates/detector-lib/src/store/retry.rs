//! Retrying access to a key-value store
//!
//! Throttling and availability errors are retried with exponential backoff.
//! Every other error surfaces immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{KeyValueStore, StoreItem};
use crate::error::StoreError;
use crate::observability::DetectorMetrics;

/// Backoff schedule for transient store failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget without sleeping, for tests and offline tools
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (0-based): base, 2x base, 4x base...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Store handle that applies a [`RetryPolicy`] to every call
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    metrics: DetectorMetrics,
}

impl StoreClient {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            metrics: DetectorMetrics::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn get_item(&self, table: &str, key: &str) -> Result<Option<StoreItem>, StoreError> {
        self.with_retry("get", table, key, || self.store.get(table, key))
            .await
    }

    pub async fn put_item(&self, table: &str, item: StoreItem) -> Result<(), StoreError> {
        let key = item.key.clone();
        self.with_retry("put", table, &key, || self.store.put(table, item.clone()))
            .await
    }

    /// Full table scan; failures are logged and yield an empty list
    pub async fn scan_items(&self, table: &str) -> Vec<StoreItem> {
        match self.with_retry("scan", table, "*", || self.store.scan(table)).await {
            Ok(items) => items,
            Err(e) => {
                warn!(table = %table, error = %e, "Scan failed, treating table as empty");
                Vec::new()
            }
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        table: &str,
        key: &str,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        operation = operation,
                        table = %table,
                        key = %key,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store error, retrying"
                    );
                    self.metrics.inc_store_retries(operation);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(
                            operation = operation,
                            table = %table,
                            key = %key,
                            attempts = attempt + 1,
                            error = %e,
                            "Store operation failed after retries"
                        );
                    } else {
                        error!(
                            operation = operation,
                            table = %table,
                            key = %key,
                            code = e.code(),
                            error = %e,
                            "Store operation failed"
                        );
                    }
                    self.metrics.inc_store_errors(operation, e.code());
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{FlakyStore, Op};
    use serde_json::json;

    fn item(key: &str) -> StoreItem {
        StoreItem {
            key: key.to_string(),
            expires_at: i64::MAX,
            attributes: json!({}),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(RetryPolicy::immediate().delay_for(5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let store = Arc::new(FlakyStore::new());
        store.fail(Op::Put, None, StoreError::Throttled("slow".into()), 2);
        let client = StoreClient::new(store.clone(), RetryPolicy::immediate());

        client.put_item("t", item("k")).await.unwrap();
        assert_eq!(store.calls(Op::Put), 3);
        assert!(client.get_item("t", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(FlakyStore::new());
        store.fail(Op::Get, None, StoreError::Unavailable("down".into()), usize::MAX);
        let client = StoreClient::new(store.clone(), RetryPolicy::immediate());

        let err = client.get_item("t", "k").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls(Op::Get), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_fast() {
        let store = Arc::new(FlakyStore::new());
        store.fail(Op::Get, None, StoreError::AccessDenied("iam".into()), usize::MAX);
        let client = StoreClient::new(store.clone(), RetryPolicy::immediate());

        assert!(client.get_item("t", "k").await.is_err());
        assert_eq!(store.calls(Op::Get), 1);
    }

    #[tokio::test]
    async fn test_scan_failure_yields_empty() {
        let store = Arc::new(FlakyStore::new());
        let client = StoreClient::new(store.clone(), RetryPolicy::immediate());
        client.put_item("t", item("k")).await.unwrap();

        store.fail(Op::Scan, None, StoreError::TableNotFound("t".into()), 1);
        assert!(client.scan_items("t").await.is_empty());
        assert_eq!(client.scan_items("t").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_sleeps_between_attempts() {
        let store = Arc::new(FlakyStore::new());
        store.fail(Op::Put, None, StoreError::Throttled("slow".into()), 2);
        let client = StoreClient::new(store.clone(), RetryPolicy::default());

        let started = tokio::time::Instant::now();
        client.put_item("t", item("k")).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }
}
