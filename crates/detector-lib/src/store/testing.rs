//! Fault-injecting store for tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{InMemoryStore, KeyValueStore, StoreItem};
use crate::clock::Clock;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Get,
    Put,
    Scan,
}

struct FailureRule {
    op: Op,
    /// Exact key to match; `None` matches every key
    key: Option<String>,
    error: StoreError,
    remaining: usize,
}

/// Wraps an [`InMemoryStore`] and fails scripted calls
pub(crate) struct FlakyStore {
    inner: InMemoryStore,
    rules: Mutex<Vec<FailureRule>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::from_store(InMemoryStore::default())
    }

    pub(crate) fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::from_store(InMemoryStore::new(clock))
    }

    fn from_store(inner: InMemoryStore) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` calls of `op` on `key` (any key when `None`)
    pub(crate) fn fail(&self, op: Op, key: Option<&str>, error: StoreError, times: usize) {
        self.rules.lock().unwrap().push(FailureRule {
            op,
            key: key.map(str::to_string),
            error,
            remaining: times,
        });
    }

    pub(crate) fn clear_failures(&self) {
        self.rules.lock().unwrap().clear();
    }

    pub(crate) fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn check(&self, op: Op, key: &str) -> Result<(), StoreError> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            let key_matches = rule.key.as_deref().map_or(true, |k| k == key);
            if rule.op == op && key_matches && rule.remaining > 0 {
                rule.remaining -= 1;
                return Err(rule.error.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoreItem>, StoreError> {
        self.check(Op::Get, key)?;
        self.inner.get(table, key).await
    }

    async fn put(&self, table: &str, item: StoreItem) -> Result<(), StoreError> {
        self.check(Op::Put, &item.key)?;
        self.inner.put(table, item).await
    }

    async fn scan(&self, table: &str) -> Result<Vec<StoreItem>, StoreError> {
        self.check(Op::Scan, table)?;
        self.inner.scan(table).await
    }
}
