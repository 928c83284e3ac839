//! Durable key-value storage
//!
//! This module provides:
//! - The `KeyValueStore` collaborator contract (get/put/scan with TTL expiry)
//! - An in-memory store with JSON snapshot persistence
//! - A retrying client that separates transient from permanent failures
//! - The idempotent abuse counter built on top of them

mod counter;
mod memory;
mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use counter::{CounterKey, CounterRecord, CounterStore};
pub use memory::InMemoryStore;
pub use retry::{RetryPolicy, StoreClient};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::StoreError;

/// One stored item: primary key, absolute expiry (unix seconds) and typed attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreItem {
    pub key: String,
    pub expires_at: i64,
    pub attributes: serde_json::Value,
}

impl StoreItem {
    /// Encode a record into an item
    pub fn encode<T: Serialize>(
        key: impl Into<String>,
        record: &T,
        expires_at: i64,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            key: key.into(),
            expires_at,
            attributes: serde_json::to_value(record)?,
        })
    }

    /// Decode the attributes back into a record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.attributes.clone())?)
    }

    /// Whether the backing store would already have evicted this item
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at <= now_unix
    }
}

/// Durable key-value collaborator
///
/// Implementations are expected to treat items past `expires_at` as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoreItem>, StoreError>;

    async fn put(&self, table: &str, item: StoreItem) -> Result<(), StoreError>;

    async fn scan(&self, table: &str) -> Result<Vec<StoreItem>, StoreError>;
}
