//! In-process key-value store with TTL expiry and JSON snapshot persistence

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{KeyValueStore, StoreItem};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// On-disk layout: table name to items, sorted for stable diffs
type Snapshot = BTreeMap<String, Vec<StoreItem>>;

/// Key-value store backed by a concurrent map
///
/// Items whose `expires_at` has passed are invisible to readers and are
/// dropped on [`purge_expired`](Self::purge_expired) or [`flush`](Self::flush).
pub struct InMemoryStore {
    items: DashMap<(String, String), StoreItem>,
    clock: Arc<dyn Clock>,
    persistence_path: Option<PathBuf>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            items: DashMap::new(),
            clock,
            persistence_path: None,
        }
    }

    /// Open a store persisted at `path`, loading any existing snapshot
    ///
    /// A missing file starts an empty store. A corrupt file is an error so
    /// that counters are never silently reset.
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        let store = Self {
            items: read_snapshot(&path)?,
            clock,
            persistence_path: Some(path),
        };
        let purged = store.purge_expired();
        if let Some(path) = store.persistence_path() {
            info!(
                path = %path.display(),
                entries = store.items.len(),
                purged = purged,
                "Opened store"
            );
        }

        Ok(store)
    }

    /// Load a snapshot for inspection; the result never writes back to `path`
    pub fn load(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(path.exists(), "Store snapshot {:?} does not exist", path);
        let store = Self {
            items: read_snapshot(path)?,
            clock,
            persistence_path: None,
        };
        store.purge_expired();
        Ok(store)
    }

    pub fn persistence_path(&self) -> Option<&Path> {
        self.persistence_path.as_deref()
    }

    /// Number of live and not-yet-purged items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop expired items, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now().timestamp();
        let before = self.items.len();
        self.items.retain(|_, item| !item.is_expired(now));
        before.saturating_sub(self.items.len())
    }

    /// Drop expired items, then write the snapshot to disk if persistence is enabled
    pub fn flush(&self) -> Result<()> {
        let purged = self.purge_expired();
        let Some(path) = self.persistence_path.as_ref() else {
            if purged > 0 {
                debug!(purged = purged, "Expired items purged");
            }
            return Ok(());
        };

        let mut snapshot = Snapshot::new();
        for entry in self.items.iter() {
            let (table, _) = entry.key();
            snapshot
                .entry(table.clone())
                .or_default()
                .push(entry.value().clone());
        }
        for items in snapshot.values_mut() {
            items.sort_by(|a, b| a.key.cmp(&b.key));
        }

        save_snapshot(path, &snapshot)?;
        debug!(path = %path.display(), entries = self.items.len(), "Store flushed to disk");
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<DashMap<(String, String), StoreItem>> {
    let items = DashMap::new();
    if !path.exists() {
        return Ok(items);
    }

    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read store snapshot {:?}", path))?;
    if data.is_empty() {
        return Ok(items);
    }
    let snapshot: Snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse store snapshot {:?}", path))?;
    for (table, table_items) in snapshot {
        for item in table_items {
            items.insert((table.clone(), item.key.clone()), item);
        }
    }
    Ok(items)
}

fn save_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize store")?;

    // Write atomically using temp file
    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(&json).context("Failed to write store data")?;
    file.sync_all().context("Failed to sync store file")?;

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
    Ok(())
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, table: &str, key: &str) -> Result<Option<StoreItem>, StoreError> {
        check_key(key)?;
        let now = self.clock.now().timestamp();
        let map_key = (table.to_string(), key.to_string());
        Ok(self
            .items
            .get(&map_key)
            .filter(|item| !item.is_expired(now))
            .map(|item| item.value().clone()))
    }

    async fn put(&self, table: &str, item: StoreItem) -> Result<(), StoreError> {
        check_key(&item.key)?;
        self.items
            .insert((table.to_string(), item.key.clone()), item);
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<StoreItem>, StoreError> {
        let now = self.clock.now().timestamp();
        let mut items: Vec<StoreItem> = self
            .items
            .iter()
            .filter(|entry| entry.key().0 == table && !entry.value().is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }
}

impl Drop for InMemoryStore {
    fn drop(&mut self) {
        if self.persistence_path.is_some() {
            if let Err(e) = self.flush() {
                warn!(error = %e, "Failed to flush store on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 6, 0, 0).unwrap(),
        ))
    }

    fn item(key: &str, expires_at: i64) -> StoreItem {
        StoreItem {
            key: key.to_string(),
            expires_at,
            attributes: json!({"count": 1}),
        }
    }

    #[tokio::test]
    async fn test_get_put_scan() {
        let clock = clock();
        let now = clock.now().timestamp();
        let store = InMemoryStore::new(clock.clone());

        store.put("t1", item("b", now + 60)).await.unwrap();
        store.put("t1", item("a", now + 60)).await.unwrap();
        store.put("t2", item("c", now + 60)).await.unwrap();

        assert!(store.get("t1", "a").await.unwrap().is_some());
        assert!(store.get("t2", "a").await.unwrap().is_none());

        let keys: Vec<String> = store
            .scan("t1")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_expired_items_are_absent() {
        let clock = clock();
        let now = clock.now().timestamp();
        let store = InMemoryStore::new(clock.clone());

        store.put("t", item("k", now + 60)).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));

        assert!(store.get("t", "k").await.unwrap().is_none());
        assert!(store.scan("t").await.unwrap().is_empty());
        assert_eq!(store.purge_expired(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = InMemoryStore::new(clock());
        let err = store.get("t", "").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");
        let clock = clock();
        let now = clock.now().timestamp();

        {
            let store = InMemoryStore::open(&path, clock.clone()).unwrap();
            store.put("t", item("live", now + 3600)).await.unwrap();
            store.put("t", item("stale", now + 1)).await.unwrap();
            store.flush().unwrap();
        }

        clock.advance(chrono::Duration::seconds(10));
        let reopened = InMemoryStore::open(&path, clock.clone()).unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get("t", "live").await.unwrap().is_some());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(InMemoryStore::open(&path, clock()).is_err());
        // the corrupt file is left for an operator to inspect
        assert_eq!(std::fs::read(&path).unwrap(), b"{not json");
    }

    #[tokio::test]
    async fn test_load_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let clock = clock();
        let now = clock.now().timestamp();
        {
            let store = InMemoryStore::open(&path, clock.clone()).unwrap();
            store.put("t", item("k", now + 3600)).await.unwrap();
        }
        let before = std::fs::read(&path).unwrap();

        let loaded = tokio_test::assert_ok!(InMemoryStore::load(&path, clock.clone()));
        assert!(loaded.persistence_path().is_none());
        loaded.put("t", item("extra", now + 3600)).await.unwrap();
        drop(loaded);

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(InMemoryStore::load(dir.path().join("missing.json"), clock).is_err());
    }

    #[tokio::test]
    async fn test_flush_purges_without_persistence() {
        let clock = clock();
        let now = clock.now().timestamp();
        let store = InMemoryStore::new(clock.clone());
        store.put("t", item("marker", now + 900)).await.unwrap();
        store.put("t", item("counter", now + 30 * 24 * 3600)).await.unwrap();

        store.flush().unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(chrono::Duration::seconds(901));
        store.flush().unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("t", "counter").await.unwrap().is_some());
    }
}
