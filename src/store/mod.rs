//! Key-value store collaborator
//!
//! The engine treats the store as an eventually-durable side channel for
//! strategy snapshots, audit logs and trade records. It never coordinates
//! money-moving decisions; the chain and the in-memory ledger do.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Primitives the engine needs from a key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, hash: &str, field: &str, value: String) -> Result<()>;
    async fn hdel(&self, hash: &str, field: &str) -> Result<()>;
    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>>;
    /// Push to the head of a list
    async fn lpush(&self, list: &str, value: String) -> Result<()>;
    /// Inclusive range; negative `stop` counts from the tail
    async fn lrange(&self, list: &str, start: usize, stop: isize) -> Result<Vec<String>>;
    /// Keep only the inclusive range `[start, stop]`
    async fn ltrim(&self, list: &str, start: usize, stop: usize) -> Result<()>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    values: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
}

/// In-memory store with an optional JSON snapshot on disk
pub struct MemoryStore {
    data: RwLock<StoreData>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Volatile store, nothing is written to disk
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData::default()),
            snapshot_path: None,
        }
    }

    /// Open a store backed by a snapshot file, loading it if present
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("read {}: {}", path.display(), e)))?;
            let data: StoreData = serde_json::from_str(&raw)
                .map_err(|e| Error::Store(format!("parse {}: {}", path.display(), e)))?;
            info!(
                "Loaded store snapshot from {} ({} keys, {} hashes, {} lists)",
                path.display(),
                data.values.len(),
                data.hashes.len(),
                data.lists.len()
            );
            data
        } else {
            StoreData::default()
        };

        Ok(Self {
            data: RwLock::new(data),
            snapshot_path: Some(path),
        })
    }

    /// Write the snapshot file, if one is configured
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let serialized = {
            let data = self.data.read().await;
            serde_json::to_string(&*data)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Flushed store snapshot to {}", path.display());
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.read().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.data.write().await.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .data
            .read()
            .await
            .hashes
            .get(hash)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hset(&self, hash: &str, field: &str, value: String) -> Result<()> {
        self.data
            .write()
            .await
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<()> {
        if let Some(h) = self.data.write().await.hashes.get_mut(hash) {
            h.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .data
            .read()
            .await
            .hashes
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn lpush(&self, list: &str, value: String) -> Result<()> {
        self.data
            .write()
            .await
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value);
        Ok(())
    }

    async fn lrange(&self, list: &str, start: usize, stop: isize) -> Result<Vec<String>> {
        let data = self.data.read().await;
        let Some(items) = data.lists.get(list) else {
            return Ok(vec![]);
        };
        let len = items.len() as isize;
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if stop < start as isize {
            return Ok(vec![]);
        }
        Ok(items
            .iter()
            .skip(start)
            .take((stop - start as isize + 1) as usize)
            .cloned()
            .collect())
    }

    async fn ltrim(&self, list: &str, start: usize, stop: usize) -> Result<()> {
        if let Some(items) = self.data.write().await.lists.get_mut(list) {
            let keep: VecDeque<String> = items
                .iter()
                .skip(start)
                .take(stop.saturating_sub(start) + 1)
                .cloned()
                .collect();
            *items = keep;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let store = MemoryStore::new();
        store.hset("trades", "a", "1".into()).await.unwrap();
        store.hset("trades", "b", "2".into()).await.unwrap();
        assert_eq!(store.hget("trades", "a").await.unwrap().as_deref(), Some("1"));

        store.hdel("trades", "a").await.unwrap();
        let all = store.hgetall("trades").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("b"));
    }

    #[tokio::test]
    async fn test_list_push_range_trim() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.lpush("audit", i.to_string()).await.unwrap();
        }
        // Newest first
        assert_eq!(store.lrange("audit", 0, 1).await.unwrap(), vec!["4", "3"]);
        assert_eq!(store.lrange("audit", 0, -1).await.unwrap().len(), 5);

        store.ltrim("audit", 0, 2).await.unwrap();
        assert_eq!(store.lrange("audit", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
        assert!(store.lrange("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::open(&path).await.unwrap();
        store.set("strategies:ledger", "{}".into()).await.unwrap();
        store.lpush("audit:tx", "entry".into()).await.unwrap();
        store.flush().await.unwrap();

        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("strategies:ledger").await.unwrap().as_deref(),
            Some("{}")
        );
        assert_eq!(reopened.lrange("audit:tx", 0, -1).await.unwrap(), vec!["entry"]);
    }
}
