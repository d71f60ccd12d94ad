//! Shared key-value store plumbing: the store contract, the Redis-backed
//! implementation, and campaign cancellation flags.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use crate::error::StoreError;

/// The store operations the engine relies on: atomic hash increments with
/// pipelining, and plain string get/set/delete with optional TTL.
#[async_trait]
pub trait Store: Send + Sync {
    /// Apply every increment to fields of `key` atomically, in one round
    /// trip.
    async fn hincr_many(&self, key: &str, incrs: &[(String, i64)]) -> Result<(), StoreError>;

    /// Read a whole hash.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, u64>, StoreError>;

    /// Delete a key.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Read a string key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a string key, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
}

/// How a producer or worker reaches the shared store: an existing
/// caller-owned connection, or a URL the component connects (and owns) a
/// fresh handle from.
#[derive(Clone)]
pub enum StoreConfig {
    /// Connect a new handle from a `redis://` URL; the component owns it.
    Url(String),
    /// Use an existing multiplexed handle; the caller keeps ownership.
    Manager(ConnectionManager),
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreConfig::Url(url) => f.debug_tuple("Url").field(url).finish(),
            StoreConfig::Manager(_) => f.write_str("Manager(..)"),
        }
    }
}

impl StoreConfig {
    /// Resolve to a live handle, connecting if needed.
    pub async fn resolve(self) -> Result<StoreHandle, StoreError> {
        match self {
            StoreConfig::Manager(manager) => Ok(StoreHandle { manager, owned: false }),
            StoreConfig::Url(url) => {
                let client =
                    redis::Client::open(url.as_str()).map_err(|e| StoreError::Connect(e.to_string()))?;
                // The connection manager multiplexes commands and re-issues
                // them across reconnects, so per-request retries are never
                // capped.
                let manager = ConnectionManager::new(client)
                    .await
                    .map_err(|e| StoreError::Connect(e.to_string()))?;
                Ok(StoreHandle { manager, owned: true })
            }
        }
    }
}

/// A resolved store connection plus its ownership rule.
#[derive(Clone)]
pub struct StoreHandle {
    manager: ConnectionManager,
    owned: bool,
}

impl StoreHandle {
    /// The underlying multiplexed connection.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// A [`Store`] view over this handle.
    pub fn store(&self) -> RedisStore {
        RedisStore { manager: self.manager.clone() }
    }

    /// Whether the component that resolved this handle owns it.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Release the handle. Dropping the last clone disconnects; this only
    /// makes the ownership transition observable in logs.
    pub fn close(self) {
        if self.owned {
            debug!("closing component-owned store connection");
        }
    }
}

/// Redis-backed [`Store`].
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hincr_many(&self, key: &str, incrs: &[(String, i64)]) -> Result<(), StoreError> {
        if incrs.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, by) in incrs {
            pipe.cmd("HINCRBY").arg(key).arg(field).arg(*by).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, u64>, StoreError> {
        let mut conn = self.manager.clone();
        let hash: HashMap<String, u64> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(hash)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}

/// In-memory [`Store`] for tests and development.
#[derive(Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hincr_many(&self, key: &str, incrs: &[(String, i64)]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        for (field, by) in incrs {
            *hash.entry(field.clone()).or_insert(0) += by;
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, u64>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter().map(|(field, count)| (field.clone(), (*count).max(0) as u64)).collect()
            })
            .unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.strings.remove(key);
        inner.hashes.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.lock().strings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Key under which a campaign's cancellation flag lives.
pub fn campaign_cancel_key(campaign_id: &str) -> String {
    format!("worker:cancel:campaign:{campaign_id}")
}

/// Raise the cancellation flag for a campaign. Workers skip jobs bearing
/// this campaign id from their next claim onward.
pub async fn cancel_campaign(
    store: &dyn Store,
    campaign_id: &str,
    ttl: Option<Duration>,
) -> Result<(), StoreError> {
    store.set(&campaign_cancel_key(campaign_id), "true", ttl).await
}

/// Lower a campaign's cancellation flag.
pub async fn clear_campaign(store: &dyn Store, campaign_id: &str) -> Result<(), StoreError> {
    store.del(&campaign_cancel_key(campaign_id)).await
}

/// Whether a campaign is flagged as cancelled. Store read errors are logged
/// and treated as "not cancelled".
pub async fn is_campaign_cancelled(store: &dyn Store, campaign_id: &str) -> bool {
    match store.get(&campaign_cancel_key(campaign_id)).await {
        Ok(value) => value.as_deref() == Some("true"),
        Err(err) => {
            warn!(campaign_id, err = %err, "cancellation flag read failed, assuming not cancelled");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_key_format() {
        assert_eq!(campaign_cancel_key("c1"), "worker:cancel:campaign:c1");
    }

    #[tokio::test]
    async fn memory_store_hash_roundtrip() {
        let store = MemoryStore::new();
        store
            .hincr_many("stats", &[("success".into(), 2), ("error:X".into(), 1)])
            .await
            .unwrap();
        store.hincr_many("stats", &[("success".into(), 1)]).await.unwrap();

        let hash = store.hgetall("stats").await.unwrap();
        assert_eq!(hash["success"], 3);
        assert_eq!(hash["error:X"], 1);

        store.del("stats").await.unwrap();
        assert!(store.hgetall("stats").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_flag_lifecycle() {
        let store = MemoryStore::new();
        assert!(!is_campaign_cancelled(&store, "c1").await);

        cancel_campaign(&store, "c1", None).await.unwrap();
        assert!(is_campaign_cancelled(&store, "c1").await);
        assert_eq!(store.get("worker:cancel:campaign:c1").await.unwrap().as_deref(), Some("true"));

        clear_campaign(&store, "c1").await.unwrap();
        assert!(!is_campaign_cancelled(&store, "c1").await);
    }

    #[tokio::test]
    async fn only_literal_true_cancels() {
        let store = MemoryStore::new();
        store.set(&campaign_cancel_key("c2"), "yes", None).await.unwrap();
        assert!(!is_campaign_cancelled(&store, "c2").await);
    }
}
