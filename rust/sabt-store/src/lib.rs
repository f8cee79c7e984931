// sabt-store: Key-value store behind rate limiting, idempotency, and job
// ownership
//
// All keys carry a deployment namespace prefix and a TTL. The in-memory
// backend expires entries against the injected clock so frozen-clock tests
// can cross TTL boundaries without waiting.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sabt_clock::Clock;
use thiserror::Error;
use tokio::sync::Mutex;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Namespaced key-value store
///
/// `incr` is atomic and sets the TTL on first write; `set_if_not_exists`
/// returns whether the caller won the write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    fn namespace(&self) -> &str;

    async fn incr(&self, key: &str, ttl_seconds: u64) -> StoreResult<i64>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()>;

    async fn set_if_not_exists(&self, key: &str, value: &str, ttl_seconds: u64)
        -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

struct Entry {
    expires_at: f64,
    value: String,
}

/// In-memory reference backend for tests and single-process deployments
pub struct InMemoryStore {
    namespace: String,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new(namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            namespace: namespace.into(),
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn now_seconds(&self) -> f64 {
        self.clock.now().timestamp_millis() as f64 / 1000.0
    }

    fn purge_expired(entries: &mut HashMap<String, Entry>, now: f64) {
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn incr(&self, key: &str, ttl_seconds: u64) -> StoreResult<i64> {
        let key = self.namespaced(key);
        let now = self.now_seconds();
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, now);
        let next = match entries.get(&key) {
            Some(entry) => entry.value.parse::<i64>().unwrap_or(0) + 1,
            None => 1,
        };
        let expires_at = match entries.get(&key) {
            Some(entry) => entry.expires_at,
            None => now + ttl_seconds as f64,
        };
        entries.insert(
            key,
            Entry {
                expires_at,
                value: next.to_string(),
            },
        );
        Ok(next)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.namespaced(key);
        let now = self.now_seconds();
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, now);
        Ok(entries.get(&key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        let key = self.namespaced(key);
        let now = self.now_seconds();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            Entry {
                expires_at: now + ttl_seconds as f64,
                value: value.to_string(),
            },
        );
        Ok(())
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> StoreResult<bool> {
        let key = self.namespaced(key);
        let now = self.now_seconds();
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, now);
        if entries.contains_key(&key) {
            return Ok(false);
        }
        entries.insert(
            key,
            Entry {
                expires_at: now + ttl_seconds as f64,
                value: value.to_string(),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = self.namespaced(key);
        let mut entries = self.entries.lock().await;
        entries.remove(&key);
        Ok(())
    }
}

/// Redis-backed production store
///
/// Uses a multiplexed connection manager; safe to clone across request
/// handlers.
#[derive(Clone)]
pub struct RedisStore {
    namespace: String,
    connection: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(dsn: &str, namespace: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(dsn)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self {
            namespace: namespace.into(),
            connection,
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn incr(&self, key: &str, ttl_seconds: u64) -> StoreResult<i64> {
        let key = self.namespaced(key);
        let mut connection = self.connection.clone();
        let value: i64 = redis::cmd("INCR")
            .arg(&key)
            .query_async(&mut connection)
            .await?;
        if value == 1 {
            let _: i64 = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(ttl_seconds)
                .query_async(&mut connection)
                .await?;
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = self.namespaced(key);
        let mut connection = self.connection.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut connection)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        let key = self.namespaced(key);
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn set_if_not_exists(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> StoreResult<bool> {
        let key = self.namespaced(key);
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .arg("NX")
            .query_async(&mut connection)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let key = self.namespaced(key);
        let mut connection = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use sabt_clock::FrozenClock;

    fn store() -> (Arc<FrozenClock>, InMemoryStore) {
        let clock = Arc::new(FrozenClock::at(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = InMemoryStore::new("test", Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, store)
    }

    #[tokio::test]
    async fn incr_counts_and_expires() {
        let (clock, store) = store();
        assert_eq!(store.incr("rl:c1:0", 30).await.unwrap(), 1);
        assert_eq!(store.incr("rl:c1:0", 30).await.unwrap(), 2);
        clock.tick(31.0);
        assert_eq!(store.incr("rl:c1:0", 30).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_keeps_first_write_ttl() {
        let (clock, store) = store();
        store.incr("bucket", 30).await.unwrap();
        clock.tick(20.0);
        store.incr("bucket", 30).await.unwrap();
        clock.tick(11.0);
        // First write set the deadline; the second incr must not extend it.
        assert_eq!(store.get("bucket").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_not_exists_wins_only_once() {
        let (_clock, store) = store();
        assert!(store.set_if_not_exists("idem:k", "a", 60).await.unwrap());
        assert!(!store.set_if_not_exists("idem:k", "b", 60).await.unwrap());
        assert_eq!(store.get("idem:k").await.unwrap(), Some("a".to_string()));
    }

    #[tokio::test]
    async fn expired_keys_become_writable_again() {
        let (clock, store) = store();
        assert!(store.set_if_not_exists("k", "a", 10).await.unwrap());
        clock.tick(11.0);
        assert!(store.set_if_not_exists("k", "b", 10).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let (_clock, store) = store();
        store.set("k", "v", 60).await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_incr_never_loses_counts() {
        let (_clock, store) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.incr("storm", 60).await.unwrap()
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=32).collect::<Vec<i64>>());
    }
}
