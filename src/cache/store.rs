//! 键值存储抽象与内存实现
//!
//! KvStore 只要求单键原子的 get / set(ttl) / delete；InMemoryKvStore 用 LRU 限制容量，
//! 过期条目在读取时惰性删除，也可由后台清扫任务定期回收。

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// 外部键值存储：单键原子，不支持多键事务
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// ttl 为 None 表示不过期
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }
}

/// 基于 LRU 的内存键值存储，带 per-key TTL
pub struct InMemoryKvStore {
    entries: Mutex<LruCache<String, StoredValue>>,
}

impl InMemoryKvStore {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    /// 删除所有已过期条目，返回删除数量
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// 启动后台清扫任务，token 取消后退出
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.purge_expired().await;
                        if removed > 0 {
                            tracing::debug!(removed, "cache sweeper purged expired entries");
                        }
                    }
                }
            }
        })
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(v) if !v.is_expired(now) => return Ok(Some(v.value.clone())),
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .lock()
            .await
            .put(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_gone() {
        let store = InMemoryKvStore::new(8);
        store
            .set("k", "v".into(), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let store = InMemoryKvStore::new(2);
        store.set("a", "1".into(), None).await.unwrap();
        store.set("b", "2".into(), None).await.unwrap();
        store.set("c", "3".into(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("c").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = InMemoryKvStore::new(8);
        store.set("short", "x".into(), Some(Duration::from_millis(10))).await.unwrap();
        store.set("long", "y".into(), Some(Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_space() {
        let store = Arc::new(InMemoryKvStore::new(8));
        store.set("k", "v".into(), Some(Duration::from_millis(10))).await.unwrap();
        let token = CancellationToken::new();
        let handle = store.spawn_sweeper(Duration::from_millis(50), token.clone());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.is_empty().await);
        token.cancel();
        handle.await.unwrap();
    }
}
