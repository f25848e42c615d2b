//! 结果缓存管理
//!
//! 缓存键 = `hive:cache:tool:` + SHA-256(规范化 JSON{能力名, 决定结果的参数, 声明的上下文字段})。
//! 只缓存成功结果；过期读取视为未命中并删除条目；存储故障一律按未命中处理，不影响执行。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::{CacheError, KvStore};
use crate::plan::ToolOutcome;
use crate::tools::CapabilityDescriptor;

const KEY_PREFIX: &str = "hive:cache:tool:";

/// 存储中的条目：payload + 创建时间 + TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Value,
    pub created_at_ms: i64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl_ms as i64
    }
}

/// 命中统计快照
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

pub struct CacheManager {
    store: Arc<dyn KvStore>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

impl CacheManager {
    pub fn new(store: Arc<dyn KvStore>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// 计算缓存键；只包含决定结果的参数与能力声明的上下文字段
    pub fn cache_key(
        capability: &str,
        descriptor: &CapabilityDescriptor,
        params: &Value,
        context: &Value,
    ) -> String {
        let material = serde_json::json!({
            "capability": capability,
            "params": result_params(descriptor, params),
            "context": context_fingerprint(descriptor, context),
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&material).as_bytes());
        format!("{}{}", KEY_PREFIX, hex::encode(hasher.finalize()))
    }

    /// 查找缓存；命中返回标记为 cached 的结果
    pub async fn get(
        &self,
        capability: &str,
        descriptor: &CapabilityDescriptor,
        params: &Value,
        context: &Value,
    ) -> Option<ToolOutcome> {
        if descriptor.cache_ttl(self.default_ttl).is_none() {
            return None;
        }
        let key = Self::cache_key(capability, descriptor, params, context);
        match self.lookup(&key).await {
            Ok(Some(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(capability, key = %short(&key), "cache hit");
                Some(ToolOutcome::from_cache(entry.payload))
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(capability, key = %short(&key), "cache miss");
                None
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(capability, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let raw = match self.store.get(key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                self.store.delete(key).await?;
                return Err(CacheError::Serialization(e.to_string()));
            }
        };
        if entry.is_expired(now_ms()) {
            self.store.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// 写入成功结果；ttl 为 None 时按能力的易变程度推导，易变能力即使显式给出 ttl 也不写入。返回是否写入
    pub async fn set(
        &self,
        capability: &str,
        descriptor: &CapabilityDescriptor,
        params: &Value,
        context: &Value,
        outcome: &ToolOutcome,
        ttl: Option<Duration>,
    ) -> bool {
        if !outcome.success || outcome.cached {
            return false;
        }
        let Some(derived) = descriptor.cache_ttl(self.default_ttl) else {
            return false;
        };
        let ttl = ttl.unwrap_or(derived);
        if ttl.is_zero() {
            return false;
        }
        let payload = outcome.payload.clone().unwrap_or(Value::Null);
        let entry = CacheEntry {
            payload,
            created_at_ms: now_ms(),
            ttl_ms: ttl.as_millis() as u64,
        };
        let key = Self::cache_key(capability, descriptor, params, context);
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(capability, error = %e, "cache entry serialization failed");
                return false;
            }
        };
        match self.store.set(&key, raw, Some(ttl)).await {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                debug!(capability, ttl_ms = entry.ttl_ms, "cache write");
                true
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(capability, error = %e, "cache write failed");
                false
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

fn result_params(descriptor: &CapabilityDescriptor, params: &Value) -> Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let filtered = obj
        .iter()
        .filter(|(k, _)| {
            descriptor
                .result_fields
                .as_ref()
                .map(|fields| fields.iter().any(|f| f == *k))
                .unwrap_or(true)
        })
        .filter(|(k, _)| !descriptor.volatile_fields.iter().any(|f| f == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(filtered)
}

fn context_fingerprint(descriptor: &CapabilityDescriptor, context: &Value) -> Value {
    let picked = descriptor
        .context_fields
        .iter()
        .filter_map(|f| context.get(f).map(|v| (f.clone(), v.clone())))
        .collect();
    Value::Object(picked)
}

/// 键排序后的紧凑 JSON，不依赖 serde_json 的 Map 实现
pub(crate) fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn short(key: &str) -> &str {
    let start = KEY_PREFIX.len().min(key.len());
    let end = (start + 12).min(key.len());
    &key[start..end]
}
