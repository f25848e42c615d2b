//! 文件键值存储：每个键一个 JSON 文件，用于跨进程保留的状态（学习快照）
//!
//! 文件名为键的 SHA-256；写入先落临时文件再 rename，读到半截文件的情况不会出现。
//! 带 TTL 的条目在读取时惰性删除。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::{CacheError, KvStore};

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    key: String,
    value: String,
    expires_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// 目录在第一次写入时创建
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

fn io_error(e: std::io::Error) -> CacheError {
    CacheError::Unavailable(e.to_string())
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let path = self.path_for(key);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        let record: FileRecord =
            serde_json::from_str(&data).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let expired = record
            .expires_at_ms
            .map(|t| chrono::Utc::now().timestamp_millis() >= t)
            .unwrap_or(false);
        if expired || record.key != key {
            if expired {
                self.delete(key).await?;
            }
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;
        let record = FileRecord {
            key: key.to_string(),
            value,
            expires_at_ms: ttl.map(|t| chrono::Utc::now().timestamp_millis() + t.as_millis() as i64),
        };
        let data =
            serde_json::to_string(&record).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await.map_err(io_error)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}
