//! 节点探测器

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// 探测一个节点；Ok 为本次往返耗时
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, node_id: &str) -> Result<Duration, String>;
}

/// HTTP 探测：GET 健康检查地址，2xx 视为健康
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// 节点地址通常在内网，直连不走系统代理
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self::with_client(client, url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NodeProbe for HttpProbe {
    async fn probe(&self, _node_id: &str) -> Result<Duration, String> {
        let started = Instant::now();
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if status.is_success() {
            Ok(started.elapsed())
        } else {
            Err(format!("health endpoint returned {}", status))
        }
    }
}

/// 可切换的固定结果探测（本地节点与测试使用）
#[derive(Debug)]
pub struct StaticProbe {
    healthy: AtomicBool,
    latency: Duration,
}

impl StaticProbe {
    pub fn new(healthy: bool, latency: Duration) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            latency,
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeProbe for StaticProbe {
    async fn probe(&self, node_id: &str) -> Result<Duration, String> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(self.latency)
        } else {
            Err(format!("node {} unreachable", node_id))
        }
    }
}
