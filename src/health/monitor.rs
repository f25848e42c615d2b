//! 健康监控：后台循环探测所有已注册节点，节点表写时复制发布

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthSection;
use crate::health::probe::NodeProbe;

const LATENCY_EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Online,
    Degraded,
    Offline,
}

impl NodeStatus {
    /// 成功一次只上升一级
    fn promote(self) -> Self {
        match self {
            NodeStatus::Offline => NodeStatus::Degraded,
            _ => NodeStatus::Online,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub node_id: String,
    pub status: NodeStatus,
    /// 滚动平均延迟（指数加权）
    pub avg_latency_ms: f64,
    /// 最近一次探测的时间（Unix 毫秒）
    pub last_probe_ms: Option<i64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
}

impl NodeHealth {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Online,
            avg_latency_ms: 0.0,
            last_probe_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

/// 把一次探测结果应用到节点状态上
///
/// 成功：更新平均延迟并上升一级（offline -> degraded -> online）。
/// 失败：连续失败达到 degraded_threshold 降为 degraded，达到 offline_threshold 降为 offline；失败从不让状态变好。
pub fn apply_probe_result(node: &mut NodeHealth, result: Result<Duration, String>, cfg: &HealthSection) {
    node.last_probe_ms = Some(chrono::Utc::now().timestamp_millis());
    match result {
        Ok(latency) => {
            let ms = latency.as_secs_f64() * 1000.0;
            node.avg_latency_ms = if node.consecutive_successes == 0 && node.avg_latency_ms == 0.0 {
                ms
            } else {
                LATENCY_EMA_ALPHA * ms + (1.0 - LATENCY_EMA_ALPHA) * node.avg_latency_ms
            };
            node.consecutive_failures = 0;
            node.consecutive_successes = node.consecutive_successes.saturating_add(1);
            node.last_error = None;
            node.status = node.status.promote();
        }
        Err(e) => {
            node.consecutive_successes = 0;
            node.consecutive_failures = node.consecutive_failures.saturating_add(1);
            node.last_error = Some(e);
            let computed = if node.consecutive_failures >= cfg.offline_threshold {
                NodeStatus::Offline
            } else if node.consecutive_failures >= cfg.degraded_threshold {
                NodeStatus::Degraded
            } else {
                NodeStatus::Online
            };
            node.status = node.status.max(computed);
        }
    }
}

pub struct HealthMonitor {
    cfg: HealthSection,
    probes: RwLock<HashMap<String, Arc<dyn NodeProbe>>>,
    table: RwLock<Arc<HashMap<String, NodeHealth>>>,
}

impl HealthMonitor {
    pub fn new(cfg: HealthSection) -> Self {
        Self {
            cfg,
            probes: RwLock::new(HashMap::new()),
            table: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// 注册节点；新节点初始为 online
    pub fn register(&self, node_id: &str, probe: Arc<dyn NodeProbe>) {
        self.probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node_id.to_string(), probe);
        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        if !guard.contains_key(node_id) {
            let mut next = HashMap::clone(&guard);
            next.insert(node_id.to_string(), NodeHealth::new(node_id));
            *guard = Arc::new(next);
        }
    }

    pub fn status(&self, node_id: &str) -> Option<NodeHealth> {
        self.snapshot().get(node_id).cloned()
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.snapshot().get(node_id).map(|n| n.status)
    }

    /// 当前节点表（只读快照，读者不会被更新阻塞）
    pub fn snapshot(&self) -> Arc<HashMap<String, NodeHealth>> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 并发探测所有节点一次，每个探测受 probe_timeout 限制
    pub async fn check_once(&self) {
        let probes: Vec<(String, Arc<dyn NodeProbe>)> = self
            .probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, p)| (id.clone(), Arc::clone(p)))
            .collect();
        if probes.is_empty() {
            return;
        }

        let limit = Duration::from_millis(self.cfg.probe_timeout_ms);
        let results = join_all(probes.into_iter().map(|(id, probe)| async move {
            let result = match tokio::time::timeout(limit, probe.probe(&id)).await {
                Ok(r) => r,
                Err(_) => Err(format!("probe timed out after {}ms", limit.as_millis())),
            };
            (id, result)
        }))
        .await;

        let mut guard = self.table.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::clone(&guard);
        for (id, result) in results {
            let node = next.entry(id.clone()).or_insert_with(|| NodeHealth::new(&id));
            let before = node.status;
            apply_probe_result(node, result, &self.cfg);
            if node.status != before {
                match node.status {
                    NodeStatus::Online => info!(node = %id, "node back online"),
                    status => warn!(
                        node = %id,
                        ?status,
                        failures = node.consecutive_failures,
                        error = node.last_error.as_deref().unwrap_or(""),
                        "node health changed"
                    ),
                }
            }
        }
        *guard = Arc::new(next);
    }

    /// 启动后台探测循环，token 取消后退出
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let every = Duration::from_secs(self.cfg.check_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => monitor.check_once().await,
                }
            }
            debug!("health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::probe::StaticProbe;

    fn cfg() -> HealthSection {
        HealthSection {
            degraded_threshold: 1,
            offline_threshold: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_failure_never_goes_offline() {
        let mut node = NodeHealth::new("n1");
        apply_probe_result(&mut node, Err("boom".into()), &cfg());
        assert_eq!(node.status, NodeStatus::Degraded);

        apply_probe_result(&mut node, Err("boom".into()), &cfg());
        assert_eq!(node.status, NodeStatus::Degraded);
        apply_probe_result(&mut node, Err("boom".into()), &cfg());
        assert_eq!(node.status, NodeStatus::Offline);
    }

    #[test]
    fn test_recovery_moves_one_level_per_success() {
        let mut node = NodeHealth::new("n1");
        for _ in 0..3 {
            apply_probe_result(&mut node, Err("down".into()), &cfg());
        }
        assert_eq!(node.status, NodeStatus::Offline);

        apply_probe_result(&mut node, Ok(Duration::from_millis(10)), &cfg());
        assert_eq!(node.status, NodeStatus::Degraded);
        assert_eq!(node.consecutive_failures, 0);
        apply_probe_result(&mut node, Ok(Duration::from_millis(20)), &cfg());
        assert_eq!(node.status, NodeStatus::Online);
        assert!((node.avg_latency_ms - 13.0).abs() < 1e-6);
    }

    #[test]
    fn test_higher_degraded_threshold_tolerates_blips() {
        let lenient = HealthSection {
            degraded_threshold: 2,
            offline_threshold: 4,
            ..Default::default()
        };
        let mut node = NodeHealth::new("n1");
        apply_probe_result(&mut node, Err("blip".into()), &lenient);
        assert_eq!(node.status, NodeStatus::Online);
        apply_probe_result(&mut node, Err("blip".into()), &lenient);
        assert_eq!(node.status, NodeStatus::Degraded);
    }

    #[tokio::test]
    async fn test_check_once_updates_table() {
        let monitor = HealthMonitor::new(cfg());
        let probe = Arc::new(StaticProbe::new(false, Duration::from_millis(5)));
        monitor.register("worker-1", probe.clone());
        assert_eq!(monitor.status_of("worker-1"), Some(NodeStatus::Online));

        let before = monitor.snapshot();
        monitor.check_once().await;
        assert_eq!(monitor.status_of("worker-1"), Some(NodeStatus::Degraded));
        // 旧快照不受影响
        assert_eq!(before["worker-1"].status, NodeStatus::Online);

        probe.set_healthy(true);
        monitor.check_once().await;
        assert_eq!(monitor.status_of("worker-1"), Some(NodeStatus::Online));
        assert!(monitor.status("missing").is_none());
    }

    struct HangingProbe;

    #[async_trait::async_trait]
    impl NodeProbe for HangingProbe {
        async fn probe(&self, _node_id: &str) -> Result<Duration, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Duration::ZERO)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let monitor = HealthMonitor::new(cfg());
        monitor.register("slow", Arc::new(HangingProbe));
        monitor.check_once().await;
        let node = monitor.status("slow").unwrap();
        assert_eq!(node.status, NodeStatus::Degraded);
        assert!(node.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_stops_on_cancel() {
        let monitor = Arc::new(HealthMonitor::new(cfg()));
        monitor.register("n", Arc::new(StaticProbe::new(false, Duration::ZERO)));
        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(monitor.status_of("n"), Some(NodeStatus::Offline));

        token.cancel();
        handle.await.unwrap();
    }
}
