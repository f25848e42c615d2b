//! 优雅关闭
//!
//! 统一监听 Ctrl+C / SIGTERM，触发后：
//! - 取消运行中的计划（重试等待立即返回 Cancelled）
//! - 排空学习队列并持久化学习快照
//! - 停止健康探测与缓存清扫等后台任务

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::cache::KvStore;
use crate::learning::LearningEngine;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 主任务正常结束
    Completed,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭 token；计划运行与后台任务都挂在它下面
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，每个任务受超时限制
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务；返回成功完成的数量
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(tasks = self.cleanup_tasks.len(), "running cleanup tasks");
        let mut completed = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::info!(task = name, "cleanup completed");
                }
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(
                    task = name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "cleanup timed out"
                ),
            }
        }
        completed
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 学习引擎清理：排空队列、停止批处理任务，并可选地把快照写入键值存储
pub struct LearningCleanup {
    engine: Arc<LearningEngine>,
    store: Option<Arc<dyn KvStore>>,
}

impl LearningCleanup {
    pub fn new(engine: Arc<LearningEngine>) -> Self {
        Self { engine, store: None }
    }

    pub fn persist_to(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for LearningCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.engine.shutdown().await;
        if let Some(store) = &self.store {
            self.engine.persist(store.as_ref()).await?;
        }
        let dropped = self.engine.dropped_records();
        if dropped > 0 {
            tracing::warn!(dropped, "learning records were dropped during this run");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "LearningEngine"
    }
}

/// 运行主任务直到完成或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryKvStore;
    use crate::config::LearningSection;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        let mut reasons = manager.subscribe();
        assert!(!manager.is_shutdown());

        manager.shutdown(ShutdownReason::Signal);
        assert!(token.is_cancelled());
        assert_eq!(reasons.try_recv().unwrap(), ShutdownReason::Signal);
    }

    struct Flag(Arc<AtomicBool>);

    #[async_trait::async_trait]
    impl ShutdownCleanup for Flag {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Stuck"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinator_skips_stuck_task() {
        let manager = Arc::new(ShutdownManager::new());
        let mut coordinator = ShutdownCoordinator::new(manager).with_timeout(Duration::from_secs(1));
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Stuck);
        coordinator.register(Flag(called.clone()));

        assert_eq!(coordinator.run_cleanup().await, 1);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_learning_cleanup_persists_snapshot() {
        let engine = LearningEngine::start(LearningSection::default(), None, CancellationToken::new());
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(4));
        let call = crate::plan::ToolCall::new("a", "echo", serde_json::json!({}));
        let outcome = crate::plan::ToolOutcome::succeeded(serde_json::json!({}), 1, 0.1, 1);
        engine.record_outcome(&call, "b", &outcome);

        let cleanup = LearningCleanup::new(engine.clone()).persist_to(store.clone());
        cleanup.cleanup().await.unwrap();
        assert!(store.get("hive:learning:snapshot").await.unwrap().is_some());
        assert_eq!(engine.snapshot().metrics_for("echo").unwrap().total_calls, 1);
    }
}
