//! 编排器构建器：统一的初始化逻辑
//!
//! 二进制、集成测试与嵌入方共用同一套装配：注册表、缓存、重试、路由、学习引擎、健康监控、规划器。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::{CacheManager, FileKvStore, InMemoryKvStore, KvStore};
use crate::config::AppConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::retry::RetryPolicy;
use crate::core::scheduler::RunScheduler;
use crate::core::supervisor::PlanSupervisor;
use crate::core::{OrchestratorError, RecoveryEngine};
use crate::health::{HealthMonitor, HttpProbe, NodeProbe};
use crate::learning::{JudgeMode, LearningEngine, QualityJudge};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::plan::Planner;
use crate::router::{ContextEncoder, ExpertRouter};
use crate::tools::{register_builtin, ToolExecutor, ToolRegistry};

pub struct OrchestratorBuilder {
    config: AppConfig,
    registry: Option<ToolRegistry>,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn KvStore>>,
    snapshot_store: Option<Arc<dyn KvStore>>,
    retry: Option<RetryPolicy>,
    judge: Option<(Arc<dyn QualityJudge>, JudgeMode)>,
    nodes: Vec<(String, Arc<dyn NodeProbe>)>,
    system_prompt: Option<String>,
    token: CancellationToken,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            llm: None,
            store: None,
            snapshot_store: None,
            retry: None,
            judge: None,
            nodes: Vec::new(),
            system_prompt: None,
            token: CancellationToken::new(),
        }
    }

    /// 不指定时使用内置演示能力
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 不指定时按 [llm] 配置创建
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 结果缓存使用的键值存储；不指定时使用内存 LRU
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 学习快照使用的键值存储；不指定时按 learning.snapshot_dir 使用文件存储
    pub fn with_snapshot_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// 覆盖按 [retry] 配置生成的重试策略
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn QualityJudge>, mode: JudgeMode) -> Self {
        self.judge = Some((judge, mode));
        self
    }

    /// 登记远端节点及其探测器；与 [[health.nodes]] 同名时覆盖配置中的 HTTP 探测
    pub fn with_node(mut self, node_id: impl Into<String>, probe: Arc<dyn NodeProbe>) -> Self {
        self.nodes.push((node_id.into(), probe));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 所有计划与后台任务都挂在这个 token 下（通常来自 ShutdownManager）
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// 校验配置并装配编排器；需要在 tokio 运行时内调用（会启动后台任务）
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        let cfg = self.config;
        cfg.validate()?;

        let registry = Arc::new(self.registry.unwrap_or_else(|| {
            let mut registry = ToolRegistry::new();
            register_builtin(&mut registry);
            registry
        }));
        if registry.is_empty() {
            return Err(OrchestratorError::Config("no capability registered".to_string()));
        }

        let experts = if cfg.router.experts.is_empty() {
            registry.names()
        } else {
            if let Some(unknown) = cfg.router.experts.iter().find(|e| !registry.contains(e)) {
                return Err(OrchestratorError::Config(format!(
                    "router expert '{}' is not a registered capability",
                    unknown
                )));
            }
            cfg.router.experts.clone()
        };
        let router = Arc::new(ExpertRouter::new(&cfg.router, &experts));
        let encoder = ContextEncoder::new(router.input_dim());

        let background = self.token.child_token();
        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => store,
            None => {
                let memory = Arc::new(InMemoryKvStore::new(cfg.cache.capacity));
                if cfg.cache.sweep_interval_secs > 0 {
                    memory.spawn_sweeper(
                        std::time::Duration::from_secs(cfg.cache.sweep_interval_secs),
                        background.clone(),
                    );
                }
                memory
            }
        };
        let cache = Arc::new(CacheManager::new(store, cfg.cache.default_ttl()));
        let snapshot_store: Arc<dyn KvStore> = match self.snapshot_store {
            Some(store) => store,
            None if cfg.learning.snapshot_dir.is_empty() => Arc::new(InMemoryKvStore::new(1)),
            None => Arc::new(FileKvStore::new(&cfg.learning.snapshot_dir)),
        };

        let learning = LearningEngine::start(
            cfg.learning.clone(),
            Some(Arc::clone(&router)),
            background.child_token(),
        );
        for name in registry.names() {
            if let Some(d) = registry.descriptor(&name) {
                learning.register_capability(&name, d.cost);
            }
        }

        let health = Arc::new(HealthMonitor::new(cfg.health.clone()));
        for node in &cfg.health.nodes {
            if self.nodes.iter().any(|(id, _)| *id == node.id) {
                continue;
            }
            health.register(&node.id, Arc::new(HttpProbe::new(node.url.clone())));
        }
        for (node_id, probe) in self.nodes.iter() {
            health.register(node_id, Arc::clone(probe));
        }
        let node_count = health.snapshot().len();
        if node_count > 0 {
            health.spawn(background.clone());
        }

        let llm = self.llm.unwrap_or_else(|| create_llm_from_config(&cfg));
        let mut planner = Planner::new(llm, Arc::clone(&registry), cfg.orchestrator.max_plan_steps);
        if let Some(prompt) = self.system_prompt {
            planner = planner.with_system_prompt(prompt);
        }

        tracing::info!(
            capabilities = registry.len(),
            experts = experts.len(),
            nodes = node_count,
            max_parallelism = cfg.orchestrator.max_parallelism,
            "orchestrator ready"
        );

        Ok(Orchestrator {
            executor: ToolExecutor::new(Arc::clone(&registry), cfg.orchestrator.default_step_timeout()),
            registry,
            cache,
            snapshot_store,
            retry: self.retry.unwrap_or_else(|| RetryPolicy::from_config(&cfg.retry)),
            recovery: RecoveryEngine::new(),
            router,
            encoder,
            learning,
            health,
            planner,
            judge: self.judge,
            supervisor: PlanSupervisor::new(self.token.child_token()),
            scheduler: RunScheduler::new(
                cfg.orchestrator.max_concurrent_plans,
                cfg.orchestrator.max_parallelism,
            ),
            cfg: cfg.orchestrator,
            background,
        })
    }
}
