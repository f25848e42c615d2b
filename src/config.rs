//! 编排核心配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RETRY__MAX_RETRIES=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::OrchestratorError;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorSection,
    pub retry: RetrySection,
    pub router: RouterSection,
    pub learning: LearningSection,
    pub cache: CacheSection,
    pub health: HealthSection,
    pub llm: LlmSection,
}

/// [orchestrator] 段：并发、超时、候选数量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 单个计划内可并行步骤的上限
    pub max_parallelism: usize,
    /// 同时执行的计划数上限
    pub max_concurrent_plans: usize,
    /// 未声明超时的步骤使用的默认超时（毫秒）
    pub default_step_timeout_ms: u64,
    /// 学习引擎推荐的候选数量
    pub top_k: usize,
    /// 单个计划允许的最大步骤数（防止模型输出失控）
    pub max_plan_steps: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            max_concurrent_plans: 16,
            default_step_timeout_ms: 30_000,
            top_k: 8,
            max_plan_steps: 16,
        }
    }
}

impl OrchestratorSection {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}

/// [retry] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
        }
    }
}

/// [router] 段：门控网络结构与反馈步长
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 上下文向量维度
    pub input_dim: usize,
    pub hidden_dim: usize,
    /// 权重初始化种子（固定种子保证可重放）
    pub seed: u64,
    /// 探索模式：仅此模式下给分数加随机扰动
    pub exploration: bool,
    pub noise_scale: f64,
    /// 单次质量反馈对 bias 的最大调整量
    pub feedback_step: f64,
    /// bias 绝对值上限
    pub max_bias: f64,
    /// degraded 节点上的专家扣分
    pub degraded_penalty: f64,
    /// 参与门控路由的专家能力名
    pub experts: Vec<String>,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            input_dim: 32,
            hidden_dim: 16,
            seed: 42,
            exploration: false,
            noise_scale: 0.1,
            feedback_step: 0.05,
            max_bias: 1.0,
            degraded_penalty: 0.5,
            experts: Vec::new(),
        }
    }
}

/// [learning] 段：批处理与推荐打分
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningSection {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// 记录队列容量，满时丢弃并计数（记录方永不阻塞）
    pub queue_capacity: usize,
    pub min_sample_count_for_scoring: u64,
    pub success_weight: f64,
    pub quality_weight: f64,
    pub cost_weight: f64,
    /// 样本不足的能力使用的探索分
    pub cold_start_score: f64,
    /// 没有质量样本时使用的默认质量
    pub default_quality: f64,
    /// 参与上下文分桶的 context 字段
    pub bucket_fields: Vec<String>,
    /// 允许迟到质量修正的最近记录数
    pub amendment_window: usize,
    /// 学习快照目录（每键一个 JSON 文件）；为空时快照只保存在进程内
    pub snapshot_dir: String,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval_ms: 5_000,
            queue_capacity: 4_096,
            min_sample_count_for_scoring: 5,
            success_weight: 0.5,
            quality_weight: 0.3,
            cost_weight: 0.2,
            cold_start_score: 0.5,
            default_quality: 0.5,
            bucket_fields: vec!["domain".into(), "stage".into()],
            amendment_window: 1_024,
            snapshot_dir: "data/learning".to_string(),
        }
    }
}

impl LearningSection {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// [cache] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub default_ttl_secs: u64,
    /// 内存存储的最大条目数（LRU 淘汰）
    pub capacity: usize,
    /// 过期条目清扫间隔；0 表示不启动清扫（过期靠惰性判断）
    pub sweep_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            default_ttl_secs: 600,
            capacity: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheSection {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// [health] 段：探测周期与状态阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub check_interval_secs: u64,
    pub probe_timeout_ms: u64,
    /// 连续失败多少次 online -> degraded
    pub degraded_threshold: u32,
    /// 连续失败多少次 -> offline
    pub offline_threshold: u32,
    /// 通过 HTTP 健康检查探测的远端节点
    pub nodes: Vec<NodeEndpoint>,
}

/// [[health.nodes]] 条目
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NodeEndpoint {
    pub id: String,
    /// 健康检查地址，GET 返回 2xx 视为健康
    pub url: String,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            check_interval_secs: 15,
            probe_timeout_ms: 2_000,
            degraded_threshold: 1,
            offline_threshold: 3,
            nodes: Vec::new(),
        }
    }
}

/// [llm] 段：规划模型后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai（OpenAI 兼容端点）/ mock；未配置 OPENAI_API_KEY 时回退 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl AppConfig {
    /// 拒绝互相矛盾的配置值
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.health.offline_threshold <= self.health.degraded_threshold {
            return Err(OrchestratorError::Config(format!(
                "health.offline_threshold ({}) must be greater than degraded_threshold ({})",
                self.health.offline_threshold, self.health.degraded_threshold
            )));
        }
        if self.health.degraded_threshold == 0 {
            return Err(OrchestratorError::Config(
                "health.degraded_threshold must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.health.nodes {
            if node.id.is_empty() || node.url.is_empty() {
                return Err(OrchestratorError::Config(
                    "health.nodes entries need both id and url".to_string(),
                ));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(OrchestratorError::Config(format!(
                    "health node '{}' is declared twice",
                    node.id
                )));
            }
        }
        if self.retry.exponential_base < 1.0 {
            return Err(OrchestratorError::Config(
                "retry.exponential_base must be >= 1.0".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(OrchestratorError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.orchestrator.max_parallelism == 0 || self.orchestrator.max_concurrent_plans == 0 {
            return Err(OrchestratorError::Config(
                "orchestrator parallelism limits must be at least 1".to_string(),
            ));
        }
        if self.learning.batch_size == 0 || self.learning.queue_capacity == 0 {
            return Err(OrchestratorError::Config(
                "learning.batch_size and learning.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.router.input_dim == 0 || self.router.hidden_dim == 0 {
            return Err(OrchestratorError::Config(
                "router dimensions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("router.experts")
            .with_list_parse_key("learning.bucket_fields"),
    );

    builder.build()?.try_deserialize()
}
