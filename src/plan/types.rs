//! 执行计划类型定义
//!
//! 计划、步骤（ToolCall）、步骤结果（ToolOutcome）、约束与执行结果

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::tools::RiskClass;

pub type PlanId = String;
pub type CallId = String;

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// 已生成，等待执行
    Pending,
    Running,
    /// 所有步骤成功
    Succeeded,
    /// 某个关键步骤未成功
    Failed,
    /// 关键步骤全部成功，但有非关键步骤未成功
    Partial,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Partial)
    }
}

/// 规划约束（调用方传入的预算等）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// 计划声明总成本上限
    pub max_cost: Option<f64>,
    /// 关键路径声明延迟上限（毫秒）
    pub max_latency_ms: Option<u64>,
    /// 允许的最高风险等级
    pub max_risk: Option<RiskClass>,
    /// 步骤数上限；None 时使用配置值
    pub max_steps: Option<usize>,
}

impl Constraints {
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn with_max_latency_ms(mut self, ms: u64) -> Self {
        self.max_latency_ms = Some(ms);
        self
    }

    pub fn with_max_risk(mut self, risk: RiskClass) -> Self {
        self.max_risk = Some(risk);
        self
    }
}

/// 单步调用结果；每次尝试一个，计划上只保留最终那次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub payload: Option<Value>,
    pub error: Option<OrchestratorError>,
    /// 墙钟耗时（毫秒），含重试等待
    pub latency_ms: u64,
    /// 实际成本：声明成本 × 尝试次数；缓存命中为 0
    pub cost: f64,
    /// 质量分 0-1，由评审器给出
    pub quality: Option<f64>,
    pub attempts: u32,
    pub cached: bool,
    /// 未执行（上游失败或计划被中止）
    pub skipped: bool,
}

impl ToolOutcome {
    pub fn succeeded(payload: Value, latency_ms: u64, cost: f64, attempts: u32) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
            latency_ms,
            cost,
            quality: None,
            attempts,
            cached: false,
            skipped: false,
        }
    }

    pub fn failed(error: OrchestratorError, latency_ms: u64, cost: f64, attempts: u32) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error),
            latency_ms,
            cost,
            quality: None,
            attempts,
            cached: false,
            skipped: false,
        }
    }

    pub fn from_cache(payload: Value) -> Self {
        Self {
            cached: true,
            ..Self::succeeded(payload, 0, 0.0, 0)
        }
    }

    pub fn skipped(error: OrchestratorError) -> Self {
        Self {
            skipped: true,
            ..Self::failed(error, 0, 0.0, 0)
        }
    }

    pub fn retried(&self) -> bool {
        self.attempts > 1
    }
}

/// 计划中的一步能力调用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: CallId,
    pub capability: String,
    /// 参数；字符串 `${call_id}` / `${call_id.field}` 在执行时替换为上游结果
    pub parameters: Value,
    /// 单次尝试超时；None 使用能力声明或全局默认
    pub timeout_ms: Option<u64>,
    pub retry: bool,
    /// 关键步骤失败则整个计划失败
    pub critical: bool,
    /// 可与同层其他步骤并发执行
    pub parallel: bool,
    /// 依赖的上游步骤（可读取其结果）
    pub previous_results: Vec<CallId>,
    pub priority: i32,
    pub outcome: Option<ToolOutcome>,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, capability: impl Into<String>, parameters: Value) -> Self {
        Self {
            call_id: call_id.into(),
            capability: capability.into(),
            parameters,
            timeout_ms: None,
            retry: true,
            critical: true,
            parallel: false,
            previous_results: Vec::new(),
            priority: 0,
            outcome: None,
        }
    }

    /// 附加最终结果；已有结果时拒绝覆盖
    pub fn attach_outcome(&mut self, outcome: ToolOutcome) -> Result<(), OrchestratorError> {
        if self.outcome.is_some() {
            return Err(OrchestratorError::Validation(format!(
                "call '{}' already has a terminal outcome",
                self.call_id
            )));
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().map(|o| o.success).unwrap_or(false)
    }
}

/// 执行计划：由 Planner 生成，Orchestrator 独占，进入终态后丢弃
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: PlanId,
    pub intent: String,
    pub context: Value,
    pub calls: Vec<ToolCall>,
    pub budget: Constraints,
    pub estimated_cost: f64,
    pub estimated_latency_ms: u64,
    pub status: PlanStatus,
    /// 规划模型给出的理由
    pub reasoning: String,
    /// 规划时使用的候选能力（已按路由权重排序）
    pub shortlist: Vec<String>,
    pub created_at: i64,
}

impl ExecutionPlan {
    pub fn call(&self, call_id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|c| c.call_id == call_id)
    }

    pub fn call_mut(&mut self, call_id: &str) -> Option<&mut ToolCall> {
        self.calls.iter_mut().find(|c| c.call_id == call_id)
    }
}

/// 由各步骤最终结果推导计划状态
///
/// 任一关键步骤未成功 => Failed；否则任一步骤未成功 => Partial；否则 Succeeded。
pub fn derive_status(calls: &[ToolCall]) -> PlanStatus {
    let critical_failed = calls.iter().any(|c| c.critical && !c.succeeded());
    if critical_failed {
        return PlanStatus::Failed;
    }
    if calls.iter().any(|c| !c.succeeded()) {
        PlanStatus::Partial
    } else {
        PlanStatus::Succeeded
    }
}

/// Execute 的结构化结果：每步的结果（缓存 / 重试 / 跳过）与计划级汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan: ExecutionPlan,
    pub status: PlanStatus,
    /// 第一个致命错误（导致 Failed 的关键步骤错误）
    pub fatal_error: Option<OrchestratorError>,
    pub total_cost: f64,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn plan_id(&self) -> &str {
        &self.plan.id
    }

    pub fn outcome(&self, call_id: &str) -> Option<&ToolOutcome> {
        self.plan.call(call_id).and_then(|c| c.outcome.as_ref())
    }

    pub fn cached_calls(&self) -> Vec<&str> {
        self.calls_where(|o| o.cached)
    }

    pub fn retried_calls(&self) -> Vec<&str> {
        self.calls_where(|o| o.retried())
    }

    pub fn skipped_calls(&self) -> Vec<&str> {
        self.calls_where(|o| o.skipped)
    }

    fn calls_where(&self, pred: impl Fn(&ToolOutcome) -> bool) -> Vec<&str> {
        self.plan
            .calls
            .iter()
            .filter(|c| c.outcome.as_ref().map(&pred).unwrap_or(false))
            .map(|c| c.call_id.as_str())
            .collect()
    }
}
