//! 质量评审：给成功结果打 0-1 分
//!
//! Inline 模式在记录前同步打分；Deferred 模式在后台打分，再通过学习引擎的 amend_quality 追加修正。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{ToolCall, ToolOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JudgeMode {
    #[default]
    Inline,
    Deferred,
}

#[async_trait]
pub trait QualityJudge: Send + Sync {
    /// 返回 [0, 1] 质量分；None 表示无法评价
    async fn score(&self, call: &ToolCall, outcome: &ToolOutcome) -> Option<f64>;
}

/// 启发式评审：看结果是否为空、是否一次成功、延迟是否超出预算
#[derive(Debug, Clone)]
pub struct HeuristicJudge {
    pub latency_budget_ms: u64,
}

impl Default for HeuristicJudge {
    fn default() -> Self {
        Self {
            latency_budget_ms: 5_000,
        }
    }
}

fn is_empty_payload(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[async_trait]
impl QualityJudge for HeuristicJudge {
    async fn score(&self, _call: &ToolCall, outcome: &ToolOutcome) -> Option<f64> {
        if !outcome.success {
            return Some(0.0);
        }
        let mut q = match &outcome.payload {
            Some(p) if !is_empty_payload(p) => 0.8,
            _ => 0.4,
        };
        if outcome.attempts <= 1 {
            q += 0.2;
        }
        if self.latency_budget_ms > 0 {
            let over = outcome.latency_ms as f64 / self.latency_budget_ms as f64;
            q -= (over.min(1.0)) * 0.2;
        }
        Some(q.clamp(0.0, 1.0))
    }
}
