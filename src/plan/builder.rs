//! 计划构建器
//!
//! 提供流畅的 API 以编程方式构建执行计划（不经过规划模型）

use serde_json::Value;

use crate::core::OrchestratorError;
use crate::plan::graph::PlanGraph;
use crate::plan::types::*;

/// 计划构建器
pub struct PlanBuilder {
    id: PlanId,
    intent: String,
    context: Value,
    budget: Constraints,
    reasoning: String,
    calls: Vec<ToolCall>,
}

impl PlanBuilder {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            intent: intent.into(),
            context: Value::Object(Default::default()),
            budget: Constraints::default(),
            reasoning: String::new(),
            calls: Vec::new(),
        }
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn constraints(mut self, budget: Constraints) -> Self {
        self.budget = budget;
        self
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// 添加步骤（默认关键、可重试、串行）
    pub fn step(mut self, call_id: impl Into<CallId>, capability: impl Into<String>, params: Value) -> Self {
        self.calls.push(ToolCall::new(call_id, capability, params));
        self
    }

    pub fn call(mut self, call: ToolCall) -> Self {
        self.calls.push(call);
        self
    }

    /// 设置依赖（上游步骤结果可通过 `${id}` 引用）
    pub fn depends_on(self, call_id: &str, deps: &[&str]) -> Self {
        self.update(call_id, |c| {
            c.previous_results = deps.iter().map(|d| d.to_string()).collect()
        })
    }

    pub fn non_critical(self, call_id: &str) -> Self {
        self.update(call_id, |c| c.critical = false)
    }

    pub fn parallel(self, call_id: &str) -> Self {
        self.update(call_id, |c| c.parallel = true)
    }

    pub fn no_retry(self, call_id: &str) -> Self {
        self.update(call_id, |c| c.retry = false)
    }

    pub fn timeout_ms(self, call_id: &str, ms: u64) -> Self {
        self.update(call_id, |c| c.timeout_ms = Some(ms))
    }

    fn update(mut self, call_id: &str, f: impl FnOnce(&mut ToolCall)) -> Self {
        if let Some(call) = self.calls.iter_mut().find(|c| c.call_id == call_id) {
            f(call);
        }
        self
    }

    /// 构建计划；空计划与非法依赖会被拒绝
    pub fn build(self) -> Result<ExecutionPlan, OrchestratorError> {
        if self.intent.trim().is_empty() {
            return Err(OrchestratorError::Validation("intent is required".to_string()));
        }
        if self.calls.is_empty() {
            return Err(OrchestratorError::Validation("plan has no calls".to_string()));
        }
        PlanGraph::new(&self.calls)?;

        Ok(ExecutionPlan {
            id: self.id,
            intent: self.intent,
            context: self.context,
            calls: self.calls,
            budget: self.budget,
            estimated_cost: 0.0,
            estimated_latency_ms: 0,
            status: PlanStatus::Pending,
            reasoning: self.reasoning,
            shortlist: Vec::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_plan() {
        let plan = PlanBuilder::new("summarize")
            .step("a", "echo", serde_json::json!({"text": "x"}))
            .step("b", "text_stats", serde_json::json!({"text": "${a.text}"}))
            .depends_on("b", &["a"])
            .non_critical("b")
            .build()
            .unwrap();

        assert_eq!(plan.status, PlanStatus::Pending);
        assert_eq!(plan.calls.len(), 2);
        assert!(plan.id.starts_with("plan_"));
        let b = plan.call("b").unwrap();
        assert!(!b.critical);
        assert_eq!(b.previous_results, vec!["a".to_string()]);
    }

    #[test]
    fn test_build_without_calls_fails() {
        assert!(PlanBuilder::new("nothing").build().is_err());
    }

    #[test]
    fn test_build_with_cycle_fails() {
        let result = PlanBuilder::new("loop")
            .step("a", "echo", serde_json::json!({}))
            .step("b", "echo", serde_json::json!({}))
            .depends_on("a", &["b"])
            .depends_on("b", &["a"])
            .build();
        assert!(result.is_err());
    }
}
