//! 规划器：调用规划模型生成计划提案，并把不可信的提案校验为可执行的 ToolCall 列表
//!
//! 模型输出视为不可信：能力名、依赖、参数 schema、成本/延迟/风险都要对照注册表重新核对。

use std::collections::HashSet;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::llm::{LlmClient, Message};
use crate::plan::graph::PlanGraph;
use crate::plan::params;
use crate::plan::types::{Constraints, ExecutionPlan, ToolCall};
use crate::tools::{plan_format_schema_json, ToolRegistry};

/// 模型返回的计划提案：`{"tool_calls": [...], "reasoning": "..."}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct PlanProposal {
    /// 按执行顺序排列的能力调用
    #[serde(default)]
    pub tool_calls: Vec<ProposedCall>,
    /// 选择这些能力的理由
    #[serde(default)]
    pub reasoning: String,
}

/// 提案中的单步调用
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProposedCall {
    /// 计划内唯一 ID，如 c1、c2
    pub call_id: String,
    /// 能力名，必须来自可用能力列表
    #[serde(alias = "capability", alias = "tool")]
    pub tool_name: String,
    /// 参数；可用 "${c1.field}" 引用上游结果
    #[serde(default)]
    pub parameters: Value,
    /// 依赖的上游 call_id
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 数字越大越重要（仅作参考）
    #[serde(default)]
    pub priority: i32,
    /// 关键步骤失败会让整个计划失败
    #[serde(default = "default_true")]
    pub critical: bool,
    #[serde(default = "default_true")]
    pub retry: bool,
    /// 可与同层其他步骤并发执行
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// 解析模型输出：支持 ```json 代码块或正文中第一个 `{` 到最后一个 `}` 的 JSON
pub fn parse_plan_output(output: &str) -> Result<PlanProposal, OrchestratorError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let Some(start) = trimmed.find('{') {
        match trimmed.rfind('}') {
            Some(end) if end > start => &trimmed[start..=end],
            _ => trimmed,
        }
    } else {
        return Err(OrchestratorError::Planning(format!(
            "planner returned no JSON: {}",
            preview(trimmed)
        )));
    };

    serde_json::from_str(json_str)
        .map_err(|e| OrchestratorError::Planning(format!("{}: {}", e, preview(json_str))))
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are the planning step of a tool orchestration engine. \
Given an intent, a context and a list of available capabilities, produce the smallest set of \
capability calls that fulfils the intent. Prefer the recommended capabilities, but use any \
available capability when it fits better. Reply with a single JSON object only.";

/// Planner：持有规划模型、能力注册表与 system prompt
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    system_prompt: String,
    max_steps: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<ToolRegistry>, max_steps: usize) -> Self {
        Self {
            llm,
            registry,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 获取规划模型累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 拼装规划 prompt：system（输出格式）+ user（意图、上下文、推荐与可用能力、预算）
    pub fn build_prompt(
        &self,
        intent: &str,
        context: &Value,
        candidates: &[String],
        recommended: &[String],
        budget: &Constraints,
    ) -> Vec<Message> {
        let system = format!(
            "{}\n\nOutput format (JSON Schema):\n{}",
            self.system_prompt,
            plan_format_schema_json()
        );

        let mut user = format!(
            "Intent: {}\nContext: {}\n",
            intent,
            serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string())
        );
        if !recommended.is_empty() {
            user.push_str(&format!(
                "Recommended capabilities (best first): {}\n",
                recommended.join(", ")
            ));
        }
        if let Some(max_cost) = budget.max_cost {
            user.push_str(&format!("Total declared cost must not exceed {}\n", max_cost));
        }
        if let Some(max_latency) = budget.max_latency_ms {
            user.push_str(&format!("Critical path latency must not exceed {}ms\n", max_latency));
        }
        user.push_str(&format!(
            "Available capabilities:\n{}\n",
            self.registry.to_schema_json(candidates)
        ));
        user.push_str("Reply with JSON only: {\"tool_calls\": [{\"call_id\", \"tool_name\", \"parameters\", \"dependencies\", \"priority\"}], \"reasoning\": \"...\"}");

        vec![Message::system(system), Message::user(user)]
    }

    /// 调用规划模型并解析提案；模型失败或输出不可解析都是 Planning 错误
    pub async fn propose(
        &self,
        intent: &str,
        context: &Value,
        candidates: &[String],
        recommended: &[String],
        budget: &Constraints,
    ) -> Result<PlanProposal, OrchestratorError> {
        let messages = self.build_prompt(intent, context, candidates, recommended, budget);
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| OrchestratorError::Planning(format!("planner model failed: {}", e)))?;
        tracing::debug!(output_len = output.len(), "planner output received");
        parse_plan_output(&output)
    }

    /// 把提案校验为 ToolCall 列表
    ///
    /// unavailable 中的能力（托管在 offline 节点）会被拒绝。含引用的参数在执行时解析后再做 schema 校验。
    pub fn into_calls(
        &self,
        proposal: PlanProposal,
        unavailable: &HashSet<String>,
    ) -> Result<Vec<ToolCall>, OrchestratorError> {
        if proposal.tool_calls.is_empty() {
            return Err(OrchestratorError::Planning("plan contains no tool calls".to_string()));
        }

        let mut calls = Vec::with_capacity(proposal.tool_calls.len());
        for p in proposal.tool_calls {
            if p.call_id.trim().is_empty() {
                return Err(OrchestratorError::Validation("call_id must not be empty".to_string()));
            }
            if !self.registry.contains(&p.tool_name) {
                return Err(OrchestratorError::UnknownCapability(p.tool_name));
            }
            if unavailable.contains(&p.tool_name) {
                return Err(OrchestratorError::Validation(format!(
                    "capability '{}' is hosted on an offline node",
                    p.tool_name
                )));
            }

            let parameters = match p.parameters {
                Value::Null => Value::Object(Default::default()),
                v => v,
            };
            for reference in params::find_references(&parameters) {
                if !p.dependencies.contains(&reference.call_id) {
                    return Err(OrchestratorError::Validation(format!(
                        "call '{}' references '{}' without declaring it as a dependency",
                        p.call_id, reference.call_id
                    )));
                }
            }
            if !params::has_references(&parameters) {
                self.registry.validate_params(&p.tool_name, &parameters)?;
            }

            calls.push(ToolCall {
                call_id: p.call_id,
                capability: p.tool_name,
                parameters,
                timeout_ms: p.timeout_ms,
                retry: p.retry,
                critical: p.critical,
                parallel: p.parallel,
                previous_results: p.dependencies,
                priority: p.priority,
                outcome: None,
            });
        }
        Ok(calls)
    }

    /// 填充成本/延迟估计并检查约束：步骤数、依赖图、成本、关键路径延迟、风险等级
    pub fn check_plan(&self, plan: &mut ExecutionPlan) -> Result<(), OrchestratorError> {
        let max_steps = plan.budget.max_steps.unwrap_or(self.max_steps);
        if plan.calls.len() > max_steps {
            return Err(OrchestratorError::Validation(format!(
                "plan has {} calls, limit is {}",
                plan.calls.len(),
                max_steps
            )));
        }

        let mut cost = 0.0;
        for call in &plan.calls {
            let d = self
                .registry
                .descriptor(&call.capability)
                .ok_or_else(|| OrchestratorError::UnknownCapability(call.capability.clone()))?;
            cost += d.cost;
            if let Some(max_risk) = plan.budget.max_risk {
                if d.risk > max_risk {
                    return Err(OrchestratorError::BudgetExceeded(format!(
                        "capability '{}' risk {:?} exceeds allowed {:?}",
                        call.capability, d.risk, max_risk
                    )));
                }
            }
        }

        let graph = PlanGraph::new(&plan.calls)?;
        let latency = graph.critical_path_latency(&plan.calls, |c| {
            self.registry
                .descriptor(&c.capability)
                .map(|d| d.expected_latency_ms)
                .unwrap_or(0)
        });
        plan.estimated_cost = cost;
        plan.estimated_latency_ms = latency;

        if let Some(max_cost) = plan.budget.max_cost {
            if cost > max_cost + f64::EPSILON {
                return Err(OrchestratorError::BudgetExceeded(format!(
                    "declared cost {:.3} exceeds max_cost {:.3}",
                    cost, max_cost
                )));
            }
        }
        if let Some(max_latency) = plan.budget.max_latency_ms {
            if latency > max_latency {
                return Err(OrchestratorError::BudgetExceeded(format!(
                    "critical path latency {}ms exceeds max_latency {}ms",
                    latency, max_latency
                )));
            }
        }
        Ok(())
    }
}
