//! 能力注册表
//!
//! 所有能力实现 Capability trait（name / description / parameters_schema / descriptor / invoke），
//! 由 ToolRegistry 按名注册与查找；ToolExecutor 在调用时加超时并统一转 OrchestratorError。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{CapabilityError, OrchestratorError};

/// 风险等级（有序：Low < Medium < High），用于约束 max_risk
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    #[default]
    Low,
    Medium,
    High,
}

/// 结果易变程度，决定缓存 TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Volatility {
    /// 结果长期稳定：默认 TTL 的 4 倍
    Stable,
    #[default]
    Normal,
    /// 每次调用结果都可能不同：永不缓存
    Volatile,
}

/// 能力的声明信息：成本、延迟、风险、缓存相关字段与所在节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// 单次调用的声明成本
    pub cost: f64,
    pub expected_latency_ms: u64,
    pub risk: RiskClass,
    pub volatility: Volatility,
    /// 决定结果的参数字段；None 表示全部参数（除 volatile_fields）
    pub result_fields: Option<Vec<String>>,
    /// 不影响结果的参数（如 request_id），不参与缓存键
    pub volatile_fields: Vec<String>,
    /// 参与缓存键的上下文字段
    pub context_fields: Vec<String>,
    /// 托管节点；None 表示本地能力，不受健康状态影响
    pub node: Option<String>,
    /// 覆盖全局默认的单次调用超时
    pub timeout_ms: Option<u64>,
    /// 覆盖按 volatility 推导的缓存 TTL
    pub cache_ttl_secs: Option<u64>,
}

impl Default for CapabilityDescriptor {
    fn default() -> Self {
        Self {
            cost: 1.0,
            expected_latency_ms: 100,
            risk: RiskClass::Low,
            volatility: Volatility::Normal,
            result_fields: None,
            volatile_fields: Vec::new(),
            context_fields: Vec::new(),
            node: None,
            timeout_ms: None,
            cache_ttl_secs: None,
        }
    }
}

impl CapabilityDescriptor {
    /// 成功结果的缓存 TTL；None 表示不缓存
    pub fn cache_ttl(&self, default_ttl: Duration) -> Option<Duration> {
        if self.volatility == Volatility::Volatile {
            return None;
        }
        if let Some(secs) = self.cache_ttl_secs {
            return (secs > 0).then(|| Duration::from_secs(secs));
        }
        match self.volatility {
            Volatility::Stable => Some(default_ttl * 4),
            _ => Some(default_ttl),
        }
    }
}

/// 可调用能力：名称、描述（供规划模型理解）、参数 schema、声明信息、异步调用（参数为 JSON）
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限制参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::default()
    }

    /// 调用能力；截止时间由调用方负责
    async fn invoke(&self, params: Value) -> Result<Value, CapabilityError>;
}

/// 能力注册表：按名称存储 Arc<dyn Capability>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        self.register_arc(Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        if self.capabilities.insert(name.clone(), capability).is_some() {
            tracing::warn!(capability = %name, "capability re-registered, previous entry replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.capabilities.get(name).map(|c| c.descriptor())
    }

    /// 名称按字母序返回，保证 prompt 与推荐结果稳定
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// 用能力声明的 JSON Schema 校验参数
    pub fn validate_params(&self, name: &str, params: &Value) -> Result<(), OrchestratorError> {
        let capability = self
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownCapability(name.to_string()))?;
        let schema = capability.parameters_schema();
        let compiled = JSONSchema::compile(&schema).map_err(|e| {
            OrchestratorError::Validation(format!("capability '{}' has an invalid schema: {}", name, e))
        })?;
        let result = compiled.validate(params).map_err(|errors| {
            errors
                .map(|e| format!("{} at '{}'", e, e.instance_path))
                .collect::<Vec<_>>()
                .join("; ")
        });
        result.map_err(|msg| {
            OrchestratorError::Validation(format!("parameters for '{}' rejected: {}", name, msg))
        })
    }

    /// 生成候选能力的 schema JSON，拼入规划 prompt；names 为空时输出全部
    pub fn to_schema_json(&self, names: &[String]) -> String {
        let selected: Vec<String> = if names.is_empty() {
            self.names()
        } else {
            names.iter().filter(|n| self.contains(n)).cloned().collect()
        };
        let entries: Vec<Value> = selected
            .iter()
            .filter_map(|name| self.capabilities.get(name))
            .map(|cap| {
                let d = cap.descriptor();
                serde_json::json!({
                    "name": cap.name(),
                    "description": cap.description(),
                    "parameters": cap.parameters_schema(),
                    "cost": d.cost,
                    "expected_latency_ms": d.expected_latency_ms,
                    "risk": d.risk,
                })
            })
            .collect();
        serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_cache_ttl_by_volatility() {
        let base = Duration::from_secs(600);
        let mut d = CapabilityDescriptor::default();
        assert_eq!(d.cache_ttl(base), Some(base));
        d.volatility = Volatility::Stable;
        assert_eq!(d.cache_ttl(base), Some(Duration::from_secs(2400)));
        d.volatility = Volatility::Volatile;
        assert_eq!(d.cache_ttl(base), None);
        d.volatility = Volatility::Normal;
        d.cache_ttl_secs = Some(5);
        assert_eq!(d.cache_ttl(base), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_risk_ordering() {
        assert!(RiskClass::Low < RiskClass::Medium);
        assert!(RiskClass::Medium < RiskClass::High);
    }

    #[test]
    fn test_validate_params_against_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry
            .validate_params("echo", &serde_json::json!({"text": "hi"}))
            .is_ok());
        let err = registry
            .validate_params("echo", &serde_json::json!({"text": 5}))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(matches!(
            registry.validate_params("nope", &serde_json::json!({})),
            Err(OrchestratorError::UnknownCapability(_))
        ));
    }

    #[test]
    fn test_schema_json_lists_selected() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let json = registry.to_schema_json(&["echo".to_string(), "missing".to_string()]);
        assert!(json.contains("\"echo\""));
        assert!(!json.contains("missing"));
    }
}
