//! 能力执行器
//!
//! 持有 ToolRegistry 与默认超时，invoke(name, params, timeout) 在截止时间内调用一次能力，
//! 超时或失败时转为 OrchestratorError（TimedOut / TransientFailure / ToolFailed ...）；
//! 每次调用输出结构化审计日志（JSON）。重试由上层的 RetryPolicy 驱动。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::OrchestratorError;
use crate::tools::{Capability, ToolRegistry};

/// 能力执行器：对每次调用施加超时，并将结果映射为 OrchestratorError
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    /// 调用的截止时长：显式值 > 能力声明 > 全局默认
    pub fn timeout_for(&self, name: &str, explicit_ms: Option<u64>) -> Duration {
        explicit_ms
            .or_else(|| self.registry.descriptor(name).and_then(|d| d.timeout_ms))
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    /// 执行一次能力调用；输出 JSON 审计日志
    pub async fn invoke(
        &self,
        name: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value, OrchestratorError> {
        let capability = self
            .registry
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownCapability(name.to_string()))?;

        let start = Instant::now();
        let preview = args_preview(&params);
        let result = timeout(limit, capability.invoke(params)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "capability_audit",
            "capability": name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "capability");

        match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(OrchestratorError::TimedOut(limit.as_millis() as u64)),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.registry.get(name)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CapabilityError;
    use crate::tools::EchoTool;
    use async_trait::async_trait;

    struct Sleepy;

    #[async_trait]
    impl Capability for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn invoke(&self, _params: Value) -> Result<Value, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        }
    }

    struct Broken;

    #[async_trait]
    impl Capability for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fatal"
        }
        async fn invoke(&self, _params: Value) -> Result<Value, CapabilityError> {
            Err(CapabilityError::Fatal("disk gone".into()))
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(Sleepy);
        registry.register(Broken);
        ToolExecutor::new(Arc::new(registry), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_invoke_echo() {
        let out = executor()
            .invoke("echo", serde_json::json!({"text": "hi"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["text"], "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_times_out() {
        let err = executor()
            .invoke("sleepy", Value::Null, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::TimedOut(50));
    }

    #[tokio::test]
    async fn test_fatal_maps_to_tool_failed() {
        let err = executor()
            .invoke("broken", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ToolFailed(_)));
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let err = executor()
            .invoke("ghost", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::UnknownCapability("ghost".into()));
    }

    #[test]
    fn test_timeout_precedence() {
        let ex = executor();
        assert_eq!(ex.timeout_for("echo", Some(5)), Duration::from_millis(5));
        assert_eq!(ex.timeout_for("echo", None), Duration::from_secs(1));
    }
}
