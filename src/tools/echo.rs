//! Echo 能力（演示与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::core::CapabilityError;
use crate::tools::{Capability, CapabilityDescriptor, Volatility};

/// Echo 能力：原样回显文本
pub struct EchoTool;

#[async_trait]
impl Capability for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back. Params: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "text to echo" }
            },
            "required": ["text"]
        })
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            cost: 0.1,
            expected_latency_ms: 1,
            volatility: Volatility::Stable,
            ..Default::default()
        }
    }

    async fn invoke(&self, params: Value) -> Result<Value, CapabilityError> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CapabilityError::Invalid("missing 'text'".to_string()))?;
        Ok(serde_json::json!({ "text": text }))
    }
}
