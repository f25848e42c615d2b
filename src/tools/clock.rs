//! Clock 能力：返回当前时间（结果每次不同，不缓存）

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::core::CapabilityError;
use crate::tools::{Capability, CapabilityDescriptor, Volatility};

pub struct ClockTool;

#[async_trait]
impl Capability for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Current UTC time. Params: {\"format\": \"rfc3339\" | \"unix\"} (optional)"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": { "type": "string", "enum": ["rfc3339", "unix"] }
            },
            "required": []
        })
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            cost: 0.05,
            expected_latency_ms: 1,
            volatility: Volatility::Volatile,
            ..Default::default()
        }
    }

    async fn invoke(&self, params: Value) -> Result<Value, CapabilityError> {
        let now = Utc::now();
        match params.get("format").and_then(|v| v.as_str()).unwrap_or("rfc3339") {
            "unix" => Ok(serde_json::json!({ "now": now.timestamp() })),
            "rfc3339" => Ok(serde_json::json!({
                "now": now.to_rfc3339_opts(SecondsFormat::Secs, true)
            })),
            other => Err(CapabilityError::Invalid(format!("unknown format '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_formats() {
        let out = ClockTool.invoke(serde_json::json!({"format": "unix"})).await.unwrap();
        assert!(out["now"].as_i64().unwrap() > 1_600_000_000);
        let out = ClockTool.invoke(serde_json::json!({})).await.unwrap();
        assert!(out["now"].as_str().unwrap().ends_with('Z'));
        assert!(ClockTool
            .invoke(serde_json::json!({"format": "julian"}))
            .await
            .is_err());
    }
}
