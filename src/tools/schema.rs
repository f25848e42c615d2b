//! 规划输出 JSON Schema 生成（schemars 自动生成）
//!
//! 用于将「合法计划」的 JSON 结构注入规划 prompt，减少模型输出格式错误。

use schemars::schema_for;

use crate::plan::PlanProposal;

/// 返回计划提案的 JSON Schema 字符串，可拼入 prompt
pub fn plan_format_schema_json() -> String {
    let schema = schema_for!(PlanProposal);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_tool_calls() {
        let s = plan_format_schema_json();
        assert!(s.contains("tool_calls"));
        assert!(s.contains("dependencies"));
    }
}
