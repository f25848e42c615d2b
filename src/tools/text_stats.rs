//! 文本统计能力：字符数、词数、行数与最高频词

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::CapabilityError;
use crate::tools::{Capability, CapabilityDescriptor, Volatility};

pub struct TextStatsTool;

#[async_trait]
impl Capability for TextStatsTool {
    fn name(&self) -> &str {
        "text_stats"
    }

    fn description(&self) -> &str {
        "Count characters, words and lines of a text and list the most frequent words. Params: {\"text\": \"...\", \"top\": 3}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "top": { "type": "integer", "minimum": 0, "maximum": 50 }
            },
            "required": ["text"]
        })
    }

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            cost: 0.2,
            expected_latency_ms: 2,
            volatility: Volatility::Stable,
            result_fields: Some(vec!["text".into(), "top".into()]),
            ..Default::default()
        }
    }

    async fn invoke(&self, params: Value) -> Result<Value, CapabilityError> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CapabilityError::Invalid("missing 'text'".to_string()))?;
        let top = params.get("top").and_then(|v| v.as_u64()).unwrap_or(3) as usize;

        let mut freq: HashMap<String, usize> = HashMap::new();
        let mut words = 0usize;
        for w in text.split_whitespace() {
            words += 1;
            let w = w
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if !w.is_empty() {
                *freq.entry(w).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top);

        Ok(serde_json::json!({
            "chars": text.chars().count(),
            "words": words,
            "lines": text.lines().count(),
            "top_words": ranked
                .into_iter()
                .map(|(w, n)| serde_json::json!({ "word": w, "count": n }))
                .collect::<Vec<_>>(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_stats_counts() {
        let out = TextStatsTool
            .invoke(serde_json::json!({"text": "the cat and the hat\nThe end", "top": 1}))
            .await
            .unwrap();
        assert_eq!(out["words"], 7);
        assert_eq!(out["lines"], 2);
        assert_eq!(out["top_words"][0]["word"], "the");
        assert_eq!(out["top_words"][0]["count"], 3);
    }
}
