//! 学习统计：能力级指标、(上下文桶, 能力) 评分、工具组合统计与只读快照

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LearningSection;

/// 单个能力的累计指标（只增不减）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetrics {
    pub total_calls: u64,
    pub success_count: u64,
    pub cumulative_latency_ms: u64,
    pub cumulative_cost: f64,
    pub cumulative_quality: f64,
    pub quality_samples: u64,
}

impl ToolMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_calls as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.cumulative_latency_ms as f64 / self.total_calls as f64
        }
    }

    pub fn avg_cost(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.cumulative_cost / self.total_calls as f64
        }
    }

    /// 没有质量样本时返回 fallback
    pub fn avg_quality(&self, fallback: f64) -> f64 {
        if self.quality_samples == 0 {
            fallback
        } else {
            self.cumulative_quality / self.quality_samples as f64
        }
    }

    pub(crate) fn observe(&mut self, success: bool, latency_ms: u64, cost: f64, quality: Option<f64>) {
        self.total_calls += 1;
        if success {
            self.success_count += 1;
        }
        self.cumulative_latency_ms = self.cumulative_latency_ms.saturating_add(latency_ms);
        self.cumulative_cost += cost.max(0.0);
        if let Some(q) = quality {
            self.add_quality(q);
        }
    }

    pub(crate) fn add_quality(&mut self, q: f64) {
        self.cumulative_quality += q.clamp(0.0, 1.0);
        self.quality_samples += 1;
    }
}

/// 推荐打分权重
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub success: f64,
    pub quality: f64,
    pub cost: f64,
    pub default_quality: f64,
}

impl ScoreWeights {
    pub fn from_config(cfg: &LearningSection) -> Self {
        Self {
            success: cfg.success_weight,
            quality: cfg.quality_weight,
            cost: cfg.cost_weight,
            default_quality: cfg.default_quality,
        }
    }

    /// 综合分 = w_s·成功率 + w_q·平均质量 + w_c·1/(1+平均成本)
    pub fn composite(&self, metrics: &ToolMetrics) -> f64 {
        self.success * metrics.success_rate()
            + self.quality * metrics.avg_quality(self.default_quality)
            + self.cost / (1.0 + metrics.avg_cost())
    }
}

/// (上下文桶, 能力) 的运行评分；只由批处理任务更新
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextToolScore {
    pub metrics: ToolMetrics,
    pub score: f64,
}

impl ContextToolScore {
    pub(crate) fn refresh(&mut self, weights: &ScoreWeights) {
        self.score = weights.composite(&self.metrics);
    }
}

/// 计划级工具组合统计（按排序后的能力集合聚合）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComboStats {
    pub runs: u64,
    pub successes: u64,
    pub cumulative_cost: f64,
    pub cumulative_latency_ms: u64,
}

impl ComboStats {
    pub fn success_rate(&self) -> f64 {
        if self.runs == 0 {
            0.0
        } else {
            self.successes as f64 / self.runs as f64
        }
    }
}

/// 组合键：去重排序后的能力名，以 `+` 连接
pub fn combo_key(capabilities: &[String]) -> String {
    let mut names: Vec<&str> = capabilities.iter().map(|s| s.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    names.join("+")
}

/// 只读快照：批处理任务每次应用完一批后整体替换
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningSnapshot {
    pub metrics: HashMap<String, ToolMetrics>,
    /// 上下文桶 -> 能力 -> 评分
    pub context_scores: HashMap<String, HashMap<String, ContextToolScore>>,
    pub combos: HashMap<String, ComboStats>,
    /// 路由器按质量反馈学到的 per-expert bias
    #[serde(default)]
    pub router_biases: HashMap<String, f64>,
    /// 已应用的记录数
    pub records_applied: u64,
    pub version: u64,
}

impl LearningSnapshot {
    pub fn metrics_for(&self, capability: &str) -> Option<&ToolMetrics> {
        self.metrics.get(capability)
    }

    pub fn context_score(&self, bucket: &str, capability: &str) -> Option<&ContextToolScore> {
        self.context_scores.get(bucket).and_then(|m| m.get(capability))
    }
}

/// 上下文分桶：意图首个关键词 + 配置字段的取值
///
/// 例：intent="Summarize quarterly sales", context={"domain":"retail"} -> `summarize|domain=retail`
pub fn context_bucket(intent: &str, context: &Value, fields: &[String]) -> String {
    let keyword = intent
        .split(|c: char| !c.is_alphanumeric())
        .find(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .unwrap_or_else(|| "_".to_string());

    let mut bucket = keyword;
    for field in fields {
        let value = match context.get(field) {
            Some(Value::String(s)) => s.to_lowercase(),
            Some(Value::Null) | None => continue,
            Some(v) => v.to_string(),
        };
        bucket.push('|');
        bucket.push_str(field);
        bucket.push('=');
        bucket.push_str(&value);
    }
    bucket
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bucket_uses_keyword_and_fields() {
        let fields = vec!["domain".to_string(), "stage".to_string()];
        assert_eq!(
            context_bucket("Summarize quarterly sales", &json!({"domain": "Retail", "x": 1}), &fields),
            "summarize|domain=retail"
        );
        assert_eq!(context_bucket("", &json!({}), &fields), "_");
    }

    #[test]
    fn test_metrics_observe() {
        let mut m = ToolMetrics::default();
        m.observe(true, 100, 1.0, Some(0.8));
        m.observe(false, 300, 1.0, None);
        assert_eq!(m.total_calls, 2);
        assert_eq!(m.success_count, 1);
        assert!((m.success_rate() - 0.5).abs() < 1e-9);
        assert!((m.avg_latency_ms() - 200.0).abs() < 1e-9);
        assert!((m.avg_quality(0.5) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_composite_prefers_cheaper_and_better() {
        let w = ScoreWeights {
            success: 0.5,
            quality: 0.3,
            cost: 0.2,
            default_quality: 0.5,
        };
        let mut good = ToolMetrics::default();
        let mut bad = ToolMetrics::default();
        for _ in 0..5 {
            good.observe(true, 10, 0.1, Some(0.9));
            bad.observe(false, 10, 5.0, Some(0.2));
        }
        assert!(w.composite(&good) > w.composite(&bad));
    }

    #[test]
    fn test_combo_key_is_order_independent() {
        let a = combo_key(&["b".into(), "a".into(), "b".into()]);
        assert_eq!(a, "a+b");
    }
}
