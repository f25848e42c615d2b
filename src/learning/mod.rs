//! 学习层：执行记录、能力评分、质量评审与推荐

pub mod engine;
pub mod judge;
pub mod stats;

pub use engine::{LearningEngine, LearningRecord, LearningStats, PlanSummary, Recommendation};
pub use judge::{HeuristicJudge, JudgeMode, QualityJudge};
pub use stats::{
    combo_key, context_bucket, ComboStats, ContextToolScore, LearningSnapshot, ScoreWeights,
    ToolMetrics,
};
