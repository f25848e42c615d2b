//! 执行计划：类型、依赖图、构建器、参数引用与规划器

pub mod builder;
pub mod graph;
pub mod params;
pub mod planner;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::PlanGraph;
pub use planner::{parse_plan_output, PlanProposal, Planner, ProposedCall};
pub use types::{
    derive_status, CallId, Constraints, ExecutionPlan, ExecutionResult, PlanId, PlanStatus,
    ToolCall, ToolOutcome,
};
