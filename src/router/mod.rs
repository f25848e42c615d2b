//! 专家门控路由：上下文编码 + 门控网络打分 + Top-K 稀疏选择

pub mod encoder;
pub mod gating;

pub use encoder::ContextEncoder;
pub use gating::{
    ExpertCandidate, ExpertRouter, ExpertWeight, GatingNetwork, RouteDecision, RouterError,
};
