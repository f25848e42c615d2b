//! Hive - 自适应工具编排核心
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + `HIVE__*` 环境变量）
//! - **core**: 错误与恢复、重试、计划监管与调度、优雅关闭、编排器
//! - **plan**: 执行计划类型、依赖图、参数引用、规划器
//! - **tools**: 能力注册表、执行器与内置演示能力
//! - **cache**: 键值存储抽象与内容寻址的结果缓存
//! - **router**: 上下文编码与专家门控路由
//! - **learning**: 执行记录批处理、能力评分与推荐
//! - **health**: 节点健康探测
//! - **llm**: 规划模型客户端（OpenAI 兼容 / Mock）

pub mod cache;
pub mod config;
pub mod core;
pub mod health;
pub mod learning;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod router;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorError};
