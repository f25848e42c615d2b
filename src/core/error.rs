//! 编排错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 OrchestratorError 决定重试、降级为 partial 还是终止计划。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 规划与执行过程中可能出现的错误
///
/// 能力返回的 payload 与错误都会进入结构化结果，所以此类型可序列化、可克隆。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum OrchestratorError {
    /// 参数、引用或计划结构不合法（永不重试）
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// 单次调用超过截止时间（毫秒）
    #[error("Timed out after {0}ms")]
    TimedOut(u64),

    #[error("Transient failure: {0}")]
    TransientFailure(String),

    #[error("Cancelled")]
    Cancelled,

    /// 上游步骤未成功，本步骤被跳过
    #[error("Upstream failed: {0}")]
    UpstreamFailed(String),

    /// 能力报告了永久性错误
    #[error("Tool failed: {0}")]
    ToolFailed(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// 规划模型调用失败或输出无法解析
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 错误大类，决定重试与恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 可按退避重试
    Retryable,
    /// 立即上报，不重试
    Permanent,
    /// 取消：向上传播，不重试
    Cancelled,
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::TimedOut(_) | OrchestratorError::TransientFailure(_) => {
                ErrorClass::Retryable
            }
            OrchestratorError::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// 能力调用返回的类型化错误（调用方负责截止时间）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<CapabilityError> for OrchestratorError {
    fn from(e: CapabilityError) -> Self {
        match e {
            CapabilityError::Invalid(msg) => OrchestratorError::Validation(msg),
            CapabilityError::Transient(msg) => OrchestratorError::TransientFailure(msg),
            CapabilityError::Fatal(msg) => OrchestratorError::ToolFailed(msg),
        }
    }
}

/// 恢复引擎根据错误给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 非关键步骤失败：计划继续，最终状态为 partial
    Degrade,
    /// 终止当前计划
    Abort,
}
