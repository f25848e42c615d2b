//! 错误恢复引擎
//!
//! should_retry 供重试循环判定；resolve 根据最终错误与步骤是否关键决定降级还是终止计划。

use crate::core::{ErrorClass, OrchestratorError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 重试循环的判定函数：仅超时与瞬时失败可重试
    pub fn should_retry(&self, err: &OrchestratorError) -> bool {
        err.class() == ErrorClass::Retryable
    }

    /// 步骤最终失败（重试已耗尽或不可重试）后的处理
    pub fn resolve(&self, err: &OrchestratorError, critical: bool) -> RecoveryAction {
        match err {
            OrchestratorError::Cancelled => RecoveryAction::Abort,
            OrchestratorError::BudgetExceeded(_) | OrchestratorError::Config(_) => {
                RecoveryAction::Abort
            }
            _ if critical => RecoveryAction::Abort,
            _ => RecoveryAction::Degrade,
        }
    }
}
