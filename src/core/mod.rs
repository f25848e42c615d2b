//! 核心编排层：错误与恢复、重试、计划监管、运行调度、优雅关闭、编排器

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;

pub use builder::OrchestratorBuilder;
pub use error::{CapabilityError, ErrorClass, OrchestratorError, RecoveryAction};
pub use orchestrator::{Consultation, ExpertResponse, Orchestrator};
pub use recovery::RecoveryEngine;
pub use retry::{RetryOutcome, RetryPolicy, RetryStats};
pub use scheduler::RunScheduler;
pub use shutdown::{
    run_with_graceful_shutdown, LearningCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use supervisor::{PlanGuard, PlanSupervisor};
