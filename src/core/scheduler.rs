//! 运行调度：限制同时执行的计划数，以及单个计划内并行步骤数

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;

#[derive(Debug, Clone)]
pub struct RunScheduler {
    plan_slots: Arc<Semaphore>,
    max_concurrent_plans: usize,
    max_parallelism: usize,
}

impl RunScheduler {
    pub fn new(max_concurrent_plans: usize, max_parallelism: usize) -> Self {
        let max_concurrent_plans = max_concurrent_plans.max(1);
        Self {
            plan_slots: Arc::new(Semaphore::new(max_concurrent_plans)),
            max_concurrent_plans,
            max_parallelism: max_parallelism.max(1),
        }
    }

    /// 等待一个计划运行名额；等待期间取消返回 Cancelled
    pub async fn acquire_plan(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, OrchestratorError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
            permit = self.plan_slots.clone().acquire_owned() => {
                permit.map_err(|_| OrchestratorError::Cancelled)
            }
        }
    }

    /// 为一次计划运行创建步骤并发限制
    pub fn step_limiter(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.max_parallelism))
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    pub fn running_plans(&self) -> usize {
        self.max_concurrent_plans - self.plan_slots.available_permits()
    }
}

impl Default for RunScheduler {
    fn default() -> Self {
        Self::new(16, 4)
    }
}
