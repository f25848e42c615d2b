//! 计划监管：每个运行中的计划持有一个子 CancellationToken
//!
//! 计划级取消沿 token 传播到所有进行中的步骤与重试等待；根 token 取消时所有计划一起停止。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::plan::PlanId;

#[derive(Debug)]
pub struct PlanSupervisor {
    root: CancellationToken,
    active: Mutex<HashMap<PlanId, CancellationToken>>,
}

impl PlanSupervisor {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 登记一个计划运行；返回的 guard 在离开作用域时注销
    ///
    /// 计划 token 是 parent 的子 token；root 被取消时由 cancel_all 一并取消。
    pub fn register(&self, plan_id: &str, parent: &CancellationToken) -> PlanGuard<'_> {
        let token = parent.child_token();
        if self.root.is_cancelled() {
            token.cancel();
        }
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(plan_id.to_string(), token.clone());
        PlanGuard {
            supervisor: self,
            plan_id: plan_id.to_string(),
            token,
        }
    }

    /// 取消单个计划；计划不在运行时返回 false
    pub fn cancel(&self, plan_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(plan_id) {
            Some(token) => {
                info!(plan_id, "plan cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for token in active.values() {
            token.cancel();
        }
    }

    pub fn active_plans(&self) -> Vec<PlanId> {
        let mut ids: Vec<PlanId> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn finish(&self, plan_id: &str) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plan_id);
    }
}

impl Default for PlanSupervisor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

pub struct PlanGuard<'a> {
    supervisor: &'a PlanSupervisor,
    plan_id: PlanId,
    token: CancellationToken,
}

impl PlanGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PlanGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.finish(&self.plan_id);
    }
}
