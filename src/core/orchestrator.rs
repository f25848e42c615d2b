//! 编排器：规划、按依赖执行、缓存与重试、学习反馈
//!
//! Plan：学习引擎给出候选短名单，路由权重排序，规划模型生成 ToolCall，再按注册表校验 schema、成本、延迟与风险。
//! Execute：按依赖分层推进；同层可并行步骤受 max_parallelism 限制并发。每步先查缓存，未命中时经 RetryPolicy
//! 调用，成功结果写缓存，结果（非缓存命中）异步写入学习引擎。关键步骤失败则停止计划，非关键步骤失败降级为 partial。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheManager, CacheStats, KvStore};
use crate::config::OrchestratorSection;
use crate::core::retry::{RetryOutcome, RetryPolicy, RetryStats};
use crate::core::scheduler::RunScheduler;
use crate::core::supervisor::PlanSupervisor;
use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine};
use crate::health::{HealthMonitor, NodeStatus};
use crate::learning::{JudgeMode, LearningEngine, PlanSummary, QualityJudge};
use crate::plan::{
    derive_status, params, CallId, Constraints, ExecutionPlan, ExecutionResult, PlanGraph,
    PlanId, PlanStatus, Planner, ToolCall, ToolOutcome,
};
use crate::router::{ContextEncoder, ExpertCandidate, ExpertRouter, RouteDecision};
use crate::tools::{ToolExecutor, ToolRegistry};

/// 单个专家的响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertResponse {
    pub expert: String,
    pub weight: f64,
    pub outcome: ToolOutcome,
}

/// 专家会诊结果：路由决策、所有入选专家的响应（按权重降序）与融合结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultation {
    pub decision: RouteDecision,
    pub responses: Vec<ExpertResponse>,
    /// 权重最高的成功响应
    pub fused: Option<ExpertResponse>,
}

pub struct Orchestrator {
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) executor: ToolExecutor,
    pub(crate) cache: Arc<CacheManager>,
    /// 学习快照存储，与结果缓存分开，不受 LRU 淘汰影响
    pub(crate) snapshot_store: Arc<dyn KvStore>,
    pub(crate) retry: RetryPolicy,
    pub(crate) recovery: RecoveryEngine,
    pub(crate) router: Arc<ExpertRouter>,
    pub(crate) encoder: ContextEncoder,
    pub(crate) learning: Arc<LearningEngine>,
    pub(crate) health: Arc<HealthMonitor>,
    pub(crate) planner: Planner,
    pub(crate) judge: Option<(Arc<dyn QualityJudge>, JudgeMode)>,
    pub(crate) supervisor: PlanSupervisor,
    pub(crate) scheduler: RunScheduler,
    pub(crate) cfg: OrchestratorSection,
    /// 健康探测、缓存清扫等后台任务的 token
    pub(crate) background: CancellationToken,
}

/// 一次计划运行中的可变状态
struct PlanRun {
    plan: ExecutionPlan,
    bucket: String,
    payloads: HashMap<CallId, Value>,
    fatal_error: Option<OrchestratorError>,
    halt: CancellationToken,
}

impl Orchestrator {
    /// 规划 + 执行
    pub async fn run(
        &self,
        intent: &str,
        context: Value,
        constraints: Constraints,
    ) -> Result<ExecutionResult, OrchestratorError> {
        let plan = self.plan(intent, context, constraints).await?;
        self.execute(plan).await
    }

    /// 根据意图、上下文与约束生成已校验的执行计划
    ///
    /// 超出 max_cost / max_latency / max_risk 的计划以 BudgetExceeded 拒绝，不做截断。
    pub async fn plan(
        &self,
        intent: &str,
        context: Value,
        constraints: Constraints,
    ) -> Result<ExecutionPlan, OrchestratorError> {
        if intent.trim().is_empty() {
            return Err(OrchestratorError::Validation("intent is required".to_string()));
        }
        let unavailable = self.unavailable_capabilities();
        let candidates: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|n| !unavailable.contains(n))
            .collect();
        if candidates.is_empty() {
            return Err(OrchestratorError::Planning(
                "no capability is currently available".to_string(),
            ));
        }
        let shortlist = self.shortlist(intent, &context, &constraints);
        debug!(?shortlist, offline = unavailable.len(), "planning candidates ready");

        let proposal = self
            .planner
            .propose(intent, &context, &candidates, &shortlist, &constraints)
            .await?;
        let reasoning = proposal.reasoning.clone();
        let calls = self.planner.into_calls(proposal, &unavailable)?;

        let mut plan = ExecutionPlan {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            intent: intent.to_string(),
            context,
            calls,
            budget: constraints,
            estimated_cost: 0.0,
            estimated_latency_ms: 0,
            status: PlanStatus::Pending,
            reasoning,
            shortlist,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.planner.check_plan(&mut plan) {
            warn!(plan_id = %plan.id, error = %e, "plan rejected");
            return Err(e);
        }
        info!(
            plan_id = %plan.id,
            steps = plan.calls.len(),
            estimated_cost = plan.estimated_cost,
            estimated_latency_ms = plan.estimated_latency_ms,
            "plan created"
        );
        Ok(plan)
    }

    /// 学习引擎推荐 + 路由权重排序后的候选短名单；degraded 节点上的能力排在最后
    pub fn shortlist(&self, intent: &str, context: &Value, constraints: &Constraints) -> Vec<String> {
        let unavailable = self.unavailable_capabilities();
        let recs: Vec<_> = self
            .learning
            .recommend(
                intent,
                context,
                constraints.max_cost,
                self.cfg.top_k + unavailable.len(),
            )
            .into_iter()
            .filter(|r| !unavailable.contains(&r.capability))
            .take(self.cfg.top_k)
            .collect();
        if recs.is_empty() {
            return Vec::new();
        }

        let candidates: Vec<ExpertCandidate> = recs
            .iter()
            .filter(|r| self.router.knows(&r.capability))
            .map(|r| self.expert_candidate(&r.capability))
            .collect();
        let weights: HashMap<String, f64> = if candidates.is_empty() {
            HashMap::new()
        } else {
            let features = self.encoder.encode(intent, context);
            match self.router.route(&features, &candidates, candidates.len()) {
                Ok(decision) => decision
                    .weights
                    .into_iter()
                    .map(|w| (w.expert, w.weight))
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "router failed, shortlist keeps learning order");
                    HashMap::new()
                }
            }
        };

        let mut ranked: Vec<(String, f64, bool)> = recs
            .into_iter()
            .map(|r| {
                let degraded = self.node_status(&r.capability) == Some(NodeStatus::Degraded);
                let weight = weights.get(&r.capability).copied().unwrap_or(0.0);
                (r.capability, r.score + weight, degraded)
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.2.cmp(&b.2)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.into_iter().map(|(name, _, _)| name).collect()
    }

    pub async fn execute(&self, plan: ExecutionPlan) -> Result<ExecutionResult, OrchestratorError> {
        let root = self.supervisor.root_token();
        self.execute_with_cancel(plan, &root).await
    }

    /// 执行计划；cancel 被取消时进行中的步骤与重试等待立即以 Cancelled 结束
    ///
    /// 只有计划本身不合法（非 pending、依赖图非法）或等待运行名额时被取消才返回 Err；
    /// 执行期错误体现在 ExecutionResult 的各步结果里。
    pub async fn execute_with_cancel(
        &self,
        mut plan: ExecutionPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, OrchestratorError> {
        if plan.status != PlanStatus::Pending {
            return Err(OrchestratorError::Validation(format!(
                "plan '{}' is {:?}, only pending plans can be executed",
                plan.id, plan.status
            )));
        }
        let graph = PlanGraph::new(&plan.calls)?;
        let _slot = self.scheduler.acquire_plan(cancel).await?;
        let guard = self.supervisor.register(&plan.id, cancel);
        let plan_token = guard.token().clone();
        let limiter = self.scheduler.step_limiter();
        let started = Instant::now();

        plan.status = PlanStatus::Running;
        info!(
            plan_id = %plan.id,
            steps = plan.calls.len(),
            layers = graph.layers().len(),
            "plan execution started"
        );

        let mut run = PlanRun {
            bucket: self.learning.bucket_for(&plan.intent, &plan.context),
            plan,
            payloads: HashMap::new(),
            fatal_error: None,
            halt: plan_token.child_token(),
        };

        for layer in graph.layers() {
            let mut ready: Vec<ToolCall> = Vec::new();
            for call_id in layer {
                let Some(call) = run.plan.call(call_id) else {
                    continue;
                };
                let blocked = call
                    .previous_results
                    .iter()
                    .find(|dep| !run.plan.call(dep).map(|c| c.succeeded()).unwrap_or(false))
                    .cloned();
                let skip = if run.halt.is_cancelled() {
                    Some(OrchestratorError::Cancelled)
                } else {
                    blocked.map(OrchestratorError::UpstreamFailed)
                };
                match skip {
                    Some(err) => {
                        debug!(call_id = %call_id, reason = %err, "step skipped");
                        self.settle(&mut run, call_id, ToolOutcome::skipped(err));
                    }
                    None => ready.push(call.clone()),
                }
            }
            // 同优先级保持计划中的顺序
            ready.sort_by(|a, b| b.priority.cmp(&a.priority));
            let (parallel, sequential): (Vec<ToolCall>, Vec<ToolCall>) =
                ready.into_iter().partition(|c| c.parallel);

            if !parallel.is_empty() {
                let finished: Vec<(CallId, ToolOutcome)> = {
                    let payloads = &run.payloads;
                    let context = &run.plan.context;
                    let halt = &run.halt;
                    parallel
                        .iter()
                        .map(|call| {
                            let limiter = Arc::clone(&limiter);
                            async move {
                                let outcome = match limiter.acquire_owned().await {
                                    Ok(_permit) if !halt.is_cancelled() => {
                                        self.run_call(call, payloads, context, halt).await
                                    }
                                    _ => ToolOutcome::skipped(OrchestratorError::Cancelled),
                                };
                                if !outcome.success && call.critical {
                                    halt.cancel();
                                }
                                (call.call_id.clone(), outcome)
                            }
                        })
                        .collect::<FuturesUnordered<_>>()
                        .collect()
                        .await
                };
                for (call_id, outcome) in finished {
                    self.settle(&mut run, &call_id, outcome);
                }
            }

            for call in sequential {
                let outcome = if run.halt.is_cancelled() {
                    ToolOutcome::skipped(OrchestratorError::Cancelled)
                } else {
                    self.run_call(&call, &run.payloads, &run.plan.context, &run.halt)
                        .await
                };
                self.settle(&mut run, &call.call_id, outcome);
            }
        }

        let PlanRun {
            mut plan,
            mut fatal_error,
            ..
        } = run;
        let status = derive_status(&plan.calls);
        plan.status = status;
        if status == PlanStatus::Failed && fatal_error.is_none() {
            fatal_error = plan
                .calls
                .iter()
                .filter(|c| c.critical && !c.succeeded())
                .find_map(|c| c.outcome.as_ref().and_then(|o| o.error.clone()));
        }
        let total_cost: f64 = plan
            .calls
            .iter()
            .filter_map(|c| c.outcome.as_ref())
            .map(|o| o.cost)
            .sum();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let cancelled = plan_token.is_cancelled();

        self.learning.record_plan(PlanSummary {
            capabilities: plan.calls.iter().map(|c| c.capability.clone()).collect(),
            success: status == PlanStatus::Succeeded,
            total_cost,
            latency_ms: elapsed_ms,
        });

        match status {
            PlanStatus::Succeeded => info!(plan_id = %plan.id, elapsed_ms, total_cost, "plan succeeded"),
            _ => warn!(
                plan_id = %plan.id,
                ?status,
                elapsed_ms,
                cancelled,
                error = fatal_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "plan finished without full success"
            ),
        }
        drop(guard);

        Ok(ExecutionResult {
            plan,
            status,
            fatal_error,
            total_cost,
            elapsed_ms,
            cancelled,
        })
    }

    /// 解析上游引用后执行一步
    async fn run_call(
        &self,
        call: &ToolCall,
        upstream: &HashMap<CallId, Value>,
        context: &Value,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let resolved = params::resolve(&call.parameters, upstream).and_then(|p| {
            if params::has_references(&call.parameters) {
                self.registry.validate_params(&call.capability, &p)?;
            }
            Ok(p)
        });
        match resolved {
            Ok(p) => self.run_step(call, p, context, cancel).await,
            Err(e) => {
                warn!(call_id = %call.call_id, error = %e, "step parameters rejected");
                ToolOutcome::failed(e, 0, 0.0, 0)
            }
        }
    }

    /// 单步执行：缓存 -> 带超时的重试调用 -> 写缓存
    ///
    /// 命中缓存时不调用能力；retry=false 的步骤只尝试一次。实际成本为声明成本乘以尝试次数。
    pub async fn run_step(
        &self,
        call: &ToolCall,
        params: Value,
        context: &Value,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let capability = call.capability.as_str();
        let Some(descriptor) = self.registry.descriptor(capability) else {
            return ToolOutcome::failed(
                OrchestratorError::UnknownCapability(capability.to_string()),
                0,
                0.0,
                0,
            );
        };
        if let Some(hit) = self.cache.get(capability, &descriptor, &params, context).await {
            debug!(call_id = %call.call_id, capability, "step served from cache");
            return hit;
        }

        let limit = self.executor.timeout_for(capability, call.timeout_ms);
        let max_retries = if call.retry { self.retry.max_retries } else { 0 };
        let started = Instant::now();
        let input = &params;
        let RetryOutcome { result, attempts } = self
            .retry
            .execute_with_retry(
                |_| self.executor.invoke(capability, input.clone(), limit),
                max_retries,
                |e| self.recovery.should_retry(e),
                cancel,
            )
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let cost = descriptor.cost * f64::from(attempts);

        match result {
            Ok(payload) => {
                let mut outcome = ToolOutcome::succeeded(payload, latency_ms, cost, attempts);
                if let Some((judge, JudgeMode::Inline)) = &self.judge {
                    outcome.quality = judge.score(call, &outcome).await;
                }
                self.cache
                    .set(capability, &descriptor, &params, context, &outcome, None)
                    .await;
                outcome
            }
            Err(e) => ToolOutcome::failed(e, latency_ms, cost, attempts),
        }
    }

    /// 把一步的最终结果写回计划，并决定是否停止后续步骤
    fn settle(&self, run: &mut PlanRun, call_id: &str, outcome: ToolOutcome) {
        let Some(call) = run.plan.call_mut(call_id) else {
            return;
        };
        if !outcome.cached && !outcome.skipped {
            self.record(call, &run.bucket, &outcome);
        }

        if outcome.success {
            if let Some(payload) = &outcome.payload {
                run.payloads.insert(call_id.to_string(), payload.clone());
            }
        } else if let Some(err) = &outcome.error {
            if call.critical {
                let replace = match &run.fatal_error {
                    None => true,
                    Some(OrchestratorError::Cancelled) => *err != OrchestratorError::Cancelled,
                    Some(_) => false,
                };
                if replace {
                    run.fatal_error = Some(err.clone());
                }
            }
            match self.recovery.resolve(err, call.critical) {
                RecoveryAction::Abort => {
                    if !run.halt.is_cancelled() {
                        warn!(call_id, capability = %call.capability, error = %err, "step failed, halting plan");
                    }
                    run.halt.cancel();
                }
                _ => {
                    if !outcome.skipped {
                        warn!(call_id, capability = %call.capability, error = %err, "non-critical step failed, plan degraded");
                    }
                }
            }
        }

        if let Err(e) = call.attach_outcome(outcome) {
            warn!(call_id, error = %e, "duplicate outcome ignored");
        }
    }

    /// 写入学习记录；Deferred 评审在后台打分后追加修正
    fn record(&self, call: &ToolCall, bucket: &str, outcome: &ToolOutcome) {
        let Some(record_id) = self.learning.record_outcome(call, bucket, outcome) else {
            return;
        };
        if let Some((judge, JudgeMode::Deferred)) = &self.judge {
            if outcome.success {
                let judge = Arc::clone(judge);
                let learning = Arc::clone(&self.learning);
                let call = call.clone();
                let outcome = outcome.clone();
                tokio::spawn(async move {
                    if let Some(q) = judge.score(&call, &outcome).await {
                        learning.amend_quality(record_id, q);
                    }
                });
            }
        }
    }

    /// 专家会诊：路由选出 Top-K 专家并行调用（同样经过缓存与重试），权重最高的成功响应作为融合结果
    pub async fn consult_experts(
        &self,
        query: &str,
        context: &Value,
        k: usize,
    ) -> Result<Consultation, OrchestratorError> {
        let unavailable = self.unavailable_capabilities();
        let candidates: Vec<ExpertCandidate> = self
            .router
            .experts()
            .into_iter()
            .filter(|e| self.registry.contains(e) && !unavailable.contains(e))
            .map(|e| self.expert_candidate(&e))
            .collect();
        let features = self.encoder.encode(query, context);
        let decision = self.router.route(&features, &candidates, k)?;

        let bucket = self.learning.bucket_for(query, context);
        let token = self.supervisor.root_token().child_token();
        let input = serde_json::json!({ "query": query, "context": context });
        let selected: Vec<(String, f64)> = decision
            .selected()
            .into_iter()
            .map(|w| (w.expert.clone(), w.weight))
            .collect();
        info!(query_len = query.len(), experts = ?selected, "consulting experts");

        let mut responses: Vec<ExpertResponse> = selected
            .into_iter()
            .map(|(expert, weight)| {
                let input = &input;
                let token = &token;
                let bucket = &bucket;
                async move {
                    let mut call = ToolCall::new(format!("expert:{}", expert), expert.clone(), input.clone());
                    call.critical = false;
                    let outcome = match self.registry.validate_params(&expert, input) {
                        Ok(()) => self.run_step(&call, input.clone(), context, token).await,
                        Err(e) => ToolOutcome::failed(e, 0, 0.0, 0),
                    };
                    if !outcome.cached {
                        self.record(&call, bucket, &outcome);
                    }
                    ExpertResponse {
                        expert,
                        weight,
                        outcome,
                    }
                }
            })
            .collect::<FuturesUnordered<_>>()
            .collect()
            .await;
        responses.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.expert.cmp(&b.expert))
        });
        let fused = responses.iter().find(|r| r.outcome.success).cloned();

        Ok(Consultation {
            decision,
            responses,
            fused,
        })
    }

    /// 取消运行中的计划
    pub fn cancel(&self, plan_id: &str) -> bool {
        self.supervisor.cancel(plan_id)
    }

    pub fn active_plans(&self) -> Vec<PlanId> {
        self.supervisor.active_plans()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn router(&self) -> &Arc<ExpertRouter> {
        &self.router
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }

    pub fn snapshot_store(&self) -> &Arc<dyn KvStore> {
        &self.snapshot_store
    }

    /// 规划模型累计 token 使用 (prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.planner.token_usage()
    }

    /// 从快照存储恢复学习统计与路由 bias
    pub async fn restore_learning(&self) -> Result<bool, CacheError> {
        self.learning.load_snapshot(self.snapshot_store.as_ref()).await
    }

    /// 排空学习队列后把当前快照写入快照存储
    pub async fn persist_learning(&self) -> Result<(), CacheError> {
        self.learning.flush().await;
        self.learning.persist(self.snapshot_store.as_ref()).await
    }

    /// 取消所有计划，排空学习队列，停止后台任务
    pub async fn shutdown(&self) {
        self.supervisor.cancel_all();
        self.learning.shutdown().await;
        self.background.cancel();
        info!("orchestrator stopped");
    }

    fn node_status(&self, capability: &str) -> Option<NodeStatus> {
        let node = self.registry.descriptor(capability)?.node?;
        self.health.status_of(&node)
    }

    /// 托管在 offline 节点上的能力
    fn unavailable_capabilities(&self) -> HashSet<String> {
        self.registry
            .names()
            .into_iter()
            .filter(|n| self.node_status(n) == Some(NodeStatus::Offline))
            .collect()
    }

    fn expert_candidate(&self, name: &str) -> ExpertCandidate {
        let cost = self
            .registry
            .descriptor(name)
            .map(|d| d.cost)
            .unwrap_or(1.0);
        let mut candidate = ExpertCandidate::new(name, cost);
        candidate.degraded = self.node_status(name) == Some(NodeStatus::Degraded);
        candidate
    }
}
