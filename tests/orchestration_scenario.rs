//! 编排集成测试：缓存、重试、部分失败、取消、规划与专家会诊

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use hive::cache::{InMemoryKvStore, KvStore};
    use hive::config::AppConfig;
    use hive::core::{CapabilityError, OrchestratorBuilder, OrchestratorError, RetryPolicy};
    use hive::health::StaticProbe;
    use hive::learning::{JudgeMode, QualityJudge};
    use hive::llm::MockLlmClient;
    use hive::plan::{Constraints, PlanBuilder, PlanStatus, ToolCall, ToolOutcome};
    use hive::tools::{register_builtin, Capability, CapabilityDescriptor, ToolRegistry};
    use hive::Orchestrator;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Copy)]
    enum Behavior {
        Reply,
        Transient,
        Fatal,
        Hang,
        /// 等待给定毫秒后成功
        Slow(u64),
        /// 等待给定毫秒后以不可重试错误失败
        FatalAfter(u64),
    }

    struct ScriptedCapability {
        name: &'static str,
        behavior: Behavior,
        descriptor: CapabilityDescriptor,
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ScriptedCapability {
        fn new(name: &'static str, behavior: Behavior) -> Self {
            Self {
                name,
                behavior,
                descriptor: CapabilityDescriptor::default(),
                calls: Arc::new(AtomicUsize::new(0)),
                in_flight: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn on_node(mut self, node: &str) -> Self {
            self.descriptor.node = Some(node.to_string());
            self
        }
    }

    #[async_trait]
    impl Capability for ScriptedCapability {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "scripted capability"
        }

        fn descriptor(&self) -> CapabilityDescriptor {
            self.descriptor.clone()
        }

        async fn invoke(&self, params: Value) -> Result<Value, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = self.respond(params).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl ScriptedCapability {
        async fn respond(&self, params: Value) -> Result<Value, CapabilityError> {
            match self.behavior {
                Behavior::Reply => Ok(json!({ "from": self.name, "rows": 3, "input": params })),
                Behavior::Transient => Err(CapabilityError::Transient("upstream 503".to_string())),
                Behavior::Fatal => Err(CapabilityError::Fatal("bad credentials".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
                Behavior::Slow(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({ "from": self.name, "input": params }))
                }
                Behavior::FatalAfter(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Err(CapabilityError::Fatal("rollout rejected".to_string()))
                }
            }
        }
    }

    /// 固定分数的评审
    struct FixedJudge(f64);

    #[async_trait]
    impl QualityJudge for FixedJudge {
        async fn score(&self, _call: &ToolCall, _outcome: &ToolOutcome) -> Option<f64> {
            Some(self.0)
        }
    }

    fn quick_retries() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    fn orchestrator(registry: ToolRegistry) -> Orchestrator {
        OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_retry_policy(quick_retries())
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_critical_step_and_failing_optional_step() {
        let fetch = ScriptedCapability::new("fetch", Behavior::Reply);
        let summarize = ScriptedCapability::new("summarize", Behavior::Transient);
        let fetch_calls = fetch.calls.clone();
        let summarize_calls = summarize.calls.clone();
        let mut registry = ToolRegistry::new();
        registry.register(fetch);
        registry.register(summarize);
        let orch = orchestrator(registry);

        let plan = || {
            PlanBuilder::new("summarize sales")
                .step("a", "fetch", json!({ "table": "sales" }))
                .step("b", "summarize", json!({ "rows": "${a.rows}" }))
                .depends_on("b", &["a"])
                .non_critical("b")
                .build()
                .unwrap()
        };

        let first = orch.execute(plan()).await.unwrap();
        assert_eq!(first.status, PlanStatus::Partial);
        assert!(first.fatal_error.is_none());
        assert!(first.cached_calls().is_empty());
        let b = first.outcome("b").unwrap();
        assert!(matches!(b.error, Some(OrchestratorError::TransientFailure(_))));
        assert_eq!(b.attempts, 4);
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(summarize_calls.load(Ordering::SeqCst), 4);

        let second = orch.execute(plan()).await.unwrap();
        assert_eq!(second.status, PlanStatus::Partial);
        assert_eq!(second.cached_calls(), vec!["a"]);
        assert_eq!(second.retried_calls(), vec!["b"]);
        assert_eq!(second.outcome("a").unwrap().payload.as_ref().unwrap()["rows"], 3);
        assert_eq!(fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(summarize_calls.load(Ordering::SeqCst), 8);

        assert!(orch.learning().flush().await);
        let snapshot = orch.learning().snapshot();
        // 缓存命中不计入学习
        assert_eq!(snapshot.metrics_for("fetch").unwrap().total_calls, 1);
        let summarize_metrics = snapshot.metrics_for("summarize").unwrap();
        assert_eq!(summarize_metrics.total_calls, 2);
        assert_eq!(summarize_metrics.success_count, 0);
        assert_eq!(snapshot.combos["fetch+summarize"].runs, 2);

        let stats = orch.cache_stats();
        assert_eq!(stats.hits, 1);
        let retry = orch.retry_stats();
        assert_eq!(retry.executions, 3);
        assert_eq!(retry.retries, 6);
        assert_eq!(retry.failures, 2);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_critical_failure_halts_plan() {
        let broken = ScriptedCapability::new("deploy", Behavior::Fatal);
        let later = ScriptedCapability::new("notify", Behavior::Reply);
        let later_calls = later.calls.clone();
        let mut registry = ToolRegistry::new();
        registry.register(broken);
        registry.register(later);
        let orch = orchestrator(registry);

        let mut plan = PlanBuilder::new("deploy release")
            .step("deploy", "deploy", json!({}))
            .step("notify", "notify", json!({}))
            .build()
            .unwrap();
        plan.calls[0].priority = 10;

        let result = orch.execute(plan).await.unwrap();
        assert_eq!(result.status, PlanStatus::Failed);
        assert!(matches!(result.fatal_error, Some(OrchestratorError::ToolFailed(_))));
        assert_eq!(result.outcome("deploy").unwrap().attempts, 1);
        assert_eq!(result.skipped_calls(), vec!["notify"]);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_step() {
        let mut registry = ToolRegistry::new();
        registry.register(ScriptedCapability::new("slow", Behavior::Hang));
        let orch = orchestrator(registry);
        let plan = PlanBuilder::new("wait forever")
            .step("s", "slow", json!({}))
            .timeout_ms("s", 600_000)
            .build()
            .unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = orch.execute_with_cancel(plan, &token).await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.status, PlanStatus::Failed);
        assert_eq!(result.outcome("s").unwrap().error, Some(OrchestratorError::Cancelled));
        assert!(orch.active_plans().is_empty());
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retried_then_reported() {
        let mut registry = ToolRegistry::new();
        registry.register(ScriptedCapability::new("slow", Behavior::Hang));
        let orch = orchestrator(registry);
        let plan = PlanBuilder::new("slow call")
            .step("s", "slow", json!({}))
            .timeout_ms("s", 50)
            .non_critical("s")
            .build()
            .unwrap();

        let result = orch.execute(plan).await.unwrap();
        assert_eq!(result.status, PlanStatus::Partial);
        let outcome = result.outcome("s").unwrap();
        assert_eq!(outcome.error, Some(OrchestratorError::TimedOut(50)));
        assert_eq!(outcome.attempts, 4);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_planned_run_resolves_references() {
        let mut registry = ToolRegistry::new();
        register_builtin(&mut registry);
        let llm = MockLlmClient::with_responses([json!({
            "tool_calls": [
                { "call_id": "c1", "tool_name": "echo", "parameters": { "text": "hello world hello" } },
                { "call_id": "c2", "tool_name": "text_stats",
                  "parameters": { "text": "${c1.text}" }, "dependencies": ["c1"] }
            ],
            "reasoning": "echo then count"
        })
        .to_string()]);
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry)
            .with_llm(Arc::new(llm))
            .build()
            .unwrap();

        let result = orch
            .run("count words", json!({ "domain": "docs" }), Constraints::default())
            .await
            .unwrap();
        assert_eq!(result.status, PlanStatus::Succeeded);
        assert_eq!(result.plan.reasoning, "echo then count");
        assert!((result.plan.estimated_cost - 0.3).abs() < 1e-9);
        let stats = result.outcome("c2").unwrap().payload.clone().unwrap();
        assert_eq!(stats["words"], 3);
        assert_eq!(stats["top_words"][0]["word"], "hello");
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_plan_over_budget_is_rejected() {
        let mut registry = ToolRegistry::new();
        register_builtin(&mut registry);
        let llm = MockLlmClient::with_responses([json!({
            "tool_calls": [
                { "call_id": "c1", "tool_name": "echo", "parameters": { "text": "a" } },
                { "call_id": "c2", "tool_name": "text_stats", "parameters": { "text": "b" } }
            ],
            "reasoning": "too expensive"
        })
        .to_string()]);
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry)
            .with_llm(Arc::new(llm))
            .build()
            .unwrap();

        let err = orch
            .plan("count", json!({}), Constraints::default().with_max_cost(0.2))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::BudgetExceeded(_)));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_node_excluded_from_planning() {
        let mut registry = ToolRegistry::new();
        register_builtin(&mut registry);
        registry.register(ScriptedCapability::new("remote_search", Behavior::Reply).on_node("gpu-1"));
        let llm = MockLlmClient::with_responses([json!({
            "tool_calls": [{ "call_id": "c1", "tool_name": "remote_search", "parameters": {} }],
            "reasoning": "use the remote node"
        })
        .to_string()]);
        let probe = Arc::new(StaticProbe::new(false, Duration::ZERO));
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry)
            .with_llm(Arc::new(llm))
            .with_node("gpu-1", probe)
            .build()
            .unwrap();

        for _ in 0..3 {
            orch.health().check_once().await;
        }
        let shortlist = orch.shortlist("search", &json!({}), &Constraints::default());
        assert!(!shortlist.contains(&"remote_search".to_string()));

        let err = orch.plan("search", json!({}), Constraints::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_consult_experts_runs_only_top_k() {
        let a = ScriptedCapability::new("expert_a", Behavior::Reply);
        let b = ScriptedCapability::new("expert_b", Behavior::Reply);
        let c = ScriptedCapability::new("expert_c", Behavior::Reply);
        let counters = [a.calls.clone(), b.calls.clone(), c.calls.clone()];
        let mut registry = ToolRegistry::new();
        registry.register(a);
        registry.register(b);
        registry.register(c);
        let orch = orchestrator(registry);

        let consultation = orch
            .consult_experts("which region grew fastest", &json!({ "domain": "retail" }), 2)
            .await
            .unwrap();
        let selected = consultation.decision.selected();
        assert_eq!(selected.len(), 2);
        let sum: f64 = selected.iter().map(|w| w.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(consultation.responses.len(), 2);
        assert!(consultation.responses[0].weight >= consultation.responses[1].weight);

        let fused = consultation.fused.unwrap();
        assert_eq!(fused.expert, consultation.responses[0].expert);
        let invoked: usize = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
        assert_eq!(invoked, 2);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_steps_respect_limit_and_mark_upstream_failures() {
        let work = ScriptedCapability::new("work", Behavior::Slow(50));
        let work_calls = work.calls.clone();
        let peak = work.peak.clone();
        let mut registry = ToolRegistry::new();
        registry.register(work);
        registry.register(ScriptedCapability::new("validate", Behavior::Fatal));
        registry.register(ScriptedCapability::new("publish", Behavior::Reply));

        let mut cfg = AppConfig::default();
        cfg.orchestrator.max_parallelism = 2;
        let orch = OrchestratorBuilder::new(cfg)
            .with_registry(registry)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_retry_policy(quick_retries())
            .build()
            .unwrap();

        let mut builder = PlanBuilder::new("batch work");
        for i in 0..5 {
            let id = format!("p{}", i);
            builder = builder.step(id.clone(), "work", json!({ "shard": i })).parallel(&id);
        }
        let plan = builder
            .step("x", "validate", json!({}))
            .non_critical("x")
            .step("y", "publish", json!({}))
            .depends_on("y", &["x"])
            .non_critical("y")
            .build()
            .unwrap();

        let result = orch.execute(plan).await.unwrap();
        assert_eq!(result.status, PlanStatus::Partial);
        assert_eq!(work_calls.load(Ordering::SeqCst), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        for i in 0..5 {
            assert!(result.outcome(&format!("p{}", i)).unwrap().success);
        }
        assert!(matches!(
            result.outcome("x").unwrap().error,
            Some(OrchestratorError::ToolFailed(_))
        ));
        let y = result.outcome("y").unwrap();
        assert!(y.skipped);
        assert_eq!(y.error, Some(OrchestratorError::UpstreamFailed("x".to_string())));
        assert_eq!(result.skipped_calls(), vec!["y"]);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_parallel_failure_cancels_siblings() {
        let slow = ScriptedCapability::new("index", Behavior::Hang);
        let slow_calls = slow.calls.clone();
        let mut registry = ToolRegistry::new();
        registry.register(slow);
        registry.register(ScriptedCapability::new("deploy", Behavior::FatalAfter(20)));
        let orch = orchestrator(registry);

        let plan = PlanBuilder::new("deploy and index")
            .step("index", "index", json!({}))
            .parallel("index")
            .timeout_ms("index", 600_000)
            .step("deploy", "deploy", json!({}))
            .parallel("deploy")
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = orch.execute(plan).await.unwrap();
        assert_eq!(result.status, PlanStatus::Failed);
        assert!(!result.cancelled);
        assert!(matches!(result.fatal_error, Some(OrchestratorError::ToolFailed(_))));
        assert_eq!(slow_calls.load(Ordering::SeqCst), 1);
        let index = result.outcome("index").unwrap();
        assert_eq!(index.error, Some(OrchestratorError::Cancelled));
        assert_eq!(index.attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        orch.shutdown().await;
    }

    async fn learned_quality(orch: &Orchestrator, capability: &str) -> Option<f64> {
        for _ in 0..20 {
            orch.learning().flush().await;
            let snapshot = orch.learning().snapshot();
            if let Some(m) = snapshot.metrics_for(capability) {
                if m.quality_samples > 0 {
                    return Some(m.avg_quality(0.0));
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_inline_judge_scores_before_recording() {
        let mut registry = ToolRegistry::new();
        registry.register(ScriptedCapability::new("fetch", Behavior::Reply));
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_judge(Arc::new(FixedJudge(0.8)), JudgeMode::Inline)
            .build()
            .unwrap();

        let plan = PlanBuilder::new("fetch rows")
            .step("a", "fetch", json!({ "table": "orders" }))
            .build()
            .unwrap();
        let result = orch.execute(plan).await.unwrap();
        assert_eq!(result.outcome("a").unwrap().quality, Some(0.8));

        orch.learning().flush().await;
        let snapshot = orch.learning().snapshot();
        let metrics = snapshot.metrics_for("fetch").unwrap();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.quality_samples, 1);
        assert!((metrics.avg_quality(0.0) - 0.8).abs() < 1e-9);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_deferred_judge_amends_quality_later() {
        let mut registry = ToolRegistry::new();
        registry.register(ScriptedCapability::new("fetch", Behavior::Reply));
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .with_registry(registry)
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_judge(Arc::new(FixedJudge(0.3)), JudgeMode::Deferred)
            .build()
            .unwrap();

        let plan = PlanBuilder::new("fetch rows")
            .step("a", "fetch", json!({ "table": "orders" }))
            .build()
            .unwrap();
        let result = orch.execute(plan).await.unwrap();
        assert_eq!(result.outcome("a").unwrap().quality, None);

        let quality = learned_quality(&orch, "fetch").await.unwrap();
        assert!((quality - 0.3).abs() < 1e-9);
        let snapshot = orch.learning().snapshot();
        assert_eq!(snapshot.metrics_for("fetch").unwrap().total_calls, 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_learning_snapshot_survives_cache_traffic_and_restart() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut cfg = AppConfig::default();
        cfg.learning.snapshot_dir = temp_dir.path().join("learning").display().to_string();
        let cache_store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new(2));

        let registry = || {
            let mut registry = ToolRegistry::new();
            registry.register(ScriptedCapability::new("fetch", Behavior::Reply));
            registry
        };
        let plan = |table: usize| {
            PlanBuilder::new("fetch rows")
                .step("a", "fetch", json!({ "table": table }))
                .build()
                .unwrap()
        };

        let orch = OrchestratorBuilder::new(cfg.clone())
            .with_registry(registry())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_store(Arc::clone(&cache_store))
            .build()
            .unwrap();
        orch.execute(plan(0)).await.unwrap();
        orch.persist_learning().await.unwrap();
        for table in 1..5 {
            orch.execute(plan(table)).await.unwrap();
        }
        assert_eq!(orch.cache_stats().writes, 5);
        assert!(cache_store.get("hive:learning:snapshot").await.unwrap().is_none());
        orch.shutdown().await;

        let restarted = OrchestratorBuilder::new(cfg)
            .with_registry(registry())
            .with_llm(Arc::new(MockLlmClient::new()))
            .build()
            .unwrap();
        assert!(restarted.restore_learning().await.unwrap());
        let snapshot = restarted.learning().snapshot();
        assert_eq!(snapshot.metrics_for("fetch").unwrap().total_calls, 1);
        restarted.shutdown().await;
    }
}
