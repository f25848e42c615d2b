//! hive 命令行入口
//!
//! 用法：`hive [--config <path>] [--context <json>] [--max-cost <n>] <intent...>`
//! 规划并执行一个意图，以 JSON 输出结构化结果，然后优雅关闭。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use hive::config::load_config;
use hive::core::{LearningCleanup, OrchestratorBuilder, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use hive::plan::Constraints;

struct CliArgs {
    config: Option<PathBuf>,
    context: serde_json::Value,
    max_cost: Option<f64>,
    intent: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    let mut context = serde_json::json!({});
    let mut max_cost = None;
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "--context" => {
                let raw = args.next().context("--context needs a JSON object")?;
                context = serde_json::from_str(&raw).context("--context is not valid JSON")?;
            }
            "--max-cost" => {
                let raw = args.next().context("--max-cost needs a number")?;
                max_cost = Some(raw.parse().context("--max-cost is not a number")?);
            }
            _ => words.push(arg),
        }
    }
    if words.is_empty() {
        bail!("usage: hive [--config <path>] [--context <json>] [--max-cost <n>] <intent...>");
    }
    Ok(CliArgs {
        config,
        context,
        max_cost,
        intent: words.join(" "),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args = parse_args()?;
    let cfg = load_config(args.config).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let orchestrator = OrchestratorBuilder::new(cfg)
        .with_shutdown_token(shutdown.token())
        .build()
        .context("Failed to build orchestrator")?;
    match orchestrator.restore_learning().await {
        Ok(true) => tracing::info!("learning snapshot restored"),
        Ok(false) => {}
        Err(e) => tracing::warn!(error = %e, "learning snapshot not restored"),
    }

    let mut constraints = Constraints::default();
    if let Some(max_cost) = args.max_cost {
        constraints = constraints.with_max_cost(max_cost);
    }
    let outcome = orchestrator.run(&args.intent, args.context, constraints).await;
    let (prompt_tokens, completion_tokens, total_tokens) = orchestrator.token_usage();
    let retry = orchestrator.retry_stats();
    tracing::info!(
        prompt_tokens,
        completion_tokens,
        total_tokens,
        retries = retry.retries,
        retry_failures = retry.failures,
        "run finished"
    );

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(
        LearningCleanup::new(Arc::clone(orchestrator.learning()))
            .persist_to(Arc::clone(orchestrator.snapshot_store())),
    );
    coordinator.run_cleanup().await;
    orchestrator.shutdown().await;
    shutdown.shutdown(ShutdownReason::Completed);

    let result = outcome.context("Orchestration failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
