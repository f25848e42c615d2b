//! 重试策略：指数退避 + 抖动
//!
//! 第 n 次重试前的等待 = min(base_delay · exponential_base^n, max_delay) × U[0.5, 1.0]。
//! 重试耗尽后原样返回最后一次错误；取消令牌在调用与等待期间都会立即生效。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetrySection;
use crate::core::OrchestratorError;

/// 延迟计算器与重试循环驱动；克隆体共享同一组统计计数
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// 关闭后延迟取上限值，便于确定性测试
    pub jitter: bool,
    counters: Arc<RetryCounters>,
}

#[derive(Debug, Default)]
struct RetryCounters {
    executions: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// 重试统计快照；比率以执行次数为分母
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetryStats {
    /// execute_with_retry 的调用次数
    pub executions: u64,
    /// 实际发起的尝试次数（含首次）
    pub attempts: u64,
    pub retries: u64,
    /// 最终以错误结束的执行（取消不计入）
    pub failures: u64,
    pub retry_rate: f64,
    pub failure_rate: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// 重试循环的结果：最终结果与实际尝试次数（≤ max_retries + 1）
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, OrchestratorError>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// 指数底数 2.0，带抖动
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            exponential_base: 2.0,
            jitter: true,
            counters: Arc::default(),
        }
    }

    /// 快速失败：2 次重试，0.5s 起步，上限 5s
    pub fn fast() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(5))
    }

    pub fn standard() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// 关键外部依赖：5 次重试，2s 起步，上限 60s
    pub fn persistent() -> Self {
        Self::new(5, Duration::from_secs(2), Duration::from_secs(60))
    }

    pub fn from_config(cfg: &RetrySection) -> Self {
        let mut policy = Self::new(
            cfg.max_retries,
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        );
        policy.exponential_base = cfg.exponential_base;
        policy
    }

    pub fn stats(&self) -> RetryStats {
        let executions = self.counters.executions.load(Ordering::Relaxed);
        let retries = self.counters.retries.load(Ordering::Relaxed);
        let failures = self.counters.failures.load(Ordering::Relaxed);
        let denom = executions.max(1) as f64;
        RetryStats {
            executions,
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries,
            failures,
            retry_rate: retries as f64 / denom,
            failure_rate: failures as f64 / denom,
        }
    }

    pub fn reset_stats(&self) {
        self.counters.executions.store(0, Ordering::Relaxed);
        self.counters.attempts.store(0, Ordering::Relaxed);
        self.counters.retries.store(0, Ordering::Relaxed);
        self.counters.failures.store(0, Ordering::Relaxed);
    }

    /// 第 attempt 次重试前等待的上界（未加抖动）
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// 实际等待时长：上界乘以 [0.5, 1.0] 的均匀随机因子，避免同时重试的惊群
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if !self.jitter {
            return ceiling;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        ceiling.mul_f64(factor)
    }

    /// 执行 op，失败且 should_retry 为真时退避后重试，最多 max_retries 次
    ///
    /// op 收到从 0 开始的尝试序号。取消时返回 `Cancelled`，attempts 为已发起的次数。
    pub async fn execute_with_retry<T, F, Fut, P>(
        &self,
        mut op: F,
        max_retries: u32,
        should_retry: P,
        cancel: &CancellationToken,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
        P: Fn(&OrchestratorError) -> bool,
    {
        self.counters.executions.fetch_add(1, Ordering::Relaxed);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(OrchestratorError::Cancelled),
                    attempts: attempt,
                };
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
                r = op(attempt) => r,
            };
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let err = match result {
                Ok(v) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "retry succeeded");
                    }
                    return RetryOutcome {
                        result: Ok(v),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if matches!(err, OrchestratorError::Cancelled) {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }
            if !should_retry(&err) {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let retries_done = attempt - 1;
            if retries_done >= max_retries {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(attempts = attempt, error = %err, "retries exhausted");
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(retries_done);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                attempt = attempt,
                max_retries = max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable failure, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(OrchestratorError::Cancelled),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
