//! 学习引擎：非阻塞记录 + 单写者批处理 + 快照读取
//!
//! 记录方只做 try_send，队列满时丢弃并计数，永不等待。后台批处理任务在攒满 batch_size 或
//! 距本批首条记录超过 flush_interval 时（先到者为准）应用整批，然后原子地发布新快照。
//! 指标与评分只由该任务修改；推荐查询只读快照。

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, KvStore};
use crate::config::LearningSection;
use crate::learning::stats::*;
use crate::plan::{ToolCall, ToolOutcome};
use crate::router::ExpertRouter;

const SNAPSHOT_KEY: &str = "hive:learning:snapshot";

/// 一条执行记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub record_id: u64,
    pub capability: String,
    pub bucket: String,
    pub success: bool,
    pub latency_ms: u64,
    pub cost: f64,
    pub quality: Option<f64>,
    pub timestamp_ms: i64,
}

/// 计划结束时的组合记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub capabilities: Vec<String>,
    pub success: bool,
    pub total_cost: f64,
    pub latency_ms: u64,
}

enum LearningEvent {
    Outcome(LearningRecord),
    Quality { record_id: u64, quality: f64 },
    PlanCompleted(PlanSummary),
    Restore(Box<LearningSnapshot>),
    Flush(oneshot::Sender<()>),
}

/// 推荐结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub capability: String,
    pub score: f64,
    /// false 表示样本不足，使用冷启动分
    pub scored: bool,
    pub total_calls: u64,
}

/// 运行统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningStats {
    pub records_applied: u64,
    pub dropped: u64,
    pub snapshot_version: u64,
    pub capabilities: usize,
}

/// 学习引擎句柄（可在多任务间共享）
pub struct LearningEngine {
    tx: mpsc::Sender<LearningEvent>,
    snapshot: Arc<RwLock<Arc<LearningSnapshot>>>,
    catalog: RwLock<HashMap<String, f64>>,
    dropped: AtomicU64,
    next_id: AtomicU64,
    cfg: LearningSection,
    weights: ScoreWeights,
    token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LearningEngine {
    /// 创建引擎并启动批处理任务；token 取消后任务排空队列再退出
    pub fn start(
        cfg: LearningSection,
        router: Option<Arc<ExpertRouter>>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let snapshot = Arc::new(RwLock::new(Arc::new(LearningSnapshot::default())));
        let weights = ScoreWeights::from_config(&cfg);

        let processor = BatchProcessor {
            state: LearningSnapshot::default(),
            recent: LruCache::new(
                NonZeroUsize::new(cfg.amendment_window).unwrap_or(NonZeroUsize::MIN),
            ),
            published: Arc::clone(&snapshot),
            router,
            weights,
            batch_size: cfg.batch_size.max(1),
            flush_interval: cfg.flush_interval(),
        };
        let worker = tokio::spawn(processor.run(rx, token.clone()));

        Arc::new(Self {
            tx,
            snapshot,
            catalog: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            cfg,
            weights,
            token,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// 把能力加入推荐目录（声明成本用于 max_cost 过滤）
    pub fn register_capability(&self, name: &str, declared_cost: f64) {
        self.catalog
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), declared_cost);
    }

    pub fn bucket_for(&self, intent: &str, context: &Value) -> String {
        context_bucket(intent, context, &self.cfg.bucket_fields)
    }

    /// 记录一次执行结果（不等待）；返回记录 ID，队列满或已关闭时返回 None
    pub fn record_outcome(&self, call: &ToolCall, bucket: &str, outcome: &ToolOutcome) -> Option<u64> {
        let record_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = LearningRecord {
            record_id,
            capability: call.capability.clone(),
            bucket: bucket.to_string(),
            success: outcome.success,
            latency_ms: outcome.latency_ms,
            cost: outcome.cost,
            quality: outcome.quality,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.offer(LearningEvent::Outcome(record)).then_some(record_id)
    }

    /// 迟到的质量分：修正已记录的结果，不计新调用
    pub fn amend_quality(&self, record_id: u64, quality: f64) -> bool {
        self.offer(LearningEvent::Quality { record_id, quality })
    }

    pub fn record_plan(&self, summary: PlanSummary) -> bool {
        self.offer(LearningEvent::PlanCompleted(summary))
    }

    fn offer(&self, event: LearningEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "learning queue full, record dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("learning engine stopped, record dropped");
                false
            }
        }
    }

    /// 立即应用队列中已有的记录并等待完成；引擎已停止时返回 false
    pub async fn flush(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LearningEvent::Flush(ack_tx)).await.is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }

    pub fn snapshot(&self) -> Arc<LearningSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> LearningStats {
        let snap = self.snapshot();
        LearningStats {
            records_applied: snap.records_applied,
            dropped: self.dropped_records(),
            snapshot_version: snap.version,
            capabilities: snap.metrics.len(),
        }
    }

    /// 推荐能力：按综合分排序，过滤声明成本超过 max_cost 的能力；样本不足者使用冷启动分
    ///
    /// 排序：分数降序，其次调用次数少者优先，最后按名称。
    pub fn recommend(
        &self,
        intent: &str,
        context: &Value,
        max_cost: Option<f64>,
        top_k: usize,
    ) -> Vec<Recommendation> {
        let snap = self.snapshot();
        let bucket = self.bucket_for(intent, context);
        let catalog = self
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let min_samples = self.cfg.min_sample_count_for_scoring;

        let mut recs: Vec<Recommendation> = catalog
            .iter()
            .filter(|(_, cost)| max_cost.map(|m| **cost <= m).unwrap_or(true))
            .map(|(name, _)| {
                let metrics = snap.metrics_for(name);
                let total_calls = metrics.map(|m| m.total_calls).unwrap_or(0);
                match metrics {
                    Some(m) if m.total_calls >= min_samples => {
                        let global = self.weights.composite(m);
                        let score = match snap.context_score(&bucket, name) {
                            Some(cs) if cs.metrics.total_calls >= min_samples => (global + cs.score) / 2.0,
                            _ => global,
                        };
                        Recommendation {
                            capability: name.clone(),
                            score,
                            scored: true,
                            total_calls,
                        }
                    }
                    _ => Recommendation {
                        capability: name.clone(),
                        score: self.cfg.cold_start_score,
                        scored: false,
                        total_calls,
                    },
                }
            })
            .collect();

        recs.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.total_calls.cmp(&b.total_calls))
                .then_with(|| a.capability.cmp(&b.capability))
        });
        recs.truncate(top_k);
        recs
    }

    /// 把当前快照以 JSON 写入键值存储
    pub async fn persist(&self, store: &dyn KvStore) -> Result<(), CacheError> {
        let snap = self.snapshot();
        let raw = serde_json::to_string(snap.as_ref())
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        store.set(SNAPSHOT_KEY, raw, None).await?;
        info!(version = snap.version, records = snap.records_applied, "learning snapshot persisted");
        Ok(())
    }

    /// 从键值存储恢复快照（交给批处理任务替换状态）；没有已存快照时返回 false
    pub async fn load_snapshot(&self, store: &dyn KvStore) -> Result<bool, CacheError> {
        let Some(raw) = store.get(SNAPSHOT_KEY).await? else {
            return Ok(false);
        };
        let snap: LearningSnapshot =
            serde_json::from_str(&raw).map_err(|e| CacheError::Serialization(e.to_string()))?;
        if self
            .tx
            .send(LearningEvent::Restore(Box::new(snap)))
            .await
            .is_err()
        {
            return Err(CacheError::Unavailable("learning engine stopped".to_string()));
        }
        Ok(self.flush().await)
    }

    /// 排空队列并停止批处理任务
    pub async fn shutdown(&self) {
        self.flush().await;
        self.token.cancel();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "learning worker join failed");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RecentRecord {
    has_quality: bool,
}

struct RecentEntry {
    capability: String,
    bucket: String,
    meta: RecentRecord,
}

/// 单写者批处理任务
struct BatchProcessor {
    state: LearningSnapshot,
    recent: LruCache<u64, RecentEntry>,
    published: Arc<RwLock<Arc<LearningSnapshot>>>,
    router: Option<Arc<ExpertRouter>>,
    weights: ScoreWeights,
    batch_size: usize,
    flush_interval: std::time::Duration,
}

enum Step {
    Event(LearningEvent),
    Deadline,
    Stop,
}

impl BatchProcessor {
    async fn run(mut self, mut rx: mpsc::Receiver<LearningEvent>, token: CancellationToken) {
        let mut batch: Vec<LearningEvent> = Vec::with_capacity(self.batch_size);
        let mut deadline: Option<Instant> = None;

        loop {
            let step = match deadline {
                Some(at) => tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Stop,
                    r = timeout_at(at, rx.recv()) => match r {
                        Ok(Some(ev)) => Step::Event(ev),
                        Ok(None) => Step::Stop,
                        Err(_) => Step::Deadline,
                    },
                },
                None => tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Stop,
                    ev = rx.recv() => match ev {
                        Some(ev) => Step::Event(ev),
                        None => Step::Stop,
                    },
                },
            };

            match step {
                Step::Event(LearningEvent::Flush(ack)) => {
                    self.apply(&mut batch);
                    deadline = None;
                    let _ = ack.send(());
                }
                Step::Event(ev) => {
                    if batch.is_empty() {
                        deadline = Some(Instant::now() + self.flush_interval);
                    }
                    batch.push(ev);
                    if batch.len() >= self.batch_size {
                        self.apply(&mut batch);
                        deadline = None;
                    }
                }
                Step::Deadline => {
                    self.apply(&mut batch);
                    deadline = None;
                }
                Step::Stop => break,
            }
        }

        // 已入队的记录在退出前仍然应用
        let mut acks = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            match ev {
                LearningEvent::Flush(ack) => acks.push(ack),
                ev => batch.push(ev),
            }
        }
        self.apply(&mut batch);
        for ack in acks {
            let _ = ack.send(());
        }
        debug!("learning batch processor stopped");
    }

    fn apply(&mut self, batch: &mut Vec<LearningEvent>) {
        if batch.is_empty() {
            return;
        }
        let size = batch.len();
        for ev in batch.drain(..) {
            match ev {
                LearningEvent::Outcome(r) => self.apply_record(r),
                LearningEvent::Quality { record_id, quality } => self.apply_amendment(record_id, quality),
                LearningEvent::PlanCompleted(summary) => {
                    let combo = self.state.combos.entry(combo_key(&summary.capabilities)).or_default();
                    combo.runs += 1;
                    if summary.success {
                        combo.successes += 1;
                    }
                    combo.cumulative_cost += summary.total_cost.max(0.0);
                    combo.cumulative_latency_ms = combo.cumulative_latency_ms.saturating_add(summary.latency_ms);
                }
                LearningEvent::Restore(snap) => {
                    let version = self.state.version;
                    self.state = *snap;
                    self.state.version = self.state.version.max(version);
                    self.recent.clear();
                    if let Some(router) = &self.router {
                        router.load_biases(&self.state.router_biases);
                    }
                }
                LearningEvent::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        if let Some(router) = &self.router {
            self.state.router_biases = router.biases();
        }
        self.state.version += 1;
        *self.published.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(self.state.clone());
        debug!(size, version = self.state.version, "learning batch applied");
    }

    fn apply_record(&mut self, r: LearningRecord) {
        let quality = r.quality.filter(|q| q.is_finite());
        self.state
            .metrics
            .entry(r.capability.clone())
            .or_default()
            .observe(r.success, r.latency_ms, r.cost, quality);

        let score = self
            .state
            .context_scores
            .entry(r.bucket.clone())
            .or_default()
            .entry(r.capability.clone())
            .or_default();
        score.metrics.observe(r.success, r.latency_ms, r.cost, quality);
        score.refresh(&self.weights);

        if let (Some(q), Some(router)) = (quality, &self.router) {
            router.apply_feedback(&r.capability, q);
        }
        self.state.records_applied += 1;
        self.recent.put(
            r.record_id,
            RecentEntry {
                capability: r.capability,
                bucket: r.bucket,
                meta: RecentRecord {
                    has_quality: quality.is_some(),
                },
            },
        );
    }

    /// 只补齐尚无质量分的记录；已评分或已滑出窗口的记录忽略
    fn apply_amendment(&mut self, record_id: u64, quality: f64) {
        if !quality.is_finite() {
            return;
        }
        let Some(entry) = self.recent.get_mut(&record_id) else {
            debug!(record_id, "quality amendment for unknown record ignored");
            return;
        };
        if entry.meta.has_quality {
            debug!(record_id, "record already scored, amendment ignored");
            return;
        }
        entry.meta.has_quality = true;
        let (capability, bucket) = (entry.capability.clone(), entry.bucket.clone());

        if let Some(m) = self.state.metrics.get_mut(&capability) {
            m.add_quality(quality);
        }
        if let Some(score) = self
            .state
            .context_scores
            .get_mut(&bucket)
            .and_then(|b| b.get_mut(&capability))
        {
            score.metrics.add_quality(quality);
            score.refresh(&self.weights);
        }
        if let Some(router) = &self.router {
            router.apply_feedback(&capability, quality);
        }
    }
}
