//! 专家门控网络与 Top-K 路由
//!
//! 两层线性变换（中间 ReLU）为每个专家打分，加上按质量反馈学习的 bias，取分数最高的 K 个做 softmax 归一化；
//! 其余专家权重为 0、不被调用。随机扰动只在探索模式下出现。bias 的更新由学习引擎的批处理任务调用，从不发生在 route 内。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RouterSection;
use crate::core::OrchestratorError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("k must be at least 1")]
    InvalidK,
    #[error("no candidate experts")]
    NoCandidates,
    #[error("unknown expert: {0}")]
    UnknownExpert(String),
    #[error("context vector has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl From<RouterError> for OrchestratorError {
    fn from(e: RouterError) -> Self {
        OrchestratorError::Validation(e.to_string())
    }
}

/// 纯打分函数：x -> W2 · relu(W1 · x + b1) + b2，每个专家一个分数
#[derive(Debug, Clone)]
pub struct GatingNetwork {
    input_dim: usize,
    w1: Vec<Vec<f64>>,
    b1: Vec<f64>,
    w2: Vec<Vec<f64>>,
    b2: Vec<f64>,
}

impl GatingNetwork {
    /// Xavier 均匀初始化权重，bias 置 0；相同种子得到相同网络
    pub fn new(input_dim: usize, hidden_dim: usize, experts: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let w1 = xavier(&mut rng, hidden_dim, input_dim);
        let w2 = xavier(&mut rng, experts, hidden_dim);
        Self {
            input_dim,
            w1,
            b1: vec![0.0; hidden_dim],
            w2,
            b2: vec![0.0; experts],
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn forward(&self, x: &[f64]) -> Result<Vec<f64>, RouterError> {
        if x.len() != self.input_dim {
            return Err(RouterError::DimensionMismatch {
                expected: self.input_dim,
                got: x.len(),
            });
        }
        let hidden: Vec<f64> = self
            .w1
            .iter()
            .zip(&self.b1)
            .map(|(row, b)| (dot(row, x) + b).max(0.0))
            .collect();
        Ok(self
            .w2
            .iter()
            .zip(&self.b2)
            .map(|(row, b)| dot(row, &hidden) + b)
            .collect())
    }
}

fn xavier(rng: &mut StdRng, rows: usize, cols: usize) -> Vec<Vec<f64>> {
    let limit = (6.0 / (rows + cols).max(1) as f64).sqrt();
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.gen_range(-limit..=limit)).collect())
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// 路由候选：专家名、声明成本、是否位于 degraded 节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertCandidate {
    pub name: String,
    pub cost: f64,
    pub degraded: bool,
}

impl ExpertCandidate {
    pub fn new(name: impl Into<String>, cost: f64) -> Self {
        Self {
            name: name.into(),
            cost,
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertWeight {
    pub expert: String,
    pub weight: f64,
    pub score: f64,
}

/// 路由结果：全部候选按排名排列，未入选的权重为 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub weights: Vec<ExpertWeight>,
}

impl RouteDecision {
    /// 入选专家（权重 > 0），按权重从高到低
    pub fn selected(&self) -> Vec<&ExpertWeight> {
        self.weights.iter().filter(|w| w.weight > 0.0).collect()
    }

    pub fn weight_of(&self, expert: &str) -> f64 {
        self.weights
            .iter()
            .find(|w| w.expert == expert)
            .map(|w| w.weight)
            .unwrap_or(0.0)
    }
}

const MIN_WEIGHT: f64 = 1e-12;

/// 门控路由器：网络 + 学习到的 per-expert bias（写时复制）+ 使用计数
pub struct ExpertRouter {
    network: GatingNetwork,
    index: HashMap<String, usize>,
    biases: RwLock<Arc<HashMap<String, f64>>>,
    usage: Vec<AtomicU64>,
    exploration: AtomicBool,
    noise_scale: f64,
    degraded_penalty: f64,
    feedback_step: f64,
    max_bias: f64,
}

impl ExpertRouter {
    /// experts 按字母序固定输出顺序
    pub fn new(cfg: &RouterSection, experts: &[String]) -> Self {
        let mut names: Vec<String> = experts.to_vec();
        names.sort();
        names.dedup();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Self {
            network: GatingNetwork::new(cfg.input_dim, cfg.hidden_dim, names.len(), cfg.seed),
            index,
            biases: RwLock::new(Arc::new(HashMap::new())),
            usage: names.iter().map(|_| AtomicU64::new(0)).collect(),
            exploration: AtomicBool::new(cfg.exploration),
            noise_scale: cfg.noise_scale,
            degraded_penalty: cfg.degraded_penalty,
            feedback_step: cfg.feedback_step,
            max_bias: cfg.max_bias,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.network.input_dim()
    }

    pub fn knows(&self, expert: &str) -> bool {
        self.index.contains_key(expert)
    }

    pub fn experts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.index.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_exploration(&self, on: bool) {
        self.exploration.store(on, Ordering::Relaxed);
    }

    /// 对候选专家打分并选出 Top-K；k 大于候选数时全部入选
    pub fn route(
        &self,
        context: &[f64],
        candidates: &[ExpertCandidate],
        k: usize,
    ) -> Result<RouteDecision, RouterError> {
        if k == 0 {
            return Err(RouterError::InvalidK);
        }
        if candidates.is_empty() {
            return Err(RouterError::NoCandidates);
        }
        let raw = self.network.forward(context)?;
        let biases = self.bias_snapshot();
        let explore = self.exploration.load(Ordering::Relaxed);
        let mut rng = rand::thread_rng();

        let mut scored: Vec<(&ExpertCandidate, f64)> = Vec::with_capacity(candidates.len());
        for c in candidates {
            let idx = *self
                .index
                .get(&c.name)
                .ok_or_else(|| RouterError::UnknownExpert(c.name.clone()))?;
            let mut score = raw[idx] + biases.get(&c.name).copied().unwrap_or(0.0);
            if c.degraded {
                score -= self.degraded_penalty;
            }
            if explore && self.noise_scale > 0.0 {
                score += rng.gen_range(-1.0..=1.0) * self.noise_scale;
            }
            scored.push((c, score));
        }

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa)
                .then_with(|| a.cost.total_cmp(&b.cost))
                .then_with(|| a.name.cmp(&b.name))
        });

        let k = k.min(scored.len());
        let top_max = scored[0].1;
        let exps: Vec<f64> = scored[..k]
            .iter()
            .map(|(_, s)| (s - top_max).exp().max(MIN_WEIGHT))
            .collect();
        let total: f64 = exps.iter().sum();

        let weights = scored
            .iter()
            .enumerate()
            .map(|(i, (c, s))| ExpertWeight {
                expert: c.name.clone(),
                weight: if i < k { exps[i] / total } else { 0.0 },
                score: *s,
            })
            .collect();

        for (c, _) in &scored[..k] {
            if let Some(&idx) = self.index.get(&c.name) {
                self.usage[idx].fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(RouteDecision { weights })
    }

    /// 按质量反馈调整 bias：步长 (q - 0.5) · 2 · feedback_step，结果限制在 ±max_bias
    pub fn apply_feedback(&self, expert: &str, quality: f64) {
        if !self.knows(expert) || !quality.is_finite() {
            return;
        }
        let q = quality.clamp(0.0, 1.0);
        let step = (q - 0.5) * 2.0 * self.feedback_step;
        let mut guard = self.biases.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::clone(&guard);
        let entry = next.entry(expert.to_string()).or_insert(0.0);
        *entry = (*entry + step).clamp(-self.max_bias, self.max_bias);
        *guard = Arc::new(next);
    }

    pub fn bias(&self, expert: &str) -> f64 {
        self.bias_snapshot().get(expert).copied().unwrap_or(0.0)
    }

    /// 当前全部 bias 的拷贝，随学习快照一起持久化
    pub fn biases(&self) -> HashMap<String, f64> {
        HashMap::clone(&self.bias_snapshot())
    }

    /// 整体替换 bias（快照恢复）；未知专家与非有限值被忽略，其余限制在 ±max_bias
    pub fn load_biases(&self, biases: &HashMap<String, f64>) {
        let next: HashMap<String, f64> = biases
            .iter()
            .filter(|(name, b)| self.knows(name) && b.is_finite())
            .map(|(name, b)| (name.clone(), b.clamp(-self.max_bias, self.max_bias)))
            .collect();
        *self.biases.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
    }

    fn bias_snapshot(&self) -> Arc<HashMap<String, f64>> {
        self.biases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 每个专家被选中的次数
    pub fn usage_stats(&self) -> HashMap<String, u64> {
        self.index
            .iter()
            .map(|(name, &i)| (name.clone(), self.usage[i].load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(names: &[&str]) -> ExpertRouter {
        let cfg = RouterSection {
            input_dim: 8,
            hidden_dim: 6,
            ..Default::default()
        };
        let experts: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        ExpertRouter::new(&cfg, &experts)
    }

    fn candidates(names: &[&str]) -> Vec<ExpertCandidate> {
        names.iter().map(|n| ExpertCandidate::new(*n, 1.0)).collect()
    }

    fn ctx() -> Vec<f64> {
        vec![0.3, -0.2, 0.5, 0.1, 0.0, 0.7, -0.4, 0.2]
    }

    #[test]
    fn test_top_k_sparsity_and_sum() {
        let names = ["a", "b", "c", "d", "e"];
        let r = router(&names);
        let d = r.route(&ctx(), &candidates(&names), 2).unwrap();
        let nonzero: Vec<_> = d.weights.iter().filter(|w| w.weight > 0.0).collect();
        assert_eq!(nonzero.len(), 2);
        assert_eq!(d.weights.len(), 5);
        let sum: f64 = d.weights.iter().map(|w| w.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(d.selected().len(), 2);
    }

    #[test]
    fn test_k_larger_than_candidates_selects_all() {
        let names = ["a", "b"];
        let d = router(&names).route(&ctx(), &candidates(&names), 10).unwrap();
        assert!(d.weights.iter().all(|w| w.weight > 0.0));
        let sum: f64 = d.weights.iter().map(|w| w.weight).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_deterministic_without_exploration() {
        let names = ["a", "b", "c"];
        let r1 = router(&names);
        let r2 = router(&names);
        let d1 = r1.route(&ctx(), &candidates(&names), 2).unwrap();
        let d2 = r2.route(&ctx(), &candidates(&names), 2).unwrap();
        assert_eq!(d1, d2);
    }

    #[test]
    fn test_ties_broken_by_cost_then_name() {
        let r = router(&["alpha", "beta", "gamma"]);
        let zero = vec![0.0; 8];
        let cands = vec![
            ExpertCandidate::new("gamma", 1.0),
            ExpertCandidate::new("beta", 2.0),
            ExpertCandidate::new("alpha", 2.0),
        ];
        let d = r.route(&zero, &cands, 2).unwrap();
        let order: Vec<&str> = d.weights.iter().map(|w| w.expert.as_str()).collect();
        assert_eq!(order, vec!["gamma", "alpha", "beta"]);
        assert_eq!(d.weight_of("beta"), 0.0);
        assert!((d.weight_of("gamma") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_degraded_penalty_lowers_rank() {
        let r = router(&["a", "b"]);
        let zero = vec![0.0; 8];
        let mut cands = candidates(&["a", "b"]);
        cands[0].degraded = true;
        let d = r.route(&zero, &cands, 1).unwrap();
        assert_eq!(d.selected()[0].expert, "b");
    }

    #[test]
    fn test_feedback_is_bounded_and_shifts_ranking() {
        let r = router(&["a", "b"]);
        for _ in 0..1_000 {
            r.apply_feedback("b", 1.0);
        }
        assert!((r.bias("b") - 1.0).abs() < 1e-9);
        r.apply_feedback("a", 0.0);
        assert!(r.bias("a") < 0.0);
        let zero = vec![0.0; 8];
        let d = r.route(&zero, &candidates(&["a", "b"]), 1).unwrap();
        assert_eq!(d.selected()[0].expert, "b");
        assert_eq!(r.usage_stats()["b"], 1);
    }

    #[test]
    fn test_load_biases_replaces_and_clamps() {
        let r = router(&["a", "b"]);
        r.apply_feedback("a", 1.0);
        let saved = HashMap::from([
            ("b".to_string(), 5.0),
            ("ghost".to_string(), 0.3),
            ("a".to_string(), f64::NAN),
        ]);
        r.load_biases(&saved);
        assert_eq!(r.bias("a"), 0.0);
        assert!((r.bias("b") - 1.0).abs() < 1e-9);
        assert_eq!(r.biases().len(), 1);

        let copy = router(&["a", "b"]);
        copy.load_biases(&r.biases());
        let zero = vec![0.0; 8];
        let d = copy.route(&zero, &candidates(&["a", "b"]), 1).unwrap();
        assert_eq!(d.selected()[0].expert, "b");
    }

    #[test]
    fn test_exploration_perturbs_only_while_enabled() {
        let names = ["a", "b", "c"];
        let r = router(&names);
        let zero = vec![0.0; 8];
        let baseline = r.route(&zero, &candidates(&names), 2).unwrap();
        assert!(baseline.weights.iter().all(|w| w.score == 0.0));

        r.set_exploration(true);
        let noisy: Vec<RouteDecision> = (0..5)
            .map(|_| r.route(&zero, &candidates(&names), 2).unwrap())
            .collect();
        assert!(noisy
            .iter()
            .flat_map(|d| d.weights.iter())
            .any(|w| w.score != 0.0));
        for d in &noisy {
            let sum: f64 = d.weights.iter().map(|w| w.weight).sum();
            assert!((sum - 1.0).abs() < 1e-9);
            assert!(d.weights.iter().all(|w| w.score.abs() <= 0.1 + 1e-12));
        }

        r.set_exploration(false);
        let again = r.route(&zero, &candidates(&names), 2).unwrap();
        assert_eq!(again, baseline);
    }

    #[test]
    fn test_route_errors() {
        let r = router(&["a"]);
        assert_eq!(r.route(&ctx(), &candidates(&["a"]), 0), Err(RouterError::InvalidK));
        assert_eq!(
            r.route(&ctx(), &candidates(&["zz"]), 1),
            Err(RouterError::UnknownExpert("zz".into()))
        );
        assert!(matches!(
            r.route(&[1.0], &candidates(&["a"]), 1),
            Err(RouterError::DimensionMismatch { .. })
        ));
        assert_eq!(r.route(&ctx(), &[], 1), Err(RouterError::NoCandidates));
    }
}
