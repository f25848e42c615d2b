//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑分层（Kahn 算法），并计算关键路径声明延迟

use std::collections::{HashMap, HashSet};

use crate::core::OrchestratorError;
use crate::plan::types::{CallId, ToolCall};

/// 计划依赖图
#[derive(Debug, Clone)]
pub struct PlanGraph {
    /// 保留计划中的原始顺序
    order: Vec<CallId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    adjacency: HashMap<CallId, Vec<CallId>>,
    /// 入度表：步骤 ID -> 依赖数
    in_degree: HashMap<CallId, usize>,
    /// 拓扑分层；同层步骤互不依赖
    layers: Vec<Vec<CallId>>,
}

impl PlanGraph {
    /// 构建依赖图；重复 ID、未知依赖、自依赖与环都会被拒绝
    pub fn new(calls: &[ToolCall]) -> Result<Self, OrchestratorError> {
        let mut order = Vec::with_capacity(calls.len());
        let mut adjacency: HashMap<CallId, Vec<CallId>> = HashMap::new();
        let mut in_degree: HashMap<CallId, usize> = HashMap::new();

        for call in calls {
            if in_degree.insert(call.call_id.clone(), 0).is_some() {
                return Err(OrchestratorError::Validation(format!(
                    "duplicate call id '{}'",
                    call.call_id
                )));
            }
            adjacency.insert(call.call_id.clone(), Vec::new());
            order.push(call.call_id.clone());
        }

        for call in calls {
            let mut seen = HashSet::new();
            for dep in &call.previous_results {
                if dep == &call.call_id {
                    return Err(OrchestratorError::Validation(format!(
                        "call '{}' depends on itself",
                        call.call_id
                    )));
                }
                if !seen.insert(dep) {
                    continue;
                }
                let Some(dependents) = adjacency.get_mut(dep) else {
                    return Err(OrchestratorError::Validation(format!(
                        "call '{}' depends on unknown call '{}'",
                        call.call_id, dep
                    )));
                };
                dependents.push(call.call_id.clone());
                *in_degree.entry(call.call_id.clone()).or_insert(0) += 1;
            }
        }

        let layers = kahn_layers(&order, &adjacency, &in_degree)?;
        Ok(Self {
            order,
            adjacency,
            in_degree,
            layers,
        })
    }

    pub fn layers(&self) -> &[Vec<CallId>] {
        &self.layers
    }

    /// 直接依赖该步骤的步骤
    pub fn dependents(&self, call_id: &str) -> &[CallId] {
        self.adjacency
            .get(call_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn roots(&self) -> Vec<&CallId> {
        self.order
            .iter()
            .filter(|id| self.in_degree.get(*id).copied() == Some(0))
            .collect()
    }

    /// 关键路径上的声明延迟之和（最长路径）
    pub fn critical_path_latency(&self, calls: &[ToolCall], latency_of: impl Fn(&ToolCall) -> u64) -> u64 {
        let by_id: HashMap<&str, &ToolCall> =
            calls.iter().map(|c| (c.call_id.as_str(), c)).collect();
        let mut finish: HashMap<&str, u64> = HashMap::new();
        for layer in &self.layers {
            for id in layer {
                let Some(call) = by_id.get(id.as_str()) else {
                    continue;
                };
                let start = call
                    .previous_results
                    .iter()
                    .filter_map(|d| finish.get(d.as_str()))
                    .copied()
                    .max()
                    .unwrap_or(0);
                finish.insert(id.as_str(), start + latency_of(call));
            }
        }
        finish.values().copied().max().unwrap_or(0)
    }
}

fn kahn_layers(
    order: &[CallId],
    adjacency: &HashMap<CallId, Vec<CallId>>,
    in_degree: &HashMap<CallId, usize>,
) -> Result<Vec<Vec<CallId>>, OrchestratorError> {
    let mut remaining = in_degree.clone();
    let mut layers = Vec::new();
    let mut current: Vec<CallId> = order
        .iter()
        .filter(|id| remaining.get(*id).copied() == Some(0))
        .cloned()
        .collect();
    let mut visited = 0usize;

    while !current.is_empty() {
        visited += current.len();
        let mut ready: HashSet<CallId> = HashSet::new();
        for id in &current {
            for dependent in adjacency.get(id).into_iter().flatten() {
                if let Some(degree) = remaining.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.clone());
                    }
                }
            }
        }
        layers.push(current);
        current = order.iter().filter(|id| ready.contains(*id)).cloned().collect();
    }

    if visited != order.len() {
        let stuck: Vec<&str> = order
            .iter()
            .filter(|id| remaining.get(*id).copied().unwrap_or(0) > 0)
            .map(|s| s.as_str())
            .collect();
        return Err(OrchestratorError::Validation(format!(
            "cyclic dependency among calls: {}",
            stuck.join(", ")
        )));
    }
    Ok(layers)
}
