//! Reliability graph over providers.
//!
//! Nodes are providers. A node's self-loop accumulates successes; a directed
//! edge `from -> to` counts how often the orchestrator fell back from `from`
//! to `to` within one logical request. Ranking runs power iteration over the
//! row-normalized transition matrix with uniform teleportation, so providers
//! that requests tend to end up at score higher.
//!
//! The graph is advisory: it can reorder candidates but never gates admission.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;

use crate::models::ProviderId;

/// Tuning for [`ReliabilityGraph::compute_ranks`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankConfig {
    /// Probability of jumping to a uniformly random node each step.
    pub teleport: f64,
    /// L1 change between iterations below which the vector has converged.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            teleport: 0.15,
            tolerance: 1e-9,
            max_iterations: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    self_weight: f64,
    visits: f64,
}

#[derive(Debug, Default)]
struct GraphInner {
    ids: Vec<ProviderId>,
    index: HashMap<ProviderId, usize>,
    nodes: Vec<Node>,
    edges: HashMap<(usize, usize), f64>,
}

impl GraphInner {
    fn node(&mut self, id: &ProviderId) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.ids.len();
        self.ids.push(id.clone());
        self.index.insert(id.clone(), idx);
        self.nodes.push(Node::default());
        idx
    }
}

/// Copy of the graph taken under the lock; ranking runs on this.
#[derive(Debug, Clone)]
struct GraphSnapshot {
    ids: Vec<ProviderId>,
    self_weights: Vec<f64>,
    edges: Vec<(usize, usize, f64)>,
}

/// Result of one ranking run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RankSnapshot {
    /// Score per provider; non-negative, summing to ~1 when non-empty.
    pub scores: BTreeMap<ProviderId, f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl RankSnapshot {
    pub fn score(&self, id: &ProviderId) -> f64 {
        self.scores.get(id).copied().unwrap_or(0.0)
    }
}

/// Edge and node weights for one provider, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NodeWeights {
    pub successes: f64,
    pub visits: f64,
}

/// Shared success/fallback graph, guarded by one coarse lock.
#[derive(Debug, Default)]
pub struct ReliabilityGraph {
    config: RankConfig,
    inner: Mutex<GraphInner>,
}

impl ReliabilityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RankConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(GraphInner::default()),
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, GraphInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned reliability graph mutex");
            poisoned.into_inner()
        })
    }

    /// Adds a node with no weight, so it takes part in ranking.
    pub fn register(&self, id: &ProviderId) {
        self.lock_inner().node(id);
    }

    pub fn record_success(&self, id: &ProviderId) {
        let mut inner = self.lock_inner();
        let idx = inner.node(id);
        let node = &mut inner.nodes[idx];
        node.self_weight += 1.0;
        node.visits += 1.0;
    }

    pub fn record_fallback(&self, from: &ProviderId, to: &ProviderId) {
        let mut inner = self.lock_inner();
        let from_idx = inner.node(from);
        let to_idx = inner.node(to);
        inner.nodes[from_idx].visits += 1.0;
        *inner.edges.entry((from_idx, to_idx)).or_insert(0.0) += 1.0;
    }

    /// Multiplies every weight by `factor` (clamped to `[0, 1]`).
    pub fn decay(&self, factor: f64) {
        let factor = factor.clamp(0.0, 1.0);
        let mut inner = self.lock_inner();
        for node in &mut inner.nodes {
            node.self_weight *= factor;
            node.visits *= factor;
        }
        for weight in inner.edges.values_mut() {
            *weight *= factor;
        }
    }

    pub fn edge_weight(&self, from: &ProviderId, to: &ProviderId) -> f64 {
        let inner = self.lock_inner();
        match (inner.index.get(from), inner.index.get(to)) {
            (Some(&f), Some(&t)) => inner.edges.get(&(f, t)).copied().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn node_weights(&self, id: &ProviderId) -> NodeWeights {
        let inner = self.lock_inner();
        inner
            .index
            .get(id)
            .map(|&idx| NodeWeights {
                successes: inner.nodes[idx].self_weight,
                visits: inner.nodes[idx].visits,
            })
            .unwrap_or_default()
    }

    fn snapshot(&self) -> GraphSnapshot {
        let inner = self.lock_inner();
        GraphSnapshot {
            ids: inner.ids.clone(),
            self_weights: inner.nodes.iter().map(|n| n.self_weight).collect(),
            edges: inner
                .edges
                .iter()
                .filter(|(_, w)| **w > 0.0)
                .map(|(&(f, t), &w)| (f, t, w))
                .collect(),
        }
    }

    /// Ranks every known provider. The lock is held only while copying.
    pub fn compute_ranks(&self) -> RankSnapshot {
        let snapshot = self.snapshot();
        power_iteration(&snapshot, &self.config)
    }
}

fn power_iteration(graph: &GraphSnapshot, config: &RankConfig) -> RankSnapshot {
    let n = graph.ids.len();
    if n == 0 {
        return RankSnapshot {
            scores: BTreeMap::new(),
            iterations: 0,
            converged: true,
        };
    }

    // Row-normalized adjacency, self-loops included.
    let mut out_weight: Vec<f64> = graph.self_weights.clone();
    for &(from, _, w) in &graph.edges {
        out_weight[from] += w;
    }
    let mut transitions: Vec<(usize, usize, f64)> = Vec::with_capacity(graph.edges.len() + n);
    for (i, &w) in graph.self_weights.iter().enumerate() {
        if w > 0.0 {
            transitions.push((i, i, w / out_weight[i]));
        }
    }
    for &(from, to, w) in &graph.edges {
        transitions.push((from, to, w / out_weight[from]));
    }
    let dangling: Vec<usize> = (0..n).filter(|&i| out_weight[i] <= 0.0).collect();

    let teleport = config.teleport.clamp(0.0, 1.0);
    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];
    let mut iterations = 0;
    let mut converged = false;

    while iterations < config.max_iterations {
        iterations += 1;

        let dangling_mass: f64 = dangling.iter().map(|&i| rank[i]).sum();
        let base = teleport * uniform + (1.0 - teleport) * dangling_mass * uniform;
        let mut next = vec![base; n];
        for &(from, to, p) in &transitions {
            next[to] += (1.0 - teleport) * rank[from] * p;
        }

        let total: f64 = next.iter().sum();
        if total > 0.0 {
            for v in &mut next {
                *v /= total;
            }
        }

        let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < config.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        tracing::debug!(iterations, "Rank iteration hit the cap before converging");
    }

    RankSnapshot {
        scores: graph.ids.iter().cloned().zip(rank).collect(),
        iterations,
        converged,
    }
}
