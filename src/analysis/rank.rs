//! Link-based page importance (PageRank by power iteration).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::RankConfig;
use crate::content::NodeId;
use crate::graph::GraphQuery;

use super::{AnalysisWarning, IndexedGraph};

/// Rank score per node. Scores sum to 1.0 on non-empty graphs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RankScores(BTreeMap<NodeId, f64>);

impl RankScores {
    pub fn get(&self, id: &NodeId) -> Option<f64> {
        self.0.get(id).copied()
    }

    /// Highest `k` scores, ties broken by id.
    pub fn top(&self, k: usize) -> Vec<(NodeId, f64)> {
        let mut ranked: Vec<(NodeId, f64)> =
            self.0.iter().map(|(id, s)| (id.clone(), *s)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, f64)> {
        self.0.iter().map(|(id, s)| (id, *s))
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outcome of one rank computation.
#[derive(Debug, Clone, Serialize)]
pub struct RankOutcome {
    pub scores: RankScores,
    pub iterations: usize,
    pub converged: bool,
    pub warning: Option<AnalysisWarning>,
}

/// Computes rank scores.
#[derive(Debug, Clone)]
pub struct RankCalculator {
    config: RankConfig,
}

impl RankCalculator {
    pub fn new(config: RankConfig) -> Self {
        Self { config }
    }

    pub fn compute(&self, graph: &dyn GraphQuery) -> RankOutcome {
        self.compute_indexed(&IndexedGraph::from_query(graph))
    }

    /// Power iteration with weighted out-degree.
    ///
    /// Rank held by pages without outgoing links is spread uniformly over all
    /// pages each round, so no mass leaks and the total stays 1.0.
    pub(crate) fn compute_indexed(&self, graph: &IndexedGraph) -> RankOutcome {
        let n = graph.len();
        if n == 0 {
            return RankOutcome {
                scores: RankScores::default(),
                iterations: 0,
                converged: true,
                warning: None,
            };
        }

        let d = self.config.damping;
        let nf = n as f64;
        let out_weight: Vec<f64> = (0..n).map(|i| graph.out_weight(i)).collect();
        let mut rank = vec![1.0 / nf; n];
        let mut next = vec![0.0; n];
        let mut iterations = 0;
        let mut delta = f64::INFINITY;

        while iterations < self.config.max_iterations {
            iterations += 1;
            let dangling: f64 = (0..n)
                .filter(|&i| out_weight[i] <= 0.0)
                .map(|i| rank[i])
                .sum();
            let base = (1.0 - d) / nf + d * dangling / nf;
            next.iter_mut().for_each(|v| *v = base);
            for i in 0..n {
                if out_weight[i] <= 0.0 {
                    continue;
                }
                let share = d * rank[i] / out_weight[i];
                for &(j, w) in &graph.out[i] {
                    next[j] += share * w;
                }
            }

            // Guard against float drift.
            let total: f64 = next.iter().sum();
            if total > 0.0 {
                next.iter_mut().for_each(|v| *v /= total);
            }

            delta = rank
                .iter()
                .zip(&next)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            std::mem::swap(&mut rank, &mut next);
            if delta < self.config.tolerance {
                break;
            }
        }

        let converged = delta < self.config.tolerance;
        let warning = (!converged).then(|| AnalysisWarning::ConvergenceNotReached {
            analysis: "rank".into(),
            iterations,
            delta,
        });
        tracing::debug!(nodes = n, iterations, converged, "rank computed");

        RankOutcome {
            scores: RankScores(graph.ids.iter().cloned().zip(rank).collect()),
            iterations,
            converged,
            warning,
        }
    }
}
