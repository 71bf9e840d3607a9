//! Topical clusters by label propagation on the undirected projection.
//!
//! Deterministic: nodes start with their ordinal (sorted id order) as label and
//! are visited in that order with in-place updates. A node adopts the label with
//! the largest summed edge weight among its neighbors; ties always go to the
//! lowest label, even over its own. Isolated nodes stay in singleton clusters. Cluster ids are renumbered densely in order
//! of first appearance over sorted nodes.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::config::CommunityConfig;
use crate::content::NodeId;
use crate::graph::GraphQuery;

use super::{AnalysisWarning, IndexedGraph};

const WEIGHT_EPSILON: f64 = 1e-12;

/// Cluster assignment for every node.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommunityAssignment {
    pub assignment: BTreeMap<NodeId, usize>,
    /// Members per cluster id, each sorted.
    pub clusters: Vec<Vec<NodeId>>,
    pub iterations: usize,
    pub converged: bool,
    pub warning: Option<AnalysisWarning>,
}

impl CommunityAssignment {
    pub fn cluster_of(&self, id: &NodeId) -> Option<usize> {
        self.assignment.get(id).copied()
    }
}

#[derive(Debug, Clone)]
pub struct CommunityDetector {
    config: CommunityConfig,
}

impl CommunityDetector {
    pub fn new(config: CommunityConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, graph: &dyn GraphQuery) -> CommunityAssignment {
        self.detect_indexed(&IndexedGraph::from_query(graph))
    }

    pub(crate) fn detect_indexed(&self, graph: &IndexedGraph) -> CommunityAssignment {
        let n = graph.len();
        let mut labels: Vec<usize> = (0..n).collect();
        let mut iterations = 0;
        let mut converged = n == 0;
        let mut changed = 0usize;

        while !converged && iterations < self.config.max_iterations {
            iterations += 1;
            changed = 0;
            for i in 0..n {
                let neighbors = &graph.undirected[i];
                if neighbors.is_empty() {
                    continue;
                }
                let mut weight_by_label: BTreeMap<usize, f64> = BTreeMap::new();
                for &(j, w) in neighbors {
                    *weight_by_label.entry(labels[j]).or_default() += w;
                }
                let best = weight_by_label
                    .values()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                let is_best = |w: f64| w >= best - WEIGHT_EPSILON;

                // BTreeMap iterates in label order: the first best is the lowest.
                if let Some((&label, _)) = weight_by_label.iter().find(|&(_, &w)| is_best(w)) {
                    if label != labels[i] {
                        labels[i] = label;
                        changed += 1;
                    }
                }
            }
            converged = changed == 0;
        }

        let mut dense: HashMap<usize, usize> = HashMap::new();
        let mut clusters: Vec<Vec<NodeId>> = Vec::new();
        let mut assignment = BTreeMap::new();
        for (i, id) in graph.ids.iter().enumerate() {
            let next = dense.len();
            let cluster = *dense.entry(labels[i]).or_insert(next);
            if cluster == clusters.len() {
                clusters.push(Vec::new());
            }
            clusters[cluster].push(id.clone());
            assignment.insert(id.clone(), cluster);
        }

        let warning = (!converged).then(|| AnalysisWarning::ConvergenceNotReached {
            analysis: "community".into(),
            iterations,
            // Labels still moving in the last sweep.
            delta: changed as f64,
        });
        tracing::debug!(nodes = n, clusters = clusters.len(), iterations, converged, "communities detected");

        CommunityAssignment {
            assignment,
            clusters,
            iterations,
            converged,
            warning,
        }
    }
}
