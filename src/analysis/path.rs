//! Shortest-path distances and betweenness/closeness centrality.
//!
//! Everything here is structural: edges count as one hop regardless of
//! weight. Betweenness uses Brandes' accumulation from each source; on large
//! graphs only a seeded sample of sources (pivots) is used and the result is
//! scaled up by `n / k`.

use std::collections::{BTreeMap, VecDeque};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::PathConfig;
use crate::content::NodeId;
use crate::error::GraphError;
use crate::graph::{GraphQuery, GraphResult};

use super::IndexedGraph;

/// Hop distance from a source node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    Hops(usize),
    Unreachable,
}

impl std::fmt::Display for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Distance::Hops(n) => write!(f, "{n}"),
            Distance::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CentralityOutcome {
    /// Normalized betweenness per node.
    pub betweenness: BTreeMap<NodeId, f64>,
    /// Wasserman-Faust closeness over incoming distances.
    pub closeness: BTreeMap<NodeId, f64>,
    /// True when only a sample of sources was used.
    pub approximate: bool,
    pub pivots_used: usize,
    /// Longest finite shortest path seen.
    pub diameter: usize,
    /// Mean finite shortest-path length over reachable ordered pairs.
    pub average_path_length: f64,
}

impl CentralityOutcome {
    /// Nodes most often on shortest paths, highest first, ties by id.
    pub fn bottlenecks(&self, k: usize) -> Vec<(NodeId, f64)> {
        let mut ranked: Vec<(NodeId, f64)> = self
            .betweenness
            .iter()
            .filter(|(_, b)| **b > 0.0)
            .map(|(id, b)| (id.clone(), *b))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}

/// Result of one single-source pass.
struct SourcePass {
    source: usize,
    dist: Vec<Option<usize>>,
    dependency: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct PathAnalyzer {
    config: PathConfig,
}

impl PathAnalyzer {
    pub fn new(config: PathConfig) -> Self {
        Self { config }
    }

    /// Hop distance from `source` to every node. Unreachable nodes are
    /// reported as such, never as an error.
    pub fn distances(
        &self,
        graph: &dyn GraphQuery,
        source: &NodeId,
    ) -> GraphResult<BTreeMap<NodeId, Distance>> {
        let indexed = IndexedGraph::from_query(graph);
        let Some(&s) = indexed.index.get(source) else {
            return Err(GraphError::NodeNotFound {
                node: source.to_string(),
            });
        };
        Ok(self.distances_indexed(&indexed, s))
    }

    pub(crate) fn distances_indexed(
        &self,
        graph: &IndexedGraph,
        source: usize,
    ) -> BTreeMap<NodeId, Distance> {
        let dist = bfs(graph, source);
        graph
            .ids
            .iter()
            .zip(dist)
            .map(|(id, d)| {
                let d = d.map_or(Distance::Unreachable, Distance::Hops);
                (id.clone(), d)
            })
            .collect()
    }

    pub fn centrality(&self, graph: &dyn GraphQuery) -> CentralityOutcome {
        self.centrality_indexed(&IndexedGraph::from_query(graph))
    }

    pub(crate) fn centrality_indexed(&self, graph: &IndexedGraph) -> CentralityOutcome {
        let n = graph.len();
        if n == 0 {
            return CentralityOutcome::default();
        }

        let approximate = n > self.config.exact_threshold;
        let sources: Vec<usize> = if approximate {
            let k = self.config.pivots.clamp(1, n);
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            let mut picked = rand::seq::index::sample(&mut rng, n, k).into_vec();
            picked.sort_unstable();
            picked
        } else {
            (0..n).collect()
        };

        // Passes run in parallel; accumulation below is sequential in source
        // order so the floating-point sums do not depend on scheduling.
        let passes: Vec<SourcePass> = sources
            .par_iter()
            .map(|&s| brandes_pass(graph, s))
            .collect();

        let mut betweenness = vec![0.0; n];
        let mut reach = vec![0usize; n];
        let mut dist_sum = vec![0usize; n];
        let mut diameter = 0;
        let mut pair_count = 0usize;
        let mut pair_total = 0usize;
        for pass in &passes {
            for w in 0..n {
                if w == pass.source {
                    continue;
                }
                betweenness[w] += pass.dependency[w];
                if let Some(d) = pass.dist[w] {
                    reach[w] += 1;
                    dist_sum[w] += d;
                    diameter = diameter.max(d);
                    pair_count += 1;
                    pair_total += d;
                }
            }
        }

        let scale = if approximate {
            n as f64 / sources.len() as f64
        } else {
            1.0
        };
        let norm = if n > 2 {
            1.0 / ((n - 1) as f64 * (n - 2) as f64)
        } else {
            1.0
        };

        let mut closeness = BTreeMap::new();
        let mut between = BTreeMap::new();
        for (v, id) in graph.ids.iter().enumerate() {
            between.insert(id.clone(), betweenness[v] * scale * norm);
            // Sources other than v that were sampled.
            let possible = sources.len() - usize::from(sources.binary_search(&v).is_ok());
            let c = if dist_sum[v] == 0 || possible == 0 {
                0.0
            } else {
                let r = reach[v] as f64;
                (r / possible as f64) * (r / dist_sum[v] as f64)
            };
            closeness.insert(id.clone(), c);
        }

        let average_path_length = if pair_count == 0 {
            0.0
        } else {
            pair_total as f64 / pair_count as f64
        };
        tracing::debug!(
            nodes = n,
            pivots = sources.len(),
            approximate,
            diameter,
            "centrality computed"
        );

        CentralityOutcome {
            betweenness: between,
            closeness,
            approximate,
            pivots_used: sources.len(),
            diameter,
            average_path_length,
        }
    }
}

fn bfs(graph: &IndexedGraph, source: usize) -> Vec<Option<usize>> {
    let mut dist = vec![None; graph.len()];
    dist[source] = Some(0);
    let mut queue = VecDeque::from([source]);
    while let Some(v) = queue.pop_front() {
        let next = dist[v].map_or(0, |d| d + 1);
        for &(w, _) in &graph.out[v] {
            if dist[w].is_none() {
                dist[w] = Some(next);
                queue.push_back(w);
            }
        }
    }
    dist
}

/// Brandes' single-source shortest-path counting and dependency accumulation.
fn brandes_pass(graph: &IndexedGraph, s: usize) -> SourcePass {
    let n = graph.len();
    let mut order = Vec::with_capacity(n);
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut sigma = vec![0.0f64; n];
    let mut dist: Vec<Option<usize>> = vec![None; n];
    sigma[s] = 1.0;
    dist[s] = Some(0);

    let mut queue = VecDeque::from([s]);
    while let Some(v) = queue.pop_front() {
        order.push(v);
        let Some(dv) = dist[v] else { continue };
        for &(w, _) in &graph.out[v] {
            if dist[w].is_none() {
                dist[w] = Some(dv + 1);
                queue.push_back(w);
            }
            if dist[w] == Some(dv + 1) {
                sigma[w] += sigma[v];
                preds[w].push(v);
            }
        }
    }

    let mut dependency = vec![0.0f64; n];
    while let Some(w) = order.pop() {
        for &v in &preds[w] {
            dependency[v] += sigma[v] / sigma[w] * (1.0 + dependency[w]);
        }
    }

    SourcePass {
        source: s,
        dist,
        dependency,
    }
}
