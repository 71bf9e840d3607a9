//! Graph analyses over one immutable graph generation.
//!
//! Every analyzer reads the graph through [`GraphQuery`] only. [`analyze`]
//! runs them all over a single snapshot in parallel and gathers their
//! warnings. None of them mutates the graph.

pub mod community;
pub mod path;
pub mod rank;
pub mod report;
pub mod structure;
pub mod suggest;

use std::collections::{BTreeMap, HashMap};

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::config::SiteConfig;
use crate::content::NodeId;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::graph::GraphQuery;

pub use community::{CommunityAssignment, CommunityDetector};
pub use path::{CentralityOutcome, Distance, PathAnalyzer};
pub use rank::{RankCalculator, RankOutcome, RankScores};
pub use report::{ReportFormat, render_report, report_json};
pub use structure::{StructureMetrics, structure_metrics};
pub use suggest::{LinkSuggester, LinkSuggestion};

/// Non-fatal outcome of an analysis run. Results are still usable.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic, Serialize)]
pub enum AnalysisWarning {
    #[error("{analysis} did not converge after {iterations} iterations (last delta {delta:e})")]
    #[diagnostic(
        code(sitegraph::analysis::convergence_not_reached),
        severity(Warning),
        help("The returned values are the last iterate. Raise max_iterations or the tolerance in sitegraph.toml.")
    )]
    ConvergenceNotReached {
        analysis: String,
        iterations: usize,
        delta: f64,
    },
}

/// Dense, index-based view of a graph used internally by the analyzers.
///
/// Nodes are numbered in sorted id order; parallel edges between the same
/// pair are merged by summing their weights.
#[derive(Debug, Clone)]
pub(crate) struct IndexedGraph {
    pub ids: Vec<NodeId>,
    pub index: HashMap<NodeId, usize>,
    /// Outgoing `(target, weight)`, sorted by target.
    pub out: Vec<Vec<(usize, f64)>>,
    /// Incoming `(source, weight)`, sorted by source.
    pub inc: Vec<Vec<(usize, f64)>>,
    /// Undirected projection without self-loops, sorted by neighbor.
    pub undirected: Vec<Vec<(usize, f64)>>,
}

impl IndexedGraph {
    pub fn from_query(graph: &dyn GraphQuery) -> Self {
        let ids = graph.nodes();
        let index: HashMap<NodeId, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        let n = ids.len();

        let mut out: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        let mut inc: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        let mut undirected: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
        for (i, id) in ids.iter().enumerate() {
            for edge in graph.edges_from(id) {
                let Some(&j) = index.get(&edge.target) else {
                    continue;
                };
                *out[i].entry(j).or_default() += edge.weight;
                *inc[j].entry(i).or_default() += edge.weight;
                if i != j {
                    *undirected[i].entry(j).or_default() += edge.weight;
                    *undirected[j].entry(i).or_default() += edge.weight;
                }
            }
        }

        let flatten = |maps: Vec<BTreeMap<usize, f64>>| -> Vec<Vec<(usize, f64)>> {
            maps.into_iter().map(|m| m.into_iter().collect()).collect()
        };
        Self {
            ids,
            index,
            out: flatten(out),
            inc: flatten(inc),
            undirected: flatten(undirected),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn out_weight(&self, i: usize) -> f64 {
        self.out[i].iter().map(|(_, w)| w).sum()
    }
}

/// Everything one analysis session produced.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResults {
    pub node_count: usize,
    pub edge_count: usize,
    pub rank: RankOutcome,
    pub communities: CommunityAssignment,
    pub suggestions: BTreeMap<NodeId, Vec<LinkSuggestion>>,
    pub centrality: CentralityOutcome,
    pub structure: StructureMetrics,
    /// Hop distances from the highest-ranked page.
    pub distances: Option<(NodeId, BTreeMap<NodeId, Distance>)>,
    pub warnings: Vec<AnalysisWarning>,
}

impl AnalysisResults {
    /// Fingerprint of the graph-derived data embedded in one page: its rank,
    /// cluster and suggested links. Floats are rounded so that noise below the
    /// reported precision never invalidates a page.
    pub fn page_fingerprint(&self, id: &NodeId) -> Fingerprint {
        let mut fp = Fingerprinter::new().text(id.as_str());
        fp = fp.text(&format!("{:.6}", self.rank.scores.get(id).unwrap_or(0.0)));
        if let Some(cluster) = self.communities.assignment.get(id) {
            fp = fp.text(&cluster.to_string());
        }
        for s in self.suggestions.get(id).map(Vec::as_slice).unwrap_or_default() {
            fp = fp.text(s.target.as_str()).text(&format!("{:.6}", s.score));
        }
        fp.finish()
    }
}

/// Run every analyzer over one snapshot.
pub fn analyze(graph: &dyn GraphQuery, config: &SiteConfig) -> AnalysisResults {
    let indexed = IndexedGraph::from_query(graph);
    let ranker = RankCalculator::new(config.rank.clone());
    let detector = CommunityDetector::new(config.community.clone());
    let suggester = LinkSuggester::new(config.suggest.clone());
    let paths = PathAnalyzer::new(config.paths.clone());

    let ((rank, communities), (suggestions, (centrality, structure))) = rayon::join(
        || {
            rayon::join(
                || ranker.compute_indexed(&indexed),
                || detector.detect_indexed(&indexed),
            )
        },
        || {
            rayon::join(
                || suggester.suggest_all_indexed(graph, &indexed),
                || {
                    (
                        paths.centrality_indexed(&indexed),
                        structure::structure_indexed(&indexed, &config.graph),
                    )
                },
            )
        },
    );

    let distances = rank.scores.top(1).into_iter().next().and_then(|(top, _)| {
        let &source = indexed.index.get(&top)?;
        Some((top, paths.distances_indexed(&indexed, source)))
    });

    let warnings: Vec<AnalysisWarning> = rank
        .warning
        .iter()
        .chain(communities.warning.iter())
        .cloned()
        .collect();
    for warning in &warnings {
        tracing::warn!(%warning, "analysis degraded");
    }
    tracing::info!(
        nodes = indexed.len(),
        clusters = communities.clusters.len(),
        approximate_paths = centrality.approximate,
        "analysis complete"
    );

    AnalysisResults {
        node_count: graph.node_count(),
        edge_count: graph.edge_count(),
        rank,
        communities,
        suggestions,
        centrality,
        structure,
        distances,
        warnings,
    }
}
