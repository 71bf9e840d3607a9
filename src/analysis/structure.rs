//! Structural health metrics: hubs, orphans, leaves, density.

use serde::Serialize;

use crate::config::GraphConfig;
use crate::content::NodeId;
use crate::graph::GraphQuery;

use super::IndexedGraph;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructureMetrics {
    /// Pages with in-degree at or above the hub threshold, most linked first.
    pub hubs: Vec<(NodeId, usize)>,
    /// Pages nothing links to.
    pub orphans: Vec<NodeId>,
    /// Pages whose total degree is at most the leaf threshold.
    pub leaves: Vec<NodeId>,
    pub density: f64,
    pub average_degree: f64,
    pub node_count: usize,
    /// Distinct linked pairs; parallel edges count once.
    pub edge_count: usize,
}

pub fn structure_metrics(graph: &dyn GraphQuery, config: &GraphConfig) -> StructureMetrics {
    structure_indexed(&IndexedGraph::from_query(graph), config)
}

pub(crate) fn structure_indexed(graph: &IndexedGraph, config: &GraphConfig) -> StructureMetrics {
    let n = graph.len();
    let edge_count: usize = graph.out.iter().map(Vec::len).sum();

    let mut hubs = Vec::new();
    let mut orphans = Vec::new();
    let mut leaves = Vec::new();
    for (i, id) in graph.ids.iter().enumerate() {
        let in_degree = graph.inc[i].len();
        let out_degree = graph.out[i].len();
        if in_degree >= config.hub_threshold {
            hubs.push((id.clone(), in_degree));
        }
        if in_degree == 0 {
            orphans.push(id.clone());
        }
        if in_degree + out_degree <= config.leaf_threshold {
            leaves.push(id.clone());
        }
    }
    hubs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let density = if n > 1 {
        edge_count as f64 / (n as f64 * (n - 1) as f64)
    } else {
        0.0
    };
    let average_degree = if n > 0 {
        2.0 * edge_count as f64 / n as f64
    } else {
        0.0
    };

    StructureMetrics {
        hubs,
        orphans,
        leaves,
        density,
        average_degree,
        node_count: n,
        edge_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::KnowledgeGraph;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn star_site() {
        let g = KnowledgeGraph::from_links([
            ("a", "home"),
            ("b", "home"),
            ("c", "home"),
            ("home", "a"),
        ]);
        let config = GraphConfig {
            hub_threshold: 3,
            leaf_threshold: 1,
        };
        let m = structure_metrics(&g, &config);
        assert_eq!(m.hubs, vec![(id("home"), 3)]);
        assert_eq!(m.orphans, vec![id("b"), id("c")]);
        assert_eq!(m.leaves, vec![id("b"), id("c")]);
        assert_eq!(m.edge_count, 4);
        assert!((m.density - 4.0 / 12.0).abs() < 1e-12);
        assert!((m.average_degree - 2.0).abs() < 1e-12);
    }

    #[test]
    fn empty_graph_has_zero_density() {
        let m = structure_metrics(&KnowledgeGraph::new(), &GraphConfig::default());
        assert_eq!(m.node_count, 0);
        assert_eq!(m.density, 0.0);
        assert_eq!(m.average_degree, 0.0);
    }
}
