//! Content knowledge graph: pages as nodes, links/references/embeds as edges.
//!
//! A [`KnowledgeGraph`] is one immutable generation once built. Rebuilds clone
//! the previous generation, patch it, and publish the result as a new value;
//! readers holding an `Arc` to an older generation are never disturbed.
//!
//! Analyzers only see the read-only [`GraphQuery`] contract.

pub mod builder;
pub mod extract;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use crate::content::NodeId;
use crate::error::GraphError;
use crate::fingerprint::{Fingerprint, Fingerprinter};

pub use builder::{GraphBuilder, LoadedPage, RebuildOutcome};

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Kind of relationship an edge records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Markdown link `[text](target)`.
    Link,
    /// Shortcode reference `{{ ref "target" }}`.
    Reference,
    /// Embedded image or include `![alt](target)`.
    Embed,
}

impl EdgeKind {
    /// Weight of a single occurrence of this kind.
    pub fn base_weight(self) -> f64 {
        match self {
            EdgeKind::Link | EdgeKind::Reference => 1.0,
            EdgeKind::Embed => 0.5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Link => "link",
            EdgeKind::Reference => "reference",
            EdgeKind::Embed => "embed",
        }
    }
}

/// Edge identity, unique within a graph lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A directed, weighted edge. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    pub weight: f64,
}

/// A page or asset node. Adjacency lives in the petgraph storage only;
/// use [`GraphQuery::edges_from`] and [`GraphQuery::edges_to`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Content fingerprint of the page this node was derived from.
    pub version: Fingerprint,
    pub metadata: BTreeMap<String, String>,
}

/// Read-only access to a graph generation.
pub trait GraphQuery: Send + Sync {
    /// All node ids, sorted.
    fn nodes(&self) -> Vec<NodeId>;

    fn contains(&self, id: &NodeId) -> bool;

    /// Outgoing edges of `id`, sorted by edge id. Empty for unknown nodes.
    fn edges_from(&self, id: &NodeId) -> Vec<Edge>;

    /// Incoming edges of `id`, sorted by edge id. Empty for unknown nodes.
    fn edges_to(&self, id: &NodeId) -> Vec<Edge>;

    fn edge(&self, id: EdgeId) -> Option<Edge>;

    fn node_count(&self) -> usize;

    fn edge_count(&self) -> usize;

    fn metadata(&self, id: &NodeId) -> Option<BTreeMap<String, String>>;
}

/// One graph generation.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    graph: StableDiGraph<NodeId, EdgeId>,
    node_index: HashMap<NodeId, NodeIndex>,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    edge_index: HashMap<EdgeId, EdgeIndex>,
    next_edge: u64,
    /// Missing target -> pages that reference it.
    unresolved: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl KnowledgeGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph of `Link` edges from `(source, target)` pairs.
    /// Endpoints are created as needed.
    pub fn from_links<'a>(links: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut graph = Self::new();
        let links: Vec<(NodeId, NodeId)> = links
            .into_iter()
            .map(|(s, t)| (NodeId::new(s), NodeId::new(t)))
            .collect();
        for (s, t) in &links {
            for id in [s, t] {
                if !graph.contains(id) {
                    graph.upsert_node(id.clone(), Fingerprint::of_bytes(id.as_str().as_bytes()), BTreeMap::new());
                }
            }
        }
        for (s, t) in links {
            // Both endpoints were just created.
            let _ = graph.add_reference(&s, &t, EdgeKind::Link, 1.0);
        }
        graph
    }

    /// Insert a node or update its version and metadata. Edges are untouched.
    pub fn upsert_node(
        &mut self,
        id: NodeId,
        version: Fingerprint,
        metadata: BTreeMap<String, String>,
    ) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.version = version;
            node.metadata = metadata;
            return;
        }
        let idx = self.graph.add_node(id.clone());
        self.node_index.insert(id.clone(), idx);
        self.nodes.insert(
            id.clone(),
            Node {
                id,
                version,
                metadata,
            },
        );
    }

    /// Insert a new edge. Both endpoints must exist.
    pub fn insert_edge(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        kind: EdgeKind,
        weight: f64,
    ) -> GraphResult<EdgeId> {
        let (Some(&s), Some(&t)) = (self.node_index.get(source), self.node_index.get(target))
        else {
            return Err(GraphError::DanglingEdge {
                source_node: source.to_string(),
                target: target.to_string(),
            });
        };
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        let idx = self.graph.add_edge(s, t, id);
        self.edge_index.insert(id, idx);
        self.edges.insert(
            id,
            Edge {
                id,
                source: source.clone(),
                target: target.clone(),
                kind,
                weight,
            },
        );
        Ok(id)
    }

    /// Add `weight` to the existing `(source, target, kind)` edge, or insert one.
    ///
    /// Edges are immutable, so a repeated reference replaces the edge with a
    /// heavier one under a fresh id.
    pub fn add_reference(
        &mut self,
        source: &NodeId,
        target: &NodeId,
        kind: EdgeKind,
        weight: f64,
    ) -> GraphResult<EdgeId> {
        let existing = self
            .edge_ids(source, Direction::Outgoing)
            .into_iter()
            .filter_map(|id| self.edges.get(&id))
            .find(|e| &e.target == target && e.kind == kind)
            .map(|e| (e.id, e.weight));
        match existing {
            Some((id, previous)) => {
                self.remove_edge(id);
                self.insert_edge(source, target, kind, previous + weight)
            }
            None => self.insert_edge(source, target, kind, weight),
        }
    }

    fn remove_edge(&mut self, id: EdgeId) -> Option<Edge> {
        let edge = self.edges.remove(&id)?;
        if let Some(idx) = self.edge_index.remove(&id) {
            self.graph.remove_edge(idx);
        }
        Some(edge)
    }

    /// Remove every outgoing edge of `id`. Returns the removed edges.
    pub fn clear_outgoing(&mut self, id: &NodeId) -> Vec<Edge> {
        self.edge_ids(id, Direction::Outgoing)
            .into_iter()
            .filter_map(|e| self.remove_edge(e))
            .collect()
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        if !self.nodes.contains_key(id) {
            return None;
        }
        let mut touching = self.edge_ids(id, Direction::Outgoing);
        touching.extend(self.edge_ids(id, Direction::Incoming));
        for edge in touching {
            self.remove_edge(edge);
        }
        if let Some(idx) = self.node_index.remove(id) {
            self.graph.remove_node(idx);
        }
        self.clear_unresolved_from(id);
        self.nodes.remove(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Pages whose references to `target` could not be resolved.
    pub fn unresolved_referrers(&self, target: &NodeId) -> BTreeSet<NodeId> {
        self.unresolved.get(target).cloned().unwrap_or_default()
    }

    /// Number of distinct missing targets.
    pub fn unresolved_count(&self) -> usize {
        self.unresolved.len()
    }

    pub(crate) fn note_unresolved(&mut self, source: &NodeId, target: &NodeId) {
        self.unresolved
            .entry(target.clone())
            .or_default()
            .insert(source.clone());
    }

    pub(crate) fn take_unresolved(&mut self, target: &NodeId) -> BTreeSet<NodeId> {
        self.unresolved.remove(target).unwrap_or_default()
    }

    pub(crate) fn clear_unresolved_from(&mut self, source: &NodeId) {
        self.unresolved.retain(|_, sources| {
            sources.remove(source);
            !sources.is_empty()
        });
    }

    /// Edges as `(source, target, kind, weight)`, sorted. Two graphs with the
    /// same structure compare equal here even when their edge ids differ.
    pub fn structure(&self) -> Vec<(NodeId, NodeId, EdgeKind, f64)> {
        let mut edges: Vec<_> = self
            .edges
            .values()
            .map(|e| (e.source.clone(), e.target.clone(), e.kind, e.weight))
            .collect();
        edges.sort_by(|a, b| {
            (&a.0, &a.1, a.2)
                .cmp(&(&b.0, &b.1, b.2))
                .then(a.3.total_cmp(&b.3))
        });
        edges
    }

    /// Fingerprint of this generation: node versions plus edge structure.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprinter::new();
        for node in self.nodes.values() {
            fp = fp.text(node.id.as_str()).fingerprint(&node.version);
        }
        for (source, target, kind, weight) in self.structure() {
            fp = fp
                .text(source.as_str())
                .text(target.as_str())
                .text(kind.as_str())
                .bytes(&weight.to_le_bytes());
        }
        fp.finish()
    }

    /// Ids of the edges leaving or entering `id`, in petgraph order.
    fn edge_ids(&self, id: &NodeId, direction: Direction) -> Vec<EdgeId> {
        let Some(&idx) = self.node_index.get(id) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(idx, direction)
            .map(|e| *e.weight())
            .collect()
    }

    fn collect_edges(&self, id: &NodeId, direction: Direction) -> Vec<Edge> {
        let Some(&idx) = self.node_index.get(id) else {
            return Vec::new();
        };
        let mut edges: Vec<Edge> = self
            .graph
            .edges_directed(idx, direction)
            .filter_map(|e| self.edges.get(e.weight()).cloned())
            .collect();
        edges.sort_by_key(|e| e.id);
        edges
    }
}

impl GraphQuery for KnowledgeGraph {
    fn nodes(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    fn edges_from(&self, id: &NodeId) -> Vec<Edge> {
        self.collect_edges(id, Direction::Outgoing)
    }

    fn edges_to(&self, id: &NodeId) -> Vec<Edge> {
        self.collect_edges(id, Direction::Incoming)
    }

    fn edge(&self, id: EdgeId) -> Option<Edge> {
        self.edges.get(&id).cloned()
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn metadata(&self, id: &NodeId) -> Option<BTreeMap<String, String>> {
        self.nodes.get(id).map(|n| n.metadata.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn graph_with(nodes: &[&str]) -> KnowledgeGraph {
        let mut g = KnowledgeGraph::new();
        for n in nodes {
            g.upsert_node(id(n), Fingerprint::of_bytes(n.as_bytes()), BTreeMap::new());
        }
        g
    }

    #[test]
    fn insert_edge_updates_both_endpoints() {
        let mut g = graph_with(&["a.md", "b.md"]);
        let e = g
            .insert_edge(&id("a.md"), &id("b.md"), EdgeKind::Link, 1.0)
            .unwrap();
        assert_eq!(g.edges_from(&id("a.md"))[0].id, e);
        assert_eq!(g.edges_to(&id("b.md"))[0].id, e);
        assert_eq!(g.edges_to(&id("b.md"))[0].source, id("a.md"));
    }

    #[test]
    fn dangling_edge_rejected() {
        let mut g = graph_with(&["a.md"]);
        let err = g
            .insert_edge(&id("a.md"), &id("missing.md"), EdgeKind::Link, 1.0)
            .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { .. }));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn edge_ids_are_monotonic() {
        let mut g = graph_with(&["a.md", "b.md", "c.md"]);
        let e1 = g.insert_edge(&id("a.md"), &id("b.md"), EdgeKind::Link, 1.0).unwrap();
        g.clear_outgoing(&id("a.md"));
        let e2 = g.insert_edge(&id("a.md"), &id("c.md"), EdgeKind::Link, 1.0).unwrap();
        assert!(e2 > e1);
    }

    #[test]
    fn repeated_reference_accumulates_weight() {
        let mut g = graph_with(&["a.md", "b.md"]);
        g.add_reference(&id("a.md"), &id("b.md"), EdgeKind::Link, 1.0).unwrap();
        g.add_reference(&id("a.md"), &id("b.md"), EdgeKind::Link, 1.0).unwrap();
        let edges = g.edges_from(&id("a.md"));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].weight, 2.0);
    }

    #[test]
    fn remove_node_drops_touching_edges() {
        let mut g = KnowledgeGraph::from_links([("a.md", "b.md"), ("b.md", "c.md"), ("c.md", "a.md")]);
        g.remove_node(&id("b.md")).unwrap();
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 1);
        assert!(g.edges_from(&id("a.md")).is_empty());
        assert_eq!(g.edges_from(&id("c.md")).len(), 1);
        assert!(g.edges_to(&id("c.md")).is_empty());
    }

    #[test]
    fn replaced_edge_leaves_no_stale_adjacency() {
        let mut g = graph_with(&["a.md", "b.md"]);
        let first = g.add_reference(&id("a.md"), &id("b.md"), EdgeKind::Link, 1.0).unwrap();
        let second = g.add_reference(&id("a.md"), &id("b.md"), EdgeKind::Link, 1.0).unwrap();
        assert_ne!(first, second);
        assert!(g.edge(first).is_none());
        let out: Vec<EdgeId> = g.edges_from(&id("a.md")).into_iter().map(|e| e.id).collect();
        let inc: Vec<EdgeId> = g.edges_to(&id("b.md")).into_iter().map(|e| e.id).collect();
        assert_eq!(out, vec![second]);
        assert_eq!(inc, vec![second]);
    }

    #[test]
    fn clone_is_an_independent_generation() {
        let g1 = KnowledgeGraph::from_links([("a.md", "b.md")]);
        let mut g2 = g1.clone();
        g2.clear_outgoing(&id("a.md"));
        assert_eq!(g1.edge_count(), 1);
        assert_eq!(g2.edge_count(), 0);
    }

    #[test]
    fn fingerprint_tracks_structure() {
        let g1 = KnowledgeGraph::from_links([("a.md", "b.md")]);
        let g2 = KnowledgeGraph::from_links([("a.md", "b.md")]);
        let g3 = KnowledgeGraph::from_links([("b.md", "a.md")]);
        assert_eq!(g1.fingerprint(), g2.fingerprint());
        assert_ne!(g1.fingerprint(), g3.fingerprint());
    }

    #[test]
    fn unknown_node_has_no_edges() {
        let g = KnowledgeGraph::from_links([("a.md", "b.md")]);
        assert!(g.edges_from(&id("zzz.md")).is_empty());
        assert!(g.metadata(&id("zzz.md")).is_none());
    }
}
