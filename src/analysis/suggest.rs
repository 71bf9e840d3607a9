//! Link suggestions from shared neighbors and topical overlap.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

use crate::config::SuggestConfig;
use crate::content::NodeId;
use crate::error::GraphError;
use crate::graph::{GraphQuery, GraphResult};

use super::IndexedGraph;

/// Metadata fields whose tokens make up a page's topic.
const TOPIC_FIELDS: &[&str] = &["title", "tags", "category", "categories"];

/// A suggested link from one page to another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkSuggestion {
    pub target: NodeId,
    pub score: f64,
    pub shared_neighbors: f64,
    pub topical: f64,
}

#[derive(Debug, Clone)]
pub struct LinkSuggester {
    config: SuggestConfig,
}

/// Per-node data shared by every suggestion query over one snapshot.
struct SuggestIndex {
    out: Vec<BTreeSet<usize>>,
    topics: Vec<BTreeSet<String>>,
}

impl SuggestIndex {
    fn new(graph: &dyn GraphQuery, indexed: &IndexedGraph) -> Self {
        let out = indexed
            .out
            .iter()
            .map(|targets| targets.iter().map(|&(j, _)| j).collect())
            .collect();
        let topics = indexed
            .ids
            .iter()
            .map(|id| graph.metadata(id).map(|m| topic_tokens(&m)).unwrap_or_default())
            .collect();
        Self { out, topics }
    }
}

/// Lowercased NFKC word tokens from the topic fields.
pub fn topic_tokens(metadata: &BTreeMap<String, String>) -> BTreeSet<String> {
    TOPIC_FIELDS
        .iter()
        .filter_map(|field| metadata.get(*field))
        .flat_map(|value| {
            let normalized: String = value.nfkc().collect::<String>().to_lowercase();
            normalized
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

impl LinkSuggester {
    pub fn new(config: SuggestConfig) -> Self {
        Self { config }
    }

    /// Suggestions for one node, best first.
    pub fn suggest(&self, graph: &dyn GraphQuery, node: &NodeId) -> GraphResult<Vec<LinkSuggestion>> {
        let indexed = IndexedGraph::from_query(graph);
        let Some(&source) = indexed.index.get(node) else {
            return Err(GraphError::NodeNotFound {
                node: node.to_string(),
            });
        };
        let index = SuggestIndex::new(graph, &indexed);
        Ok(self.suggest_for(&indexed, &index, source))
    }

    /// Suggestions for every node, computed in parallel.
    pub fn suggest_all(&self, graph: &dyn GraphQuery) -> BTreeMap<NodeId, Vec<LinkSuggestion>> {
        self.suggest_all_indexed(graph, &IndexedGraph::from_query(graph))
    }

    pub(crate) fn suggest_all_indexed(
        &self,
        graph: &dyn GraphQuery,
        indexed: &IndexedGraph,
    ) -> BTreeMap<NodeId, Vec<LinkSuggestion>> {
        let index = SuggestIndex::new(graph, indexed);
        (0..indexed.len())
            .into_par_iter()
            .map(|i| (indexed.ids[i].clone(), self.suggest_for(indexed, &index, i)))
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }

    fn suggest_for(&self, indexed: &IndexedGraph, index: &SuggestIndex, a: usize) -> Vec<LinkSuggestion> {
        let w = self.config.neighbor_weight;
        let out_a = &index.out[a];
        let mut suggestions: Vec<LinkSuggestion> = (0..indexed.len())
            .filter(|&b| b != a && !out_a.contains(&b))
            .filter_map(|b| {
                let shared_neighbors = if out_a.is_empty() {
                    0.0
                } else {
                    out_a.intersection(&index.out[b]).count() as f64 / out_a.len() as f64
                };
                let topical = jaccard(&index.topics[a], &index.topics[b]);
                let score = w * shared_neighbors + (1.0 - w) * topical;
                (score > self.config.min_score).then(|| LinkSuggestion {
                    target: indexed.ids[b].clone(),
                    score,
                    shared_neighbors,
                    topical,
                })
            })
            .collect();
        suggestions.sort_by(|x, y| {
            y.score
                .total_cmp(&x.score)
                .then_with(|| x.target.cmp(&y.target))
        });
        suggestions.truncate(self.config.top_k);
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentPage, MemorySource};
    use crate::graph::{GraphBuilder, KnowledgeGraph};

    fn suggester() -> LinkSuggester {
        LinkSuggester::new(SuggestConfig::default())
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn tokens_are_normalized() {
        let meta = BTreeMap::from([
            ("title".to_string(), "Ｒｕｓｔ Graphs".to_string()),
            ("tags".to_string(), "rust, PageRank".to_string()),
            ("author".to_string(), "ignored".to_string()),
        ]);
        let tokens = topic_tokens(&meta);
        assert_eq!(
            tokens,
            BTreeSet::from(["graphs".to_string(), "pagerank".to_string(), "rust".to_string()])
        );
    }

    #[test]
    fn shared_neighbors_drive_suggestions() {
        // a and b both link to x and y; c links to x only.
        let g = KnowledgeGraph::from_links([
            ("a", "x"),
            ("a", "y"),
            ("b", "x"),
            ("b", "y"),
            ("c", "x"),
        ]);
        let s = suggester().suggest(&g, &id("a")).unwrap();
        assert_eq!(s[0].target, id("b"));
        assert!((s[0].shared_neighbors - 1.0).abs() < 1e-12);
        assert_eq!(s[1].target, id("c"));
        assert!((s[1].shared_neighbors - 0.5).abs() < 1e-12);
        // Existing targets and the node itself are never suggested.
        assert!(s.iter().all(|x| x.target != id("x") && x.target != id("a")));
    }

    #[test]
    fn topical_overlap_counts() {
        let source = MemorySource::from_pages([
            ContentPage::new("a.md", "").with_meta("tags", "rust graphs"),
            ContentPage::new("b.md", "").with_meta("tags", "rust graphs"),
            ContentPage::new("c.md", "").with_meta("tags", "cooking"),
        ]);
        let g = GraphBuilder::build(&source).graph;
        let s = suggester().suggest(&g, &id("a.md")).unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].target, id("b.md"));
        assert!((s[0].topical - 1.0).abs() < 1e-12);
        assert!((s[0].score - 0.4).abs() < 1e-12);
    }

    #[test]
    fn top_k_truncates() {
        let config = SuggestConfig {
            top_k: 1,
            ..SuggestConfig::default()
        };
        let g = KnowledgeGraph::from_links([("a", "x"), ("b", "x"), ("c", "x")]);
        let s = LinkSuggester::new(config).suggest(&g, &id("a")).unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].target, id("b"));
    }

    #[test]
    fn unknown_node_is_error() {
        let g = KnowledgeGraph::from_links([("a", "b")]);
        assert!(matches!(
            suggester().suggest(&g, &id("zzz")),
            Err(GraphError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn suggest_all_matches_single_queries() {
        let g = KnowledgeGraph::from_links([("a", "x"), ("b", "x"), ("b", "y"), ("c", "y")]);
        let all = suggester().suggest_all(&g);
        for node in ["a", "b", "c", "x", "y"] {
            assert_eq!(all[&id(node)], suggester().suggest(&g, &id(node)).unwrap());
        }
    }
}
