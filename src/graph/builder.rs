//! Full and incremental graph construction from a [`ContentSource`].

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use crate::content::{ContentPage, ContentSource, NodeId};
use crate::error::GraphError;
use crate::fingerprint::Fingerprint;
use crate::resource::ResourceKind;

use super::extract::extract_references;
use super::{GraphQuery, KnowledgeGraph};

/// Result of a build or rebuild.
#[derive(Debug, Clone)]
pub struct RebuildOutcome {
    /// The new generation.
    pub graph: KnowledgeGraph,
    /// Malformed and unresolved references found while extracting.
    pub warnings: Vec<GraphError>,
    /// Pages whose outgoing edges were recomputed.
    pub recomputed: BTreeSet<NodeId>,
    /// Pages removed from the graph.
    pub removed: BTreeSet<NodeId>,
    /// Pages that could not be read; their previous node (if any) is kept.
    pub unreadable: BTreeMap<NodeId, String>,
}

/// Builds graph generations.
pub struct GraphBuilder;

/// A page handed to the builder, borrowed when the caller already holds it.
pub type LoadedPage<'a> = Result<Option<Cow<'a, ContentPage>>, String>;

impl GraphBuilder {
    /// Build a graph from every page in `source`.
    pub fn build(source: &dyn ContentSource) -> RebuildOutcome {
        let all: BTreeSet<NodeId> = source.ids().into_iter().collect();
        Self::rebuild(&KnowledgeGraph::new(), &all, source)
    }

    /// Derive a new generation from `previous`, given the pages that changed.
    ///
    /// A changed page that no longer exists in `source` is removed with every
    /// edge touching it. Besides the changed pages, two kinds of pages are
    /// re-extracted: pages that linked to a removed page, and pages waiting on
    /// an unresolved reference to a page that now exists. With no changed
    /// pages the result is structurally identical to `previous`.
    pub fn rebuild(
        previous: &KnowledgeGraph,
        changed: &BTreeSet<NodeId>,
        source: &dyn ContentSource,
    ) -> RebuildOutcome {
        Self::rebuild_with(previous, changed, &BTreeMap::new(), |id| {
            source
                .load(id)
                .map(|page| page.map(Cow::Owned))
                .map_err(|e| e.to_string())
        })
    }

    /// Like [`GraphBuilder::rebuild`], with pages supplied by `load` and a
    /// set of assets (images, stylesheets) that exist as link targets.
    ///
    /// Assets become nodes before any page is extracted, so embeds and links
    /// to them resolve. An asset node's version is derived from its kind and
    /// id only; asset bytes never change the graph. A changed id that is
    /// neither a loadable page nor an asset is removed.
    pub fn rebuild_with<'a>(
        previous: &KnowledgeGraph,
        changed: &BTreeSet<NodeId>,
        assets: &BTreeMap<NodeId, ResourceKind>,
        mut load: impl FnMut(&NodeId) -> LoadedPage<'a>,
    ) -> RebuildOutcome {
        let mut graph = previous.clone();
        let mut warnings = Vec::new();
        let mut unreadable = BTreeMap::new();
        let mut loaded: BTreeMap<NodeId, Cow<'a, ContentPage>> = BTreeMap::new();
        let mut removed = BTreeSet::new();

        for id in changed {
            if assets.contains_key(id) {
                continue;
            }
            match load(id) {
                Ok(Some(page)) => {
                    loaded.insert(id.clone(), page);
                }
                Ok(None) => {
                    removed.insert(id.clone());
                }
                Err(e) => {
                    tracing::warn!(page = %id, error = %e, "page unreadable, keeping previous node");
                    unreadable.insert(id.clone(), e);
                }
            }
        }

        // Pages linking to a removed page lose those edges and must re-extract
        // so the reference is tracked as unresolved.
        let mut dependents: BTreeSet<NodeId> = BTreeSet::new();
        for id in &removed {
            for edge in graph.edges_to(id) {
                dependents.insert(edge.source);
            }
            graph.remove_node(id);
        }

        for (id, kind) in assets {
            if graph.contains(id) || loaded.contains_key(id) {
                continue;
            }
            graph.upsert_node(
                id.clone(),
                Fingerprint::of_bytes(format!("{kind}:{id}").as_bytes()),
                BTreeMap::from([("kind".to_string(), kind.to_string())]),
            );
            dependents.extend(graph.take_unresolved(id));
        }

        for (id, page) in &loaded {
            let is_new = !graph.contains(id);
            graph.upsert_node(id.clone(), page.fingerprint(), page.metadata.clone());
            if is_new {
                dependents.extend(graph.take_unresolved(id));
            }
        }

        for id in dependents {
            if removed.contains(&id) || loaded.contains_key(&id) || !graph.contains(&id) {
                continue;
            }
            match load(&id) {
                Ok(Some(page)) => {
                    graph.upsert_node(id.clone(), page.fingerprint(), page.metadata.clone());
                    loaded.insert(id, page);
                }
                Ok(None) => {}
                Err(e) => {
                    unreadable.insert(id, e);
                }
            }
        }

        for (id, page) in &loaded {
            graph.clear_outgoing(id);
            graph.clear_unresolved_from(id);
            let extraction = extract_references(page);
            warnings.extend(extraction.warnings);
            for reference in extraction.refs {
                if &reference.target == id {
                    continue;
                }
                if graph.contains(&reference.target) {
                    // Both endpoints exist, so this cannot dangle.
                    if let Err(e) = graph.add_reference(
                        id,
                        &reference.target,
                        reference.kind,
                        reference.kind.base_weight(),
                    ) {
                        warnings.push(e);
                    }
                } else {
                    graph.note_unresolved(id, &reference.target);
                    warnings.push(GraphError::UnresolvedReference {
                        node: id.to_string(),
                        target: reference.target.to_string(),
                    });
                }
            }
        }

        let recomputed: BTreeSet<NodeId> = loaded.into_keys().collect();
        tracing::info!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            recomputed = recomputed.len(),
            removed = removed.len(),
            warnings = warnings.len(),
            "graph rebuilt"
        );
        RebuildOutcome {
            graph,
            warnings,
            recomputed,
            removed,
            unreadable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemorySource;
    use crate::graph::EdgeKind;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn site() -> MemorySource {
        MemorySource::from_pages([
            ContentPage::new("index.md", "[a](a.md) [b](b.md)"),
            ContentPage::new("a.md", "[b](b.md) ![img](logo.png)"),
            ContentPage::new("b.md", "{{ ref \"index.md\" }} [c](c.md)"),
            ContentPage::new("logo.png", ""),
        ])
    }

    #[test]
    fn full_build() {
        let outcome = GraphBuilder::build(&site());
        let g = &outcome.graph;
        assert_eq!(g.node_count(), 4);
        assert_eq!(g.edge_count(), 5);
        assert_eq!(g.edges_from(&id("b.md"))[0].kind, EdgeKind::Reference);
        assert_eq!(g.unresolved_referrers(&id("c.md")), BTreeSet::from([id("b.md")]));
        assert!(outcome.warnings.iter().any(|w| matches!(
            w,
            GraphError::UnresolvedReference { target, .. } if target == "c.md"
        )));
    }

    #[test]
    fn zero_changes_is_identical() {
        let source = site();
        let first = GraphBuilder::build(&source).graph;
        let again = GraphBuilder::rebuild(&first, &BTreeSet::new(), &source);
        assert_eq!(again.graph.structure(), first.structure());
        assert_eq!(again.graph.fingerprint(), first.fingerprint());
        assert!(again.recomputed.is_empty());
    }

    #[test]
    fn changed_page_replaces_its_edges() {
        let source = site();
        let first = GraphBuilder::build(&source).graph;
        source.insert(ContentPage::new("a.md", "[index](index.md)"));

        let outcome = GraphBuilder::rebuild(&first, &BTreeSet::from([id("a.md")]), &source);
        let targets: Vec<NodeId> = outcome
            .graph
            .edges_from(&id("a.md"))
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(targets, vec![id("index.md")]);
        assert_eq!(outcome.recomputed, BTreeSet::from([id("a.md")]));
        // The previous generation is untouched.
        assert_eq!(first.edges_from(&id("a.md")).len(), 2);
    }

    #[test]
    fn deleted_page_removes_edges_and_tracks_referrers() {
        let source = site();
        let first = GraphBuilder::build(&source).graph;
        source.remove(&id("b.md"));

        let outcome = GraphBuilder::rebuild(&first, &BTreeSet::from([id("b.md")]), &source);
        let g = &outcome.graph;
        assert!(!g.contains(&id("b.md")));
        assert!(g.edges_to(&id("b.md")).is_empty());
        assert_eq!(outcome.removed, BTreeSet::from([id("b.md")]));
        assert!(outcome.recomputed.contains(&id("a.md")));
        assert!(outcome.recomputed.contains(&id("index.md")));
        assert!(g.unresolved_referrers(&id("b.md")).contains(&id("a.md")));
    }

    #[test]
    fn new_page_resolves_waiting_references() {
        let source = site();
        let first = GraphBuilder::build(&source).graph;
        source.insert(ContentPage::new("c.md", "leaf"));

        let outcome = GraphBuilder::rebuild(&first, &BTreeSet::from([id("c.md")]), &source);
        let g = &outcome.graph;
        assert_eq!(g.edges_to(&id("c.md")).len(), 1);
        assert!(outcome.recomputed.contains(&id("b.md")));
        assert_eq!(g.unresolved_count(), 0);
    }

    #[test]
    fn preloaded_pages_are_borrowed_once() {
        let pages: BTreeMap<NodeId, ContentPage> = [
            ContentPage::new("index.md", "![img](logo.png) [a](a.md)"),
            ContentPage::new("a.md", ""),
        ]
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();
        let assets = BTreeMap::from([(id("logo.png"), ResourceKind::Image)]);
        let changed: BTreeSet<NodeId> = pages.keys().cloned().collect();

        let mut loads = 0;
        let outcome = GraphBuilder::rebuild_with(&KnowledgeGraph::new(), &changed, &assets, |id| {
            loads += 1;
            Ok(pages.get(id).map(Cow::Borrowed))
        });
        assert_eq!(loads, 2);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.recomputed, changed);
        let g = &outcome.graph;
        assert_eq!(g.node_count(), 3);
        assert_eq!(g.edges_to(&id("logo.png"))[0].kind, EdgeKind::Embed);
        assert_eq!(g.metadata(&id("logo.png")).unwrap()["kind"], "image");
    }

    #[test]
    fn new_asset_resolves_waiting_embeds() {
        let source = MemorySource::from_pages([ContentPage::new("index.md", "![img](logo.png)")]);
        let first = GraphBuilder::build(&source);
        assert_eq!(first.graph.unresolved_count(), 1);

        let assets = BTreeMap::from([(id("logo.png"), ResourceKind::Image)]);
        let outcome = GraphBuilder::rebuild_with(&first.graph, &BTreeSet::new(), &assets, |id| {
            source.load(id).map(|p| p.map(Cow::Owned)).map_err(|e| e.to_string())
        });
        assert_eq!(outcome.recomputed, BTreeSet::from([id("index.md")]));
        assert_eq!(outcome.graph.edges_to(&id("logo.png")).len(), 1);
        assert_eq!(outcome.graph.unresolved_count(), 0);
    }

    #[test]
    fn incremental_matches_full_build() {
        let source = site();
        let first = GraphBuilder::build(&source).graph;
        source.insert(ContentPage::new("c.md", "[a](a.md)"));
        source.remove(&id("index.md"));
        source.insert(ContentPage::new("a.md", "[c](c.md) [c again](c.md)"));

        let changed = BTreeSet::from([id("c.md"), id("index.md"), id("a.md")]);
        let incremental = GraphBuilder::rebuild(&first, &changed, &source).graph;
        let full = GraphBuilder::build(&source).graph;
        assert_eq!(incremental.structure(), full.structure());
        assert_eq!(incremental.fingerprint(), full.fingerprint());
    }
}
