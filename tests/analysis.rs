//! Analyses over whole graphs, through the public API only.

use std::collections::BTreeSet;

use sitegraph::analysis::{
    CommunityDetector, Distance, LinkSuggester, PathAnalyzer, RankCalculator, ReportFormat,
    analyze, render_report, report_json,
};
use sitegraph::config::{CommunityConfig, PathConfig, RankConfig, SiteConfig, SuggestConfig};
use sitegraph::content::{ContentPage, MemorySource, NodeId};
use sitegraph::graph::{GraphBuilder, KnowledgeGraph};

fn id(s: &str) -> NodeId {
    NodeId::new(s)
}

/// Two fully linked triangles joined by a single edge `a1 -> b1`.
fn two_cliques() -> KnowledgeGraph {
    KnowledgeGraph::from_links([
        ("a1", "a2"),
        ("a2", "a1"),
        ("a1", "a3"),
        ("a3", "a1"),
        ("a2", "a3"),
        ("a3", "a2"),
        ("b1", "b2"),
        ("b2", "b1"),
        ("b1", "b3"),
        ("b3", "b1"),
        ("b2", "b3"),
        ("b3", "b2"),
        ("a1", "b1"),
    ])
}

/// A directed chain of `n` pages, `p00 -> p01 -> ...`.
fn chain(n: usize) -> KnowledgeGraph {
    let names: Vec<String> = (0..n).map(|i| format!("p{i:02}")).collect();
    let links: Vec<(&str, &str)> = names
        .windows(2)
        .map(|w| (w[0].as_str(), w[1].as_str()))
        .collect();
    KnowledgeGraph::from_links(links)
}

#[test]
fn rank_is_a_distribution() {
    let graph = two_cliques();
    let outcome = RankCalculator::new(RankConfig::default()).compute(&graph);
    assert!(outcome.converged);
    assert!(outcome.warning.is_none());
    assert_eq!(outcome.scores.len(), 6);
    assert!((outcome.scores.sum() - 1.0).abs() < 1e-9);
    assert!(outcome.scores.iter().all(|(_, s)| s > 0.0));
    // The bridge feeds the b side, so b1 outranks everything.
    assert_eq!(outcome.scores.top(1)[0].0, id("b1"));
}

#[test]
fn symmetric_cycle_ranks_evenly() {
    let graph = KnowledgeGraph::from_links([("a", "b"), ("b", "c"), ("c", "d"), ("d", "a")]);
    let outcome = RankCalculator::new(RankConfig::default()).compute(&graph);
    for (_, score) in outcome.scores.iter() {
        assert!((score - 0.25).abs() < 1e-9);
    }
}

#[test]
fn cliques_become_clusters() {
    let graph = two_cliques();
    let communities = CommunityDetector::new(CommunityConfig::default()).detect(&graph);
    assert!(communities.converged);
    assert_eq!(communities.clusters.len(), 2);
    assert_eq!(communities.cluster_of(&id("a1")), communities.cluster_of(&id("a3")));
    assert_eq!(communities.cluster_of(&id("b1")), communities.cluster_of(&id("b3")));
    assert_ne!(communities.cluster_of(&id("a2")), communities.cluster_of(&id("b2")));
}

#[test]
fn bridge_endpoints_are_bottlenecks() {
    let graph = two_cliques();
    let centrality = PathAnalyzer::new(PathConfig::default()).centrality(&graph);
    assert!(!centrality.approximate);
    let top: BTreeSet<NodeId> = centrality
        .bottlenecks(2)
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(top, BTreeSet::from([id("a1"), id("b1")]));
    // a2 -> a1 -> b1 -> b2
    assert_eq!(centrality.diameter, 3);
}

#[test]
fn distances_cross_the_bridge_one_way() {
    let graph = two_cliques();
    let analyzer = PathAnalyzer::new(PathConfig::default());
    let from_a2 = analyzer.distances(&graph, &id("a2")).unwrap();
    assert_eq!(from_a2[&id("a2")], Distance::Hops(0));
    assert_eq!(from_a2[&id("b3")], Distance::Hops(3));

    let from_b2 = analyzer.distances(&graph, &id("b2")).unwrap();
    assert_eq!(from_b2[&id("a1")], Distance::Unreachable);
    assert!(analyzer.distances(&graph, &id("nope")).is_err());
}

#[test]
fn sampled_centrality_is_reproducible() {
    let graph = chain(40);
    let config = PathConfig {
        exact_threshold: 10,
        pivots: 8,
        seed: 7,
    };
    let first = PathAnalyzer::new(config.clone()).centrality(&graph);
    let second = PathAnalyzer::new(config).centrality(&graph);
    assert!(first.approximate);
    assert_eq!(first.pivots_used, 8);
    assert_eq!(first.betweenness, second.betweenness);
    assert_eq!(first.closeness, second.closeness);
    // Chain endpoints are never interior to a path.
    assert_eq!(first.betweenness[&id("p00")], 0.0);
    assert_eq!(first.betweenness[&id("p39")], 0.0);
}

#[test]
fn suggestions_follow_shared_links_and_topics() {
    let source = MemorySource::from_pages([
        ContentPage::new("x.md", "[c](c.md) [d](d.md)").with_meta("tags", "rust"),
        ContentPage::new("y.md", "[c](c.md) [d](d.md)"),
        ContentPage::new("z.md", "").with_meta("tags", "Rust"),
        ContentPage::new("c.md", ""),
        ContentPage::new("d.md", ""),
    ]);
    let graph = GraphBuilder::build(&source).graph;
    let suggestions = LinkSuggester::new(SuggestConfig::default())
        .suggest(&graph, &id("x.md"))
        .unwrap();

    let targets: Vec<&str> = suggestions.iter().map(|s| s.target.as_str()).collect();
    assert_eq!(targets, vec!["y.md", "z.md"]);
    assert_eq!(suggestions[0].shared_neighbors, 1.0);
    assert_eq!(suggestions[1].topical, 1.0);
    // Already linked pages are never suggested.
    assert!(!targets.contains(&"c.md"));
}

#[test]
fn full_analysis_feeds_reports() {
    let graph = two_cliques();
    let results = analyze(&graph, &SiteConfig::default());
    assert_eq!(results.node_count, 6);
    assert_eq!(results.edge_count, 13);
    assert!(results.warnings.is_empty());

    let simple = render_report(&results, ReportFormat::Simple);
    assert!(simple.contains("nodes: 6"));
    let detailed = render_report(&results, ReportFormat::Detailed);
    assert!(detailed.len() > simple.len());
    assert!(detailed.contains("b3"));

    let json = report_json(&results, ReportFormat::Detailed);
    assert_eq!(json["nodes"], 6);
    assert_eq!(json["distances_from"], "b1");
    assert!(json["pages"]["b3"]["rank"].as_f64().unwrap() > 0.0);
}

#[test]
fn empty_site_analyzes_cleanly() {
    let results = analyze(&KnowledgeGraph::new(), &SiteConfig::default());
    assert_eq!(results.node_count, 0);
    assert!(results.rank.scores.is_empty());
    assert!(results.communities.clusters.is_empty());
    assert!(results.distances.is_none());
    assert!(render_report(&results, ReportFormat::Simple).contains("nodes: 0"));
}
