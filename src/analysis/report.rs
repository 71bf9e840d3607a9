//! Text and JSON analysis reports.
//!
//! Both formats are deterministic for a given snapshot: nodes are listed in
//! sorted order and floats are printed with six decimals.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{AnalysisResults, Distance};

/// How much detail a report carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Summary counts only.
    #[default]
    Simple,
    /// Summary plus a per-node breakdown.
    Detailed,
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ReportFormat::Simple => "simple",
            ReportFormat::Detailed => "detailed",
        })
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(ReportFormat::Simple),
            "detailed" => Ok(ReportFormat::Detailed),
            other => Err(format!("unknown report format `{other}` (expected simple or detailed)")),
        }
    }
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

/// Render a plain-text report.
pub fn render_report(results: &AnalysisResults, format: ReportFormat) -> String {
    let mut out = String::new();
    let s = &results.structure;
    // Writing to a String cannot fail.
    let _ = writeln!(out, "nodes: {}", results.node_count);
    let _ = writeln!(out, "edges: {}", results.edge_count);
    let _ = writeln!(out, "clusters: {}", results.communities.clusters.len());
    let _ = writeln!(out, "orphans: {}", s.orphans.len());
    let _ = writeln!(out, "hubs: {}", s.hubs.len());
    let _ = writeln!(out, "density: {:.6}", s.density);
    let _ = writeln!(out, "diameter: {}", results.centrality.diameter);
    let _ = writeln!(out, "warnings: {}", results.warnings.len());
    for warning in &results.warnings {
        let _ = writeln!(out, "  warning: {warning}");
    }

    if format == ReportFormat::Simple {
        return out;
    }

    let bottlenecks = results.centrality.bottlenecks(5);
    if !bottlenecks.is_empty() {
        let _ = writeln!(out, "\nbottlenecks:");
        for (id, b) in bottlenecks {
            let _ = writeln!(out, "  {id} {b:.6}");
        }
    }

    let origin = results.distances.as_ref();
    if let Some((top, _)) = origin {
        let _ = writeln!(out, "\ndistances from: {top}");
    }
    for (id, score) in results.rank.scores.iter() {
        let _ = writeln!(out, "\n{id}");
        let _ = writeln!(out, "  rank: {score:.6}");
        if let Some(cluster) = results.communities.cluster_of(id) {
            let _ = writeln!(out, "  cluster: {cluster}");
        }
        let betweenness = results.centrality.betweenness.get(id).copied().unwrap_or(0.0);
        let _ = writeln!(out, "  betweenness: {betweenness:.6}");
        if let Some(d) = origin.and_then(|(_, d)| d.get(id)) {
            let _ = writeln!(out, "  distance: {d}");
        }
        for suggestion in results.suggestions.get(id).map(Vec::as_slice).unwrap_or_default() {
            let _ = writeln!(
                out,
                "  suggest: {} ({:.6})",
                suggestion.target, suggestion.score
            );
        }
    }
    out
}

/// Render a JSON report.
pub fn report_json(results: &AnalysisResults, format: ReportFormat) -> Value {
    let s = &results.structure;
    let mut report = json!({
        "format": format.to_string(),
        "nodes": results.node_count,
        "edges": results.edge_count,
        "clusters": results.communities.clusters.len(),
        "orphans": s.orphans.len(),
        "hubs": s.hubs.len(),
        "density": round6(s.density),
        "diameter": results.centrality.diameter,
        "average_path_length": round6(results.centrality.average_path_length),
        "approximate_paths": results.centrality.approximate,
        "warnings": results.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
    });
    if format == ReportFormat::Simple {
        return report;
    }

    let distances = results.distances.as_ref();
    let mut pages = serde_json::Map::new();
    for (id, score) in results.rank.scores.iter() {
        let suggestions: Vec<Value> = results
            .suggestions
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|s| json!({ "target": s.target.as_str(), "score": round6(s.score) }))
            .collect();
        let distance = match distances.and_then(|(_, d)| d.get(id)) {
            Some(Distance::Hops(n)) => json!(n),
            Some(Distance::Unreachable) => json!("unreachable"),
            None => Value::Null,
        };
        pages.insert(
            id.to_string(),
            json!({
                "rank": round6(score),
                "cluster": results.communities.cluster_of(id),
                "betweenness": round6(results.centrality.betweenness.get(id).copied().unwrap_or(0.0)),
                "closeness": round6(results.centrality.closeness.get(id).copied().unwrap_or(0.0)),
                "distance": distance,
                "suggestions": suggestions,
            }),
        );
    }
    report["distances_from"] = json!(distances.map(|(top, _)| top.as_str()));
    report["pages"] = Value::Object(pages);
    report
}
