//! Reference extraction from page bodies.
//!
//! Recognized forms:
//! - `[text](target)` markdown links become [`EdgeKind::Link`]
//! - `![alt](target)` images become [`EdgeKind::Embed`]
//! - `{{ ref "target" }}` and `{{< ref "target" >}}` shortcodes become [`EdgeKind::Reference`]
//!
//! Fenced code blocks are skipped. External URLs and pure `#anchor` links are
//! ignored silently; broken syntax is reported as [`GraphError::MalformedReference`].

use std::sync::LazyLock;

use regex::Regex;

use crate::content::{ContentPage, NodeId};
use crate::error::GraphError;

use super::EdgeKind;

static RE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(!?)\[([^\]]*)\]\(\s*([^)\s]*)(?:\s+"[^"]*")?\s*\)"#).expect("valid regex")
});

static RE_SHORTCODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\{[<%]?\s*(?:ref|relref)\s+"([^"]*)"\s*[>%]?\}\}"#).expect("valid regex")
});

static RE_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").expect("valid regex"));

/// One reference found in a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRef {
    pub target: NodeId,
    pub kind: EdgeKind,
}

/// Everything extracted from one page.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Resolved internal references, in document order.
    pub refs: Vec<ExtractedRef>,
    pub warnings: Vec<GraphError>,
}

/// How a raw link target resolves relative to the page containing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Internal(NodeId),
    External,
    Anchor,
}

/// Resolve a raw link target found in page `from`.
///
/// Relative targets resolve against the page's directory, a leading `/` is
/// root-relative, `#fragment` and `?query` are stripped, a trailing `/` maps to
/// `index.md`, and a target without an extension gets `.md`.
pub fn resolve_target(from: &NodeId, raw: &str) -> Resolution {
    let raw = raw.trim();
    if raw.starts_with("//") || RE_SCHEME.is_match(raw) {
        return Resolution::External;
    }
    let path = raw
        .split(['#', '?'])
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Resolution::Anchor;
    }

    let mut joined = match path.strip_prefix('/') {
        Some(rooted) => rooted.to_string(),
        None if from.parent().is_empty() => path.to_string(),
        None => format!("{}/{}", from.parent(), path),
    };
    if joined.ends_with('/') {
        joined.push_str("index.md");
    } else {
        let last = joined.rsplit('/').next().unwrap_or_default();
        if !last.contains('.') {
            joined.push_str(".md");
        }
    }
    Resolution::Internal(NodeId::new(joined))
}

/// Extract references from a page body.
pub fn extract_references(page: &ContentPage) -> Extraction {
    let mut extraction = Extraction::default();
    let mut in_fence = false;

    for line in page.body.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        scan_links(page, line, &mut extraction);
        scan_shortcodes(page, line, &mut extraction);
    }
    extraction
}

fn malformed(page: &ContentPage, reference: &str, reason: &str) -> GraphError {
    GraphError::MalformedReference {
        node: page.id.to_string(),
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

fn push_target(
    page: &ContentPage,
    raw: &str,
    whole: &str,
    kind: EdgeKind,
    extraction: &mut Extraction,
) {
    if raw.trim().is_empty() {
        extraction.warnings.push(malformed(page, whole, "empty target"));
        return;
    }
    if let Resolution::Internal(target) = resolve_target(&page.id, raw) {
        extraction.refs.push(ExtractedRef { target, kind });
    }
}

fn scan_links(page: &ContentPage, line: &str, extraction: &mut Extraction) {
    let mut covered: Vec<(usize, usize)> = Vec::new();
    for caps in RE_LINK.captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        covered.push((whole.start(), whole.end()));
        let kind = if caps.get(1).is_some_and(|m| !m.as_str().is_empty()) {
            EdgeKind::Embed
        } else {
            EdgeKind::Link
        };
        let raw = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        push_target(page, raw, whole.as_str(), kind, extraction);
    }

    // A `](` outside every complete link starts a link that never closes.
    for (pos, _) in line.match_indices("](") {
        if covered.iter().any(|&(s, e)| pos >= s && pos < e) {
            continue;
        }
        let start = line[..pos].rfind('[').unwrap_or(pos);
        extraction
            .warnings
            .push(malformed(page, &line[start..], "unterminated link"));
    }
}

fn scan_shortcodes(page: &ContentPage, line: &str, extraction: &mut Extraction) {
    let mut covered: Vec<(usize, usize)> = Vec::new();
    for caps in RE_SHORTCODE.captures_iter(line) {
        let Some(whole) = caps.get(0) else { continue };
        covered.push((whole.start(), whole.end()));
        let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        push_target(page, raw, whole.as_str(), EdgeKind::Reference, extraction);
    }

    for (pos, _) in line.match_indices("{{") {
        if covered.iter().any(|&(s, e)| pos >= s && pos < e) {
            continue;
        }
        let rest = &line[pos..];
        let head = rest.trim_start_matches(['{', '<', '%', ' ']);
        if !(head.starts_with("ref ") || head.starts_with("relref ")) {
            continue;
        }
        let reason = if rest.contains("}}") {
            "unquoted or malformed target"
        } else {
            "unterminated shortcode"
        };
        extraction.warnings.push(malformed(page, rest, reason));
    }
}
