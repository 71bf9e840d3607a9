//! Content inputs: pages and the sources that provide them.
//!
//! The knowledge graph is derived entirely from a [`ContentSource`]; it is never
//! a source of truth itself. Two sources are provided: [`MemorySource`] for
//! programmatic use and tests, and [`DirectorySource`], which scans a content
//! root for markdown pages with optional `key: value` front matter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::FingerprintError;
use crate::fingerprint::{Fingerprint, FingerprintResult, Fingerprinter};

/// Identity of a content node: a normalized, `/`-separated page path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Normalize a path-like string into a node id.
    ///
    /// Backslashes become slashes, `.` segments are dropped and `..` segments
    /// pop their parent. Leading slashes are stripped.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().replace('\\', "/");
        let mut segments: Vec<&str> = Vec::new();
        for seg in raw.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s),
            }
        }
        Self(segments.join("/"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory part of the id (empty for top-level pages).
    pub fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

/// A single content page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPage {
    /// Page identity.
    pub id: NodeId,
    /// Page body (front matter removed).
    pub body: String,
    /// Front-matter metadata.
    pub metadata: BTreeMap<String, String>,
}

impl ContentPage {
    /// Create a page without metadata.
    pub fn new(id: impl Into<NodeId>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata field.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Parse a raw page (optional front matter + body).
    pub fn parse(id: impl Into<NodeId>, raw: &str) -> Self {
        let (metadata, body) = split_front_matter(raw);
        Self {
            id: id.into(),
            body: body.to_string(),
            metadata,
        }
    }

    /// Content fingerprint: body plus canonicalized metadata.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprinter::new()
            .text(&self.body)
            .metadata(&self.metadata)
            .finish()
    }
}

/// Split `---`-fenced front matter from the body.
fn split_front_matter(raw: &str) -> (BTreeMap<String, String>, &str) {
    let mut metadata = BTreeMap::new();
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return (metadata, raw);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim();
        if trimmed == "---" {
            for entry in rest[..offset - line.len()].lines() {
                if let Some((key, value)) = entry.split_once(':') {
                    let key = key.trim();
                    if key.is_empty() {
                        continue;
                    }
                    let value = value.trim().trim_matches('"').trim_matches('\'');
                    metadata.insert(key.to_string(), value.to_string());
                }
            }
            return (metadata, &rest[offset..]);
        }
    }
    // Unterminated front matter: treat everything as body.
    (BTreeMap::new(), raw)
}

/// Provider of content pages.
pub trait ContentSource: Send + Sync {
    /// All page ids currently available, sorted.
    fn ids(&self) -> Vec<NodeId>;

    /// Load a page. `Ok(None)` means the page no longer exists.
    fn load(&self, id: &NodeId) -> FingerprintResult<Option<ContentPage>>;
}

/// In-memory content source.
#[derive(Debug, Default)]
pub struct MemorySource {
    pages: RwLock<BTreeMap<NodeId, ContentPage>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from pages.
    pub fn from_pages(pages: impl IntoIterator<Item = ContentPage>) -> Self {
        let source = Self::new();
        for page in pages {
            source.insert(page);
        }
        source
    }

    /// Insert or replace a page.
    pub fn insert(&self, page: ContentPage) {
        self.pages
            .write()
            .expect("content lock poisoned")
            .insert(page.id.clone(), page);
    }

    /// Remove a page.
    pub fn remove(&self, id: &NodeId) -> Option<ContentPage> {
        self.pages.write().expect("content lock poisoned").remove(id)
    }
}

impl ContentSource for MemorySource {
    fn ids(&self) -> Vec<NodeId> {
        self.pages
            .read()
            .expect("content lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn load(&self, id: &NodeId) -> FingerprintResult<Option<ContentPage>> {
        Ok(self
            .pages
            .read()
            .expect("content lock poisoned")
            .get(id)
            .cloned())
    }
}

/// Content source backed by a directory of markdown files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    extension: String,
}

impl DirectorySource {
    /// Scan `root` for `*.md` pages.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "md".to_string(),
        }
    }

    /// Use a different page extension.
    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = ext.into();
        self
    }

    /// Content root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, id: &NodeId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

impl ContentSource for DirectorySource {
    fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry.path().extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
            })
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(&self.root).ok()?;
                Some(NodeId::new(rel.to_string_lossy()))
            })
            .collect();
        ids.sort();
        ids
    }

    fn load(&self, id: &NodeId) -> FingerprintResult<Option<ContentPage>> {
        let path = self.path_of(id);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(ContentPage::parse(id.clone(), &raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FingerprintError::InputUnreadable {
                input: path.display().to_string(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_normalizes_paths() {
        assert_eq!(NodeId::new("./docs/intro.md").as_str(), "docs/intro.md");
        assert_eq!(NodeId::new("/docs//intro.md").as_str(), "docs/intro.md");
        assert_eq!(NodeId::new("docs/a/../intro.md").as_str(), "docs/intro.md");
        assert_eq!(NodeId::new("docs\\intro.md").as_str(), "docs/intro.md");
    }

    #[test]
    fn node_id_parent() {
        assert_eq!(NodeId::new("docs/guide/intro.md").parent(), "docs/guide");
        assert_eq!(NodeId::new("index.md").parent(), "");
    }

    #[test]
    fn parse_front_matter() {
        let page = ContentPage::parse(
            "post.md",
            "---\ntitle: \"Hello\"\ntags: rust, graphs\n---\nBody text\n",
        );
        assert_eq!(page.metadata.get("title").map(String::as_str), Some("Hello"));
        assert_eq!(
            page.metadata.get("tags").map(String::as_str),
            Some("rust, graphs")
        );
        assert_eq!(page.body, "Body text\n");
    }

    #[test]
    fn unterminated_front_matter_is_body() {
        let raw = "---\ntitle: x\nno closing fence";
        let page = ContentPage::parse("p.md", raw);
        assert!(page.metadata.is_empty());
        assert_eq!(page.body, raw);
    }

    #[test]
    fn fingerprint_tracks_body_and_metadata() {
        let a = ContentPage::new("a.md", "body").with_meta("title", "A");
        let b = ContentPage::new("a.md", "body").with_meta("title", "B");
        let c = ContentPage::new("a.md", "body").with_meta("title", "A");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn memory_source_insert_and_remove() {
        let source = MemorySource::new();
        source.insert(ContentPage::new("b.md", "b"));
        source.insert(ContentPage::new("a.md", "a"));
        assert_eq!(source.ids(), vec![NodeId::new("a.md"), NodeId::new("b.md")]);
        source.remove(&NodeId::new("a.md"));
        assert!(source.load(&NodeId::new("a.md")).unwrap().is_none());
    }

    #[test]
    fn directory_source_scans_markdown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("index.md"), "home").unwrap();
        std::fs::write(dir.path().join("docs/guide.md"), "---\ntitle: Guide\n---\ntext").unwrap();
        std::fs::write(dir.path().join("style.css"), "body{}").unwrap();

        let source = DirectorySource::new(dir.path());
        let ids = source.ids();
        assert_eq!(ids, vec![NodeId::new("docs/guide.md"), NodeId::new("index.md")]);

        let guide = source.load(&NodeId::new("docs/guide.md")).unwrap().unwrap();
        assert_eq!(guide.metadata["title"], "Guide");
        assert!(source.load(&NodeId::new("missing.md")).unwrap().is_none());
    }
}
