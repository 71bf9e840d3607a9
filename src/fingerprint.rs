//! Content fingerprints for cache keys and staleness checks.
//!
//! A [`Fingerprint`] is a SHA-256 digest over canonicalized input. Every part
//! fed into a [`Fingerprinter`] is tagged with its kind and length-prefixed,
//! so a byte string can never collide with a metadata map that happens to
//! serialize to the same bytes. Metadata and option lists are hashed in sorted
//! key order: reordering front-matter fields never invalidates anything.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::FingerprintError;

/// Result type for fingerprint operations.
pub type FingerprintResult<T> = std::result::Result<T, FingerprintError>;

/// A 256-bit content fingerprint.
///
/// Serializes as a hex string in human-readable formats (JSON logs) and as raw
/// bytes otherwise (bincode cache metadata).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of raw bytes (tagged as a byte input).
    pub fn of_bytes(data: &[u8]) -> Self {
        Fingerprinter::new().bytes(data).finish()
    }

    /// Wrap an existing 32-byte digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let digest: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(digest))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Combine an ordered list of fingerprints. Order matters.
    pub fn combine(parts: &[Fingerprint]) -> Self {
        let mut fp = Fingerprinter::new();
        fp.tag(b'L', parts.len() as u64);
        for part in parts {
            fp.hasher.update(part.0);
        }
        fp.finish()
    }

    /// Combine a set of fingerprints. Order does not matter.
    pub fn combine_unordered(parts: &[Fingerprint]) -> Self {
        let mut sorted = parts.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut fp = Fingerprinter::new();
        fp.tag(b'S', sorted.len() as u64);
        for part in &sorted {
            fp.hasher.update(part.0);
        }
        fp.finish()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Fingerprint::from_hex(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint `{s}`")))
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Fingerprint)
        }
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({}..)", &self.to_hex()[..12])
    }
}

/// One fingerprintable input.
#[derive(Debug, Clone, Copy)]
pub enum FingerprintInput<'a> {
    /// Raw bytes already in memory.
    Bytes(&'a [u8]),
    /// Text content (hashed as UTF-8, tagged distinctly from bytes).
    Text(&'a str),
    /// A file on disk, read in full.
    File(&'a Path),
    /// Metadata fields; hashed in key order.
    Metadata(&'a BTreeMap<String, String>),
    /// Rendering/transform options; hashed in key order.
    Options(&'a [(&'a str, &'a str)]),
}

/// Compute the fingerprint of a single input.
///
/// Fails with [`FingerprintError::InputUnreadable`] when a file input cannot be read.
pub fn fingerprint(input: FingerprintInput<'_>) -> FingerprintResult<Fingerprint> {
    Ok(Fingerprinter::new().input(input)?.finish())
}

/// Incremental builder for fingerprints made of several parts.
#[derive(Clone)]
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Fingerprinter {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn tag(&mut self, kind: u8, len: u64) {
        self.hasher.update([kind]);
        self.hasher.update(len.to_le_bytes());
    }

    fn field(&mut self, data: &[u8]) {
        self.hasher.update((data.len() as u64).to_le_bytes());
        self.hasher.update(data);
    }

    /// Add raw bytes.
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.tag(b'B', data.len() as u64);
        self.hasher.update(data);
        self
    }

    /// Add text.
    pub fn text(mut self, text: &str) -> Self {
        self.tag(b'T', text.len() as u64);
        self.hasher.update(text.as_bytes());
        self
    }

    /// Add metadata fields in canonical (sorted) order.
    pub fn metadata(mut self, meta: &BTreeMap<String, String>) -> Self {
        self.tag(b'M', meta.len() as u64);
        for (k, v) in meta {
            self.field(k.as_bytes());
            self.field(v.as_bytes());
        }
        self
    }

    /// Add options in canonical (sorted) order. Duplicate keys keep their
    /// relative order so the result stays deterministic.
    pub fn options(mut self, opts: &[(&str, &str)]) -> Self {
        let mut sorted = opts.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        self.tag(b'O', sorted.len() as u64);
        for (k, v) in sorted {
            self.field(k.as_bytes());
            self.field(v.as_bytes());
        }
        self
    }

    /// Add another fingerprint as a part.
    pub fn fingerprint(mut self, fp: &Fingerprint) -> Self {
        self.tag(b'F', 32);
        self.hasher.update(fp.0);
        self
    }

    /// Add any [`FingerprintInput`].
    pub fn input(self, input: FingerprintInput<'_>) -> FingerprintResult<Self> {
        Ok(match input {
            FingerprintInput::Bytes(b) => self.bytes(b),
            FingerprintInput::Text(t) => self.text(t),
            FingerprintInput::Metadata(m) => self.metadata(m),
            FingerprintInput::Options(o) => self.options(o),
            FingerprintInput::File(path) => {
                let content =
                    std::fs::read(path).map_err(|e| FingerprintError::InputUnreadable {
                        input: path.display().to_string(),
                        source: e,
                    })?;
                self.bytes(&content)
            }
        })
    }

    /// Finish and return the fingerprint.
    pub fn finish(self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn deterministic() {
        let a = fingerprint(FingerprintInput::Text("hello world")).unwrap();
        let b = fingerprint(FingerprintInput::Text("hello world")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_differ() {
        let a = fingerprint(FingerprintInput::Text("hello")).unwrap();
        let b = fingerprint(FingerprintInput::Text("world")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn kinds_are_domain_separated() {
        let bytes = fingerprint(FingerprintInput::Bytes(b"abc")).unwrap();
        let text = fingerprint(FingerprintInput::Text("abc")).unwrap();
        assert_ne!(bytes, text);
    }

    #[test]
    fn metadata_field_order_is_irrelevant() {
        // BTreeMap already sorts, so build two maps by inserting in opposite orders.
        let mut first = BTreeMap::new();
        first.insert("title".to_string(), "Intro".to_string());
        first.insert("tags".to_string(), "rust".to_string());
        let mut second = BTreeMap::new();
        second.insert("tags".to_string(), "rust".to_string());
        second.insert("title".to_string(), "Intro".to_string());
        assert_eq!(
            fingerprint(FingerprintInput::Metadata(&first)).unwrap(),
            fingerprint(FingerprintInput::Metadata(&second)).unwrap()
        );
    }

    #[test]
    fn option_order_is_irrelevant() {
        let a = fingerprint(FingerprintInput::Options(&[("width", "200"), ("fit", "cover")]))
            .unwrap();
        let b = fingerprint(FingerprintInput::Options(&[("fit", "cover"), ("width", "200")]))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn key_value_boundaries_matter() {
        let a = fingerprint(FingerprintInput::Metadata(&meta(&[("ab", "c")]))).unwrap();
        let b = fingerprint(FingerprintInput::Metadata(&meta(&[("a", "bc")]))).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unreadable_file_is_an_error() {
        let result = fingerprint(FingerprintInput::File(Path::new("/nonexistent/page.md")));
        assert!(matches!(
            result,
            Err(FingerprintError::InputUnreadable { .. })
        ));
    }

    #[test]
    fn file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.md");
        std::fs::write(&path, b"# Title").unwrap();
        let from_file = fingerprint(FingerprintInput::File(&path)).unwrap();
        assert_eq!(from_file, Fingerprint::of_bytes(b"# Title"));
    }

    #[test]
    fn combine_is_ordered_and_unordered_variant_is_not() {
        let a = Fingerprint::of_bytes(b"a");
        let b = Fingerprint::of_bytes(b"b");
        assert_ne!(Fingerprint::combine(&[a, b]), Fingerprint::combine(&[b, a]));
        assert_eq!(
            Fingerprint::combine_unordered(&[a, b]),
            Fingerprint::combine_unordered(&[b, a])
        );
    }

    #[test]
    fn hex_display_and_parse() {
        let fp = Fingerprint::of_bytes(b"test");
        let s = fp.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(Fingerprint::from_hex(&s), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn debug_abbreviated() {
        let fp = Fingerprint::of_bytes(b"test");
        let s = format!("{fp:?}");
        assert!(s.starts_with("Fingerprint("));
        assert!(s.ends_with("..)"));
    }

    #[test]
    fn json_uses_hex_and_bincode_uses_bytes() {
        let fp = Fingerprint::of_bytes(b"serde test");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(fp, back);

        let bin = bincode::serialize(&fp).unwrap();
        assert_eq!(bin.len(), 32);
        let back: Fingerprint = bincode::deserialize(&bin).unwrap();
        assert_eq!(fp, back);
    }
}
