//! Resource pipeline: binary assets in, backend-agnostic results out.
//!
//! A [`ResourceDescriptor`] carries the raw bytes and the requested transform.
//! Backends turn it into a [`ProcessedResourceData`], which knows nothing about
//! the caller's own resource type; callers pair the two themselves through
//! [`ProcessedResource`].

pub mod css;
pub mod image;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::{BuildCache, BuildContext, ProducedArtifact};
use crate::error::ResourceError;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::provenance::{ArtifactId, InputId, ProvenanceStore};

pub use css::StylesheetMinifier;
pub use image::{ImageFormat, ImageInfo, ImageProbe, Rasterizer};

/// Result type for resource processing.
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

/// Broad class of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Image,
    Stylesheet,
    Other,
}

impl ResourceKind {
    /// Guess the kind from a file extension.
    pub fn from_path(path: &str) -> Self {
        let lower = path.to_lowercase();
        let ext = lower.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        match ext {
            "png" | "gif" | "jpg" | "jpeg" | "webp" => ResourceKind::Image,
            "css" => ResourceKind::Stylesheet,
            _ => ResourceKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Image => "image",
            ResourceKind::Stylesheet => "stylesheet",
            ResourceKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an image is fitted into the requested box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Scale to fit inside the box, keeping the aspect ratio.
    #[default]
    Contain,
    /// Scale to fill the box, keeping the aspect ratio, then crop.
    Cover,
    /// Stretch to the exact box.
    Exact,
}

impl Fit {
    pub fn as_str(self) -> &'static str {
        match self {
            Fit::Contain => "contain",
            Fit::Cover => "cover",
            Fit::Exact => "exact",
        }
    }
}

/// Requested transform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformParams {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fit: Fit,
    /// Output format; `None` keeps the source format.
    pub format: Option<String>,
    pub minify: bool,
    pub quality: Option<u8>,
}

impl TransformParams {
    /// Canonical `(key, value)` pairs, used for fingerprinting.
    fn canonical(&self) -> Vec<(&'static str, String)> {
        let opt = |v: Option<u32>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        vec![
            ("width", opt(self.width)),
            ("height", opt(self.height)),
            ("fit", self.fit.as_str().to_string()),
            ("format", self.format.clone().unwrap_or_else(|| "-".into())),
            ("minify", self.minify.to_string()),
            ("quality", opt(self.quality.map(u32::from))),
        ]
    }
}

/// A resource to process: its bytes plus the transform to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub id: String,
    pub kind: ResourceKind,
    pub bytes: Vec<u8>,
    pub params: TransformParams,
    /// Caller override for the optional decoding backend. `Some(false)`
    /// forces the pipeline to behave as if no backend were installed.
    pub backend_available: Option<bool>,
}

impl ResourceDescriptor {
    pub fn new(id: impl Into<String>, kind: ResourceKind, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            kind,
            bytes,
            params: TransformParams::default(),
            backend_available: None,
        }
    }

    pub fn with_params(mut self, params: TransformParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_backend_available(mut self, available: bool) -> Self {
        self.backend_available = Some(available);
        self
    }

    /// Fingerprint of the bytes, kind and canonical parameters. This is the
    /// cache key of the processed output.
    pub fn fingerprint(&self) -> Fingerprint {
        let params = self.params.canonical();
        let pairs: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Fingerprinter::new()
            .text("resource")
            .text(self.kind.as_str())
            .bytes(&self.bytes)
            .options(&pairs)
            .finish()
    }

    /// The input id the source bytes are tracked under.
    pub fn input_id(&self) -> InputId {
        InputId::new(format!("asset:{}", self.id))
    }

    fn unavailable(&self, backend: &str) -> ResourceError {
        ResourceError::BackendUnavailable {
            backend: backend.into(),
            kind: self.kind.to_string(),
        }
    }
}

/// Output of processing, with no link back to the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedResourceData {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: String,
    pub bytes: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

/// A caller's own resource paired with its processed data.
#[derive(Debug, Clone)]
pub struct ProcessedResource<R> {
    pub source: R,
    pub data: ProcessedResourceData,
}

impl<R> ProcessedResource<R> {
    pub fn new(source: R, data: ProcessedResourceData) -> Self {
        Self { source, data }
    }
}

/// A processing backend for one or more resource kinds.
pub trait ResourceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, kind: ResourceKind) -> bool;

    /// Must be deterministic: the same descriptor yields the same data.
    fn process(&self, descriptor: &ResourceDescriptor) -> ResourceResult<ProcessedResourceData>;
}

/// Dispatches descriptors to the first backend that supports their kind.
pub struct ResourcePipeline {
    backends: Vec<Box<dyn ResourceBackend>>,
}

impl Default for ResourcePipeline {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ResourcePipeline {
    /// A pipeline with no backends.
    pub fn empty() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    /// Image probing (no rasterizer) and stylesheet minification.
    pub fn with_defaults() -> Self {
        Self::empty()
            .with_backend(ImageProbe::new())
            .with_backend(StylesheetMinifier)
    }

    pub fn with_backend(mut self, backend: impl ResourceBackend + 'static) -> Self {
        self.backends.push(Box::new(backend));
        self
    }

    fn backend_for(&self, descriptor: &ResourceDescriptor) -> ResourceResult<&dyn ResourceBackend> {
        self.backends
            .iter()
            .find(|b| b.supports(descriptor.kind))
            .map(|b| b.as_ref())
            .ok_or_else(|| descriptor.unavailable("any"))
    }

    /// Process one descriptor.
    pub fn process(&self, descriptor: &ResourceDescriptor) -> ResourceResult<ProcessedResourceData> {
        let backend = self.backend_for(descriptor)?;
        tracing::debug!(resource = %descriptor.id, backend = backend.name(), "processing resource");
        backend.process(descriptor)
    }

    /// Process through the build cache and record provenance.
    ///
    /// The cache key is [`ResourceDescriptor::fingerprint`]; the payload is the
    /// bincode-encoded [`ProcessedResourceData`]. A missing backend is
    /// reported before the cache is touched.
    pub fn process_cached(
        &self,
        descriptor: &ResourceDescriptor,
        cache: &BuildCache,
        provenance: &ProvenanceStore,
        ctx: &BuildContext,
    ) -> ResourceResult<ProcessedResourceData> {
        self.backend_for(descriptor)?;
        let key = descriptor.fingerprint();
        let source_fp = Fingerprint::of_bytes(&descriptor.bytes);

        let artifact = cache.get_or_produce_with(key, ctx, |ctx| {
            ctx.check().map_err(|i| i.to_string())?;
            let data = self.process(descriptor).map_err(|e| e.to_string())?;
            let bytes = bincode::serialize(&data).map_err(|e| e.to_string())?;
            Ok(ProducedArtifact::new(bytes).with_inputs(vec![source_fp]))
        })?;

        let data: ProcessedResourceData =
            bincode::deserialize(&artifact.bytes).map_err(|e| ResourceError::Decode {
                resource: descriptor.id.clone(),
                message: format!("cached payload: {e}"),
            })?;

        provenance.observe(descriptor.input_id(), source_fp);
        provenance.record(
            ArtifactId::resource(&descriptor.id),
            vec![(descriptor.input_id(), source_fp)],
            Some(key),
            cache.engine_version(),
        );
        Ok(data)
    }
}
