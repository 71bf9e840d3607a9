//! Engine facade: one site build, end to end.
//!
//! The `Engine` explicitly owns every piece of mutable build state (provenance
//! store, build cache, resource pipeline, current graph generation). Nothing
//! is global, so independent engines can build side by side.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::analysis::{AnalysisResults, AnalysisWarning, LinkSuggestion, ReportFormat, analyze, report_json};
use crate::cache::{BuildCache, BuildContext};
use crate::config::SiteConfig;
use crate::content::{ContentPage, ContentSource, NodeId};
use crate::error::{EngineError, GraphError, ResourceError, SiteResult};
use crate::fingerprint::Fingerprint;
use crate::graph::{GraphBuilder, GraphQuery, KnowledgeGraph};
use crate::provenance::{ArtifactId, InputId, ProvenanceLog, ProvenanceStore, unix_now};
use crate::resource::{ProcessedResourceData, ResourceDescriptor, ResourceKind, ResourcePipeline};
use crate::scheduler::{BuildJob, BuildScheduler, FailedArtifact, FailureReason, RunReport};

/// Version tag stamped on every provenance record and cached artifact.
pub const ENGINE_VERSION: &str = concat!("sitegraph-", env!("CARGO_PKG_VERSION"));

/// Artifact id of the analysis report.
pub const REPORT_ARTIFACT: &str = "report:analysis";

/// Subdirectory of the data directory holding the persisted cache.
const CACHE_SUBDIR: &str = "cache";

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub site: SiteConfig,
    /// Data directory for provenance and the persisted cache. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    pub engine_version: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::default(),
            data_dir: None,
            engine_version: ENGINE_VERSION.to_string(),
        }
    }
}

/// Everything one build produced.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub report: RunReport,
    pub analysis: Arc<AnalysisResults>,
    pub graph_warnings: Vec<GraphError>,
    pub analysis_warnings: Vec<AnalysisWarning>,
    /// Pages whose edges were re-extracted.
    pub recomputed: BTreeSet<NodeId>,
    /// Pages deleted since the previous build.
    pub removed: BTreeSet<NodeId>,
}

/// The sitegraph build engine.
pub struct Engine {
    config: EngineConfig,
    provenance: Arc<ProvenanceStore>,
    cache: Arc<BuildCache>,
    pipeline: Arc<ResourcePipeline>,
    graph: Arc<KnowledgeGraph>,
    analysis: Option<Arc<AnalysisResults>>,
}

impl Engine {
    /// Create an engine. With a data directory, the provenance log is loaded
    /// and the persisted cache opened from it.
    pub fn new(config: EngineConfig) -> SiteResult<Self> {
        config
            .site
            .validate()
            .map_err(|e| EngineError::InvalidConfig {
                message: e.to_string(),
            })?;

        let (provenance, cache) = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|_| EngineError::DataDir {
                    path: dir.display().to_string(),
                })?;
                let provenance = ProvenanceLog::load(dir, &config.engine_version);
                let cache = BuildCache::open(
                    &dir.join(CACHE_SUBDIR),
                    config.site.cache.clone(),
                    config.engine_version.clone(),
                )?;
                (provenance, cache)
            }
            None => (
                ProvenanceStore::new(config.engine_version.clone()),
                BuildCache::from_config(config.site.cache.clone(), config.engine_version.clone())?,
            ),
        };

        tracing::info!(
            version = %config.engine_version,
            persistent = config.data_dir.is_some(),
            records = provenance.len(),
            "initializing sitegraph engine"
        );

        Ok(Self {
            config,
            provenance: Arc::new(provenance),
            cache: Arc::new(cache),
            pipeline: Arc::new(ResourcePipeline::with_defaults()),
            graph: Arc::new(KnowledgeGraph::new()),
            analysis: None,
        })
    }

    /// Engine persisted under `dir`.
    pub fn open(dir: &Path, site: SiteConfig) -> SiteResult<Self> {
        Self::new(EngineConfig {
            site,
            data_dir: Some(dir.to_path_buf()),
            ..EngineConfig::default()
        })
    }

    /// Replace the resource pipeline, e.g. to install a rasterizer.
    pub fn with_pipeline(mut self, pipeline: ResourcePipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provenance(&self) -> &ProvenanceStore {
        &self.provenance
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// The current graph generation.
    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    /// Analysis of the current generation, once built.
    pub fn analysis(&self) -> Option<&AnalysisResults> {
        self.analysis.as_deref()
    }

    /// Run one incremental build over `source` and `resources`.
    pub fn build(
        &mut self,
        source: &dyn ContentSource,
        resources: Vec<ResourceDescriptor>,
    ) -> SiteResult<BuildOutcome> {
        let version = self.config.engine_version.clone();
        self.cache.evict_expired(unix_now())?;

        // Fingerprint every page and find what changed since the last generation.
        let mut pages: BTreeMap<NodeId, ContentPage> = BTreeMap::new();
        let mut unreadable: BTreeMap<NodeId, String> = BTreeMap::new();
        let mut changed: BTreeSet<NodeId> = BTreeSet::new();
        for id in source.ids() {
            match source.load(&id) {
                Ok(Some(page)) => {
                    let fp = page.fingerprint();
                    self.provenance.observe(InputId::content(&id), fp);
                    if self.graph.node(&id).map(|n| n.version) != Some(fp) {
                        changed.insert(id.clone());
                    }
                    pages.insert(id, page);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(page = %id, error = %e, "page unreadable");
                    unreadable.insert(id, e.to_string());
                }
            }
        }
        let assets: BTreeMap<NodeId, ResourceKind> = resources
            .iter()
            .map(|r| (NodeId::new(&r.id), r.kind))
            .collect();
        for id in self.graph.nodes() {
            if !pages.contains_key(&id) && !unreadable.contains_key(&id) && !assets.contains_key(&id) {
                self.provenance.forget_input(&InputId::content(&id));
                changed.insert(id);
            }
        }

        let rebuilt = GraphBuilder::rebuild_with(&self.graph, &changed, &assets, |id| {
            Ok(pages.get(id).map(Cow::Borrowed))
        });
        let graph = Arc::new(rebuilt.graph);
        let analysis = Arc::new(analyze(graph.as_ref(), &self.config.site));

        let mut jobs: Vec<Box<dyn BuildJob>> = Vec::with_capacity(pages.len() + resources.len() + 1);
        for (id, page) in pages {
            let data = PageAnalysis::from_results(&analysis, &id);
            jobs.push(Box::new(PageJob {
                analysis_fp: analysis.page_fingerprint(&id),
                page,
                data,
            }));
        }
        for descriptor in resources {
            jobs.push(Box::new(ResourceJob {
                descriptor,
                pipeline: Arc::clone(&self.pipeline),
            }));
        }
        jobs.push(Box::new(ReportJob {
            graph_fp: graph.fingerprint(),
            analysis: Arc::clone(&analysis),
        }));
        let live: BTreeSet<ArtifactId> = jobs.iter().map(|j| j.artifact_id()).collect();

        let scheduler = BuildScheduler::new(
            self.config.site.scheduler.clone(),
            Arc::clone(&self.provenance),
            Arc::clone(&self.cache),
            version,
        );
        let mut report = scheduler.run(jobs)?;

        for (id, message) in unreadable {
            report.failed.push(FailedArtifact {
                artifact: ArtifactId::page(&id),
                fingerprint: None,
                reason: FailureReason::Input(message),
            });
        }
        let elapsed = report.elapsed;
        let report = report.finish(elapsed);

        // Artifacts no longer produced by this site are dropped.
        for artifact in self.provenance.artifacts() {
            if !live.contains(&artifact) && !report.failed.iter().any(|f| f.artifact == artifact) {
                self.provenance.evict(&artifact);
            }
        }

        tracing::info!(summary = %report.summary(), "build finished");
        self.graph = graph;
        self.analysis = Some(Arc::clone(&analysis));

        Ok(BuildOutcome {
            report,
            analysis_warnings: analysis.warnings.clone(),
            analysis,
            graph_warnings: rebuilt.warnings,
            recomputed: rebuilt.recomputed,
            removed: rebuilt.removed,
        })
    }

    /// Persist the provenance log. A memory-only engine has nothing to save.
    pub fn save(&self) -> SiteResult<()> {
        if let Some(dir) = &self.config.data_dir {
            let path = ProvenanceLog::save(&self.provenance, dir)?;
            tracing::debug!(path = %path.display(), "provenance saved");
        }
        Ok(())
    }

    /// Drop expired cached artifacts, then those no recorded artifact refers to.
    pub fn gc(&self) -> SiteResult<usize> {
        self.gc_at(unix_now())
    }

    /// [`gc`](Self::gc) with `now` in seconds since the Unix epoch.
    pub fn gc_at(&self, now: u64) -> SiteResult<usize> {
        let expired = self.cache.evict_expired(now)?;
        let unreferenced = self.cache.gc(&self.provenance.live_outputs())?;
        Ok(expired + unreferenced)
    }

    /// Process one resource outside a scheduled build.
    pub fn process_resource(&self, descriptor: &ResourceDescriptor) -> SiteResult<ProcessedResourceData> {
        Ok(self.pipeline.process_cached(
            descriptor,
            &self.cache,
            &self.provenance,
            &BuildContext::new(),
        )?)
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            version: self.config.engine_version.clone(),
            node_count: self.graph.node_count(),
            edge_count: self.graph.edge_count(),
            artifact_count: self.provenance.len(),
            cached_count: self.cache.len(),
            persistent: self.config.data_dir.is_some(),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("nodes", &self.graph.node_count())
            .field("artifacts", &self.provenance.len())
            .finish()
    }
}

/// Summary information about the engine state.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub version: String,
    pub node_count: usize,
    pub edge_count: usize,
    pub artifact_count: usize,
    pub cached_count: usize,
    pub persistent: bool,
}

impl std::fmt::Display for EngineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "sitegraph engine info")?;
        writeln!(f, "  version:      {}", self.version)?;
        writeln!(f, "  nodes:        {}", self.node_count)?;
        writeln!(f, "  edges:        {}", self.edge_count)?;
        writeln!(f, "  artifacts:    {}", self.artifact_count)?;
        writeln!(f, "  cached:       {}", self.cached_count)?;
        writeln!(f, "  persistent:   {}", self.persistent)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Build jobs
// ---------------------------------------------------------------------------

/// Graph-derived data embedded in a rendered page.
#[derive(Debug, Clone, Serialize)]
struct PageAnalysis {
    rank: f64,
    cluster: Option<usize>,
    suggestions: Vec<LinkSuggestion>,
}

impl PageAnalysis {
    fn from_results(results: &AnalysisResults, id: &NodeId) -> Self {
        Self {
            rank: results.rank.scores.get(id).unwrap_or(0.0),
            cluster: results.communities.cluster_of(id),
            suggestions: results.suggestions.get(id).cloned().unwrap_or_default(),
        }
    }
}

#[derive(Serialize)]
struct RenderedPage<'a> {
    id: &'a NodeId,
    metadata: &'a BTreeMap<String, String>,
    body: &'a str,
    analysis: &'a PageAnalysis,
}

/// A page artifact depends on the page content and on its slice of the
/// analysis.
struct PageJob {
    page: ContentPage,
    data: PageAnalysis,
    analysis_fp: Fingerprint,
}

impl BuildJob for PageJob {
    fn artifact_id(&self) -> ArtifactId {
        ArtifactId::page(&self.page.id)
    }

    fn inputs(&self) -> Vec<(InputId, Fingerprint)> {
        vec![
            (InputId::content(&self.page.id), self.page.fingerprint()),
            (
                InputId::new(format!("analysis:{}", self.page.id)),
                self.analysis_fp,
            ),
        ]
    }

    fn produce(&self, _ctx: &BuildContext) -> Result<Vec<u8>, String> {
        let rendered = RenderedPage {
            id: &self.page.id,
            metadata: &self.page.metadata,
            body: &self.page.body,
            analysis: &self.data,
        };
        serde_json::to_vec_pretty(&rendered).map_err(|e| e.to_string())
    }
}

struct ResourceJob {
    descriptor: ResourceDescriptor,
    pipeline: Arc<ResourcePipeline>,
}

impl BuildJob for ResourceJob {
    fn artifact_id(&self) -> ArtifactId {
        ArtifactId::resource(&self.descriptor.id)
    }

    fn inputs(&self) -> Vec<(InputId, Fingerprint)> {
        vec![
            (
                self.descriptor.input_id(),
                Fingerprint::of_bytes(&self.descriptor.bytes),
            ),
            (
                InputId::new(format!("transform:{}", self.descriptor.id)),
                self.descriptor.fingerprint(),
            ),
        ]
    }

    fn produce(&self, ctx: &BuildContext) -> Result<Vec<u8>, String> {
        ctx.check().map_err(|i| i.to_string())?;
        let data = match self.pipeline.process(&self.descriptor) {
            Ok(data) => data,
            // No backend: ship the resource unprocessed.
            Err(ResourceError::BackendUnavailable { backend, kind }) => {
                tracing::warn!(
                    resource = %self.descriptor.id,
                    %backend,
                    %kind,
                    "backend unavailable, copying resource unprocessed"
                );
                ProcessedResourceData {
                    width: None,
                    height: None,
                    format: "original".into(),
                    bytes: self.descriptor.bytes.clone(),
                    metadata: BTreeMap::from([("unprocessed".to_string(), backend)]),
                }
            }
            Err(e) => return Err(e.to_string()),
        };
        bincode::serialize(&data).map_err(|e| e.to_string())
    }
}

struct ReportJob {
    graph_fp: Fingerprint,
    analysis: Arc<AnalysisResults>,
}

impl BuildJob for ReportJob {
    fn artifact_id(&self) -> ArtifactId {
        ArtifactId::new(REPORT_ARTIFACT)
    }

    fn inputs(&self) -> Vec<(InputId, Fingerprint)> {
        vec![(InputId::new("graph"), self.graph_fp)]
    }

    fn produce(&self, _ctx: &BuildContext) -> Result<Vec<u8>, String> {
        serde_json::to_vec_pretty(&report_json(&self.analysis, ReportFormat::Detailed))
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MemorySource;

    fn site() -> MemorySource {
        MemorySource::from_pages([
            ContentPage::new("index.md", "[a](a.md) [b](b.md)").with_meta("title", "Home"),
            ContentPage::new("a.md", "[b](b.md)").with_meta("tags", "rust"),
            ContentPage::new("b.md", "[index](index.md)").with_meta("tags", "rust"),
        ])
    }

    #[test]
    fn create_memory_only_engine() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let info = engine.info();
        assert!(!info.persistent);
        assert_eq!(info.node_count, 0);
        assert!(info.version.starts_with("sitegraph-"));
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.site.rank.damping = 2.0;
        assert!(Engine::new(config).is_err());
    }

    #[test]
    fn first_build_then_no_op() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let source = site();

        let first = engine.build(&source, Vec::new()).unwrap();
        assert!(first.report.is_success());
        // Three pages plus the report.
        assert_eq!(first.report.succeeded.len(), 4);
        assert_eq!(engine.graph().node_count(), 3);

        let second = engine.build(&source, Vec::new()).unwrap();
        assert!(second.recomputed.is_empty());
        assert_eq!(second.report.up_to_date(), 4);
    }

    #[test]
    fn edited_page_rebuilds_only_itself_and_report() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let source = site();
        engine.build(&source, Vec::new()).unwrap();

        // Same links, so the analysis and every other page stay current. The
        // report follows the graph generation, which includes node versions.
        source.insert(ContentPage::new("a.md", "[b](b.md) more words").with_meta("tags", "rust"));
        let outcome = engine.build(&source, Vec::new()).unwrap();
        assert_eq!(outcome.recomputed, BTreeSet::from([NodeId::new("a.md")]));
        assert_eq!(
            outcome.report.succeeded,
            vec![ArtifactId::new("page:a.md"), ArtifactId::new(REPORT_ARTIFACT)]
        );
    }

    #[test]
    fn deleted_page_is_evicted() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let source = site();
        engine.build(&source, Vec::new()).unwrap();
        source.remove(&NodeId::new("a.md"));

        let outcome = engine.build(&source, Vec::new()).unwrap();
        assert_eq!(outcome.removed, BTreeSet::from([NodeId::new("a.md")]));
        assert!(engine.provenance().get(&ArtifactId::new("page:a.md")).is_none());
        assert!(!engine.graph().contains(&NodeId::new("a.md")));
    }

    #[test]
    fn missing_backend_degrades_resource() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let font = ResourceDescriptor::new("font.woff2", ResourceKind::Other, vec![0, 1, 2]);
        let outcome = engine.build(&MemorySource::new(), vec![font]).unwrap();
        assert!(outcome.report.is_success());
        assert!(
            outcome
                .report
                .succeeded
                .contains(&ArtifactId::new("resource:font.woff2"))
        );
    }

    #[test]
    fn gc_drops_expired_artifacts() {
        let mut config = EngineConfig::default();
        config.site.cache.max_age_secs = Some(60);
        let mut engine = Engine::new(config).unwrap();
        let source = site();
        engine.build(&source, Vec::new()).unwrap();
        assert_eq!(engine.cache().len(), 4);

        // Everything is still referenced, so only age can remove it.
        assert_eq!(engine.gc().unwrap(), 0);
        assert_eq!(engine.gc_at(unix_now() + 3_600).unwrap(), 4);
        assert!(engine.cache().is_empty());

        // Expired outputs are produced again.
        let outcome = engine.build(&source, Vec::new()).unwrap();
        assert_eq!(outcome.report.succeeded.len(), 4);
    }

    #[test]
    fn resources_are_link_targets() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        let source = MemorySource::from_pages([ContentPage::new("index.md", "![logo](logo.png)")]);
        let logo = ResourceDescriptor::new("logo.png", ResourceKind::Other, vec![1, 2, 3]);

        let outcome = engine.build(&source, vec![logo]).unwrap();
        assert!(outcome.graph_warnings.is_empty());
        let edges = engine.graph().edges_from(&NodeId::new("index.md"));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target, NodeId::new("logo.png"));

        // Dropping the asset leaves the embed unresolved again.
        let outcome = engine.build(&source, Vec::new()).unwrap();
        assert_eq!(outcome.removed, BTreeSet::from([NodeId::new("logo.png")]));
        assert!(engine.graph().edges_from(&NodeId::new("index.md")).is_empty());
        assert!(outcome.graph_warnings.iter().any(|w| matches!(
            w,
            GraphError::UnresolvedReference { target, .. } if target == "logo.png"
        )));
    }

    #[test]
    fn persisted_engine_reuses_work() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = site();
        {
            let mut engine = Engine::open(dir.path(), SiteConfig::default()).unwrap();
            engine.build(&source, Vec::new()).unwrap();
            engine.save().unwrap();
        }
        let mut engine = Engine::open(dir.path(), SiteConfig::default()).unwrap();
        assert!(engine.info().persistent);
        let outcome = engine.build(&source, Vec::new()).unwrap();
        // The graph is rebuilt in memory, but no artifact is produced again.
        assert_eq!(outcome.report.up_to_date(), 4);
        assert_eq!(engine.cache().stats().productions, 0);
    }
}
