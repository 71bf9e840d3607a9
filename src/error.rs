//! Rich diagnostic error types for sitegraph.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains. Per-artifact failures
//! never abort a build on their own: the scheduler collects them into its run
//! report, and these types only carry enough context to make that report
//! actionable.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for sitegraph.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum SiteError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Fingerprint errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum FingerprintError {
    #[error("input unreadable: {input}")]
    #[diagnostic(
        code(sitegraph::fingerprint::input_unreadable),
        help(
            "The input could not be read, so no fingerprint exists for it. \
             Only artifacts depending on this input are affected; check that \
             the file exists and is readable."
        )
    )]
    InputUnreadable {
        input: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config {path}")]
    #[diagnostic(
        code(sitegraph::config::read),
        help("Check that the configuration file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(sitegraph::config::parse),
        help("The file must be valid TOML. Unknown sections are ignored, known ones must type-check.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config {path}")]
    #[diagnostic(
        code(sitegraph::config::write),
        help("Check that the parent directory is writable.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config value for `{field}`: {message}")]
    #[diagnostic(
        code(sitegraph::config::invalid),
        help("Fix the value in sitegraph.toml or remove it to fall back to the default.")
    )]
    Invalid { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    #[diagnostic(
        code(sitegraph::store::io),
        help(
            "A filesystem operation failed. Check that the cache directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(sitegraph::store::redb),
        help(
            "The embedded cache database encountered a transaction error. \
             Deleting the cache directory forces a clean rebuild."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(sitegraph::store::serde),
        help(
            "Failed to serialize or deserialize persisted build state. \
             This usually means the on-disk format changed between versions."
        )
    )]
    Serialization { message: String },
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum GraphError {
    #[error("node not found: {node}")]
    #[diagnostic(
        code(sitegraph::graph::node_not_found),
        help("The page is not part of the current graph generation.")
    )]
    NodeNotFound { node: String },

    #[error("dangling edge rejected: {source_node} -> {target}")]
    #[diagnostic(
        code(sitegraph::graph::dangling_edge),
        help("Both endpoints of an edge must exist as nodes before the edge is inserted.")
    )]
    DanglingEdge { source_node: String, target: String },

    #[error("malformed reference in {node}: `{reference}` ({reason})")]
    #[diagnostic(
        code(sitegraph::graph::malformed_reference),
        severity(Warning),
        help("The reference was skipped. Fix the link syntax in the page source.")
    )]
    MalformedReference {
        node: String,
        reference: String,
        reason: String,
    },

    #[error("unresolved reference in {node}: `{target}` does not exist")]
    #[diagnostic(
        code(sitegraph::graph::unresolved_reference),
        severity(Warning),
        help(
            "The link target is not a known page. The edge is added automatically \
             once the target page appears."
        )
    )]
    UnresolvedReference { node: String, target: String },
}

// ---------------------------------------------------------------------------
// Cache errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum CacheError {
    #[error("producer failed for {fingerprint}: {reason}")]
    #[diagnostic(
        code(sitegraph::cache::producer_failed),
        help(
            "The failure is not cached; the next request for this fingerprint \
             retries production."
        )
    )]
    ProducerFailed { fingerprint: String, reason: String },

    #[error("timed out waiting for {fingerprint}")]
    #[diagnostic(
        code(sitegraph::cache::timeout),
        help("The build deadline passed while this artifact was being produced or awaited.")
    )]
    Timeout { fingerprint: String },

    #[error("production of {fingerprint} was cancelled")]
    #[diagnostic(
        code(sitegraph::cache::cancelled),
        help("The build was cancelled; no cache entry was written for this fingerprint.")
    )]
    Cancelled { fingerprint: String },

    #[error("persisted cache error: {message}")]
    #[diagnostic(
        code(sitegraph::cache::persist),
        help("The in-memory entry is still valid; only cross-run reuse is affected.")
    )]
    Persist { message: String },
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        CacheError::Persist {
            message: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ResourceError {
    #[error("no {backend} backend available for {kind} resources")]
    #[diagnostic(
        code(sitegraph::resource::backend_unavailable),
        help(
            "An optional processing backend is not installed. The caller decides \
             whether to skip the resource, copy it unprocessed, or fail the build."
        )
    )]
    BackendUnavailable { backend: String, kind: String },

    #[error("failed to decode {resource}: {message}")]
    #[diagnostic(
        code(sitegraph::resource::decode),
        help("The resource bytes do not match the declared kind or are truncated.")
    )]
    Decode { resource: String, message: String },

    #[error("invalid transform for {resource}: {message}")]
    #[diagnostic(
        code(sitegraph::resource::invalid_params),
        help("Check the requested width, height, and fit mode.")
    )]
    InvalidParams { resource: String, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] CacheError),
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("illegal state transition for {artifact}: {from} -> {to}")]
    #[diagnostic(
        code(sitegraph::scheduler::illegal_transition),
        help("This is a scheduler bug; artifact states only move forward.")
    )]
    IllegalTransition {
        artifact: String,
        from: String,
        to: String,
    },

    #[error("duplicate artifact in work list: {artifact}")]
    #[diagnostic(
        code(sitegraph::scheduler::duplicate_artifact),
        help("Each artifact id may appear once per run.")
    )]
    DuplicateArtifact { artifact: String },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("invalid engine configuration: {message}")]
    #[diagnostic(
        code(sitegraph::engine::invalid_config),
        help("Check the configuration values passed to Engine::new.")
    )]
    InvalidConfig { message: String },

    #[error("data directory error: {path}")]
    #[diagnostic(
        code(sitegraph::engine::data_dir),
        help(
            "The build state directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir { path: String },
}

/// Convenience alias for functions returning sitegraph results.
pub type SiteResult<T> = std::result::Result<T, SiteError>;
