// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # sitegraph
//!
//! The incremental core of a static-site build: a content knowledge graph
//! with link analyses, and a provenance-tracking build engine that only
//! redoes work whose inputs changed.
//!
//! ## Architecture
//!
//! - **Fingerprints** (`fingerprint`): SHA-256 content identifiers with canonical ordering
//! - **Provenance** (`provenance`): artifact to input-fingerprint records, staleness, invalidation closure
//! - **Build cache** (`cache`): single-flight, content-addressed, LRU in memory, redb on disk
//! - **Knowledge graph** (`graph`): petgraph-backed pages and typed links, rebuilt incrementally
//! - **Analysis** (`analysis`): rank, communities, link suggestions, paths, structure, reports
//! - **Resources** (`resource`): image probing and stylesheet minification behind a shared result type
//! - **Scheduler** (`scheduler`): bounded worker pool with partial-failure isolation
//!
//! ## Library usage
//!
//! ```no_run
//! use sitegraph::content::{ContentPage, MemorySource};
//! use sitegraph::engine::{Engine, EngineConfig};
//!
//! let source = MemorySource::from_pages([
//!     ContentPage::new("index.md", "[About](about.md)"),
//!     ContentPage::new("about.md", "[Home](index.md)"),
//! ]);
//! let mut engine = Engine::new(EngineConfig::default()).unwrap();
//! let outcome = engine.build(&source, Vec::new()).unwrap();
//! println!("{}", outcome.report.summary());
//! ```

pub mod analysis;
pub mod cache;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod provenance;
pub mod resource;
pub mod scheduler;
