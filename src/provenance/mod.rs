//! Provenance: which input fingerprints each artifact was built from.
//!
//! The store answers two questions. Forward: is this artifact stale? Reverse:
//! which artifacts depend on this fingerprint (or on this input)? Artifacts may
//! consume other artifacts by recording the producer's id as an [`InputId`]
//! together with its output fingerprint, so invalidation propagates through
//! chains of derived artifacts.
//!
//! Staleness caused by inputs is derived on every query, so an input that
//! reverts to its recorded fingerprint makes its consumers fresh again. Only
//! [`ProvenanceStore::invalidate`] leaves a mark, which holds until the
//! artifact is recorded again.
//!
//! All maps are `DashMap`s: concurrent workers record provenance for different
//! artifacts without a global lock.

pub mod log;

use std::collections::{BTreeSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::content::NodeId;
use crate::fingerprint::Fingerprint;

pub use log::ProvenanceLog;

/// Identity of a build artifact (`page:docs/intro.md`, `resource:logo.png`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Rendered page artifact.
    pub fn page(node: &NodeId) -> Self {
        Self(format!("page:{node}"))
    }

    /// Processed resource artifact.
    pub fn resource(id: &str) -> Self {
        Self(format!("resource:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a build input (a content page, a resource file, or another artifact).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputId(String);

impl InputId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Source content of a page.
    pub fn content(node: &NodeId) -> Self {
        Self(format!("content:{node}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InputId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An artifact consumed as an input is identified by the artifact's own id.
impl From<&ArtifactId> for InputId {
    fn from(artifact: &ArtifactId) -> Self {
        Self(artifact.0.clone())
    }
}

/// What one artifact was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub artifact: ArtifactId,
    /// Inputs and the fingerprints they had when the artifact was built.
    pub inputs: Vec<(InputId, Fingerprint)>,
    pub engine_version: String,
    /// Fingerprint of the produced output, when it can be consumed downstream.
    pub output: Option<Fingerprint>,
    /// Seconds since the Unix epoch.
    pub recorded_at: u64,
}

/// Why an artifact must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleReason {
    /// No provenance exists (new artifact, evicted record, or lost log).
    NeverBuilt,
    /// Built by a different engine version.
    EngineVersion { recorded: String, current: String },
    /// An input's current fingerprint differs from the recorded one.
    InputChanged(InputId),
    /// An input no longer exists.
    InputMissing(InputId),
    /// An artifact consumed as an input is itself stale.
    UpstreamStale(ArtifactId),
    /// Marked by an explicit invalidation.
    Invalidated,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::NeverBuilt => write!(f, "never built"),
            StaleReason::EngineVersion { recorded, current } => {
                write!(f, "engine version changed ({recorded} -> {current})")
            }
            StaleReason::InputChanged(input) => write!(f, "input changed: {input}"),
            StaleReason::InputMissing(input) => write!(f, "input missing: {input}"),
            StaleReason::UpstreamStale(artifact) => write!(f, "upstream stale: {artifact}"),
            StaleReason::Invalidated => write!(f, "invalidated"),
        }
    }
}

/// Concurrent provenance store.
pub struct ProvenanceStore {
    engine_version: String,
    records: DashMap<ArtifactId, ProvenanceRecord>,
    /// Reverse index: fingerprint -> artifacts that recorded it as an input.
    dependents: DashMap<Fingerprint, BTreeSet<ArtifactId>>,
    /// Reverse index: input id -> artifacts that consume it.
    consumers: DashMap<InputId, BTreeSet<ArtifactId>>,
    /// Current fingerprint of every observed input.
    current: DashMap<InputId, Fingerprint>,
    /// Explicit invalidations, cleared when the artifact is recorded again.
    invalidated: DashSet<ArtifactId>,
}

impl ProvenanceStore {
    /// Create an empty store for the given engine version.
    pub fn new(engine_version: impl Into<String>) -> Self {
        Self {
            engine_version: engine_version.into(),
            records: DashMap::new(),
            dependents: DashMap::new(),
            consumers: DashMap::new(),
            current: DashMap::new(),
            invalidated: DashSet::new(),
        }
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Set the current fingerprint of an input.
    ///
    /// When the input was already known under a different fingerprint, every
    /// artifact transitively consuming it is returned.
    pub fn observe(&self, input: InputId, fingerprint: Fingerprint) -> BTreeSet<ArtifactId> {
        let previous = self.current.insert(input.clone(), fingerprint);
        match previous {
            Some(prev) if prev != fingerprint => {
                let affected = self.downstream(self.consumers_of(&input));
                if !affected.is_empty() {
                    tracing::debug!(input = %input, affected = affected.len(), "input changed");
                }
                affected
            }
            _ => BTreeSet::new(),
        }
    }

    /// Current fingerprint of an input, if observed.
    pub fn current_fingerprint(&self, input: &InputId) -> Option<Fingerprint> {
        self.current.get(input).map(|fp| *fp)
    }

    /// An input was deleted: drop its current fingerprint. Returns every
    /// artifact that transitively consumed it.
    pub fn forget_input(&self, input: &InputId) -> BTreeSet<ArtifactId> {
        self.current.remove(input);
        let affected = self.downstream(self.consumers_of(input));
        tracing::debug!(input = %input, affected = affected.len(), "input removed");
        affected
    }

    /// Record that `artifact` was built from `inputs`.
    ///
    /// Replaces any previous record, clears an invalidation mark, and, when an
    /// output fingerprint is given, makes it the current fingerprint of the
    /// artifact as an input for downstream consumers.
    pub fn record(
        &self,
        artifact: ArtifactId,
        inputs: Vec<(InputId, Fingerprint)>,
        output: Option<Fingerprint>,
        engine_version: &str,
    ) {
        if let Some(old) = self.records.remove(&artifact).map(|(_, r)| r) {
            self.unindex(&old);
        }
        let record = ProvenanceRecord {
            artifact: artifact.clone(),
            inputs,
            engine_version: engine_version.to_string(),
            output,
            recorded_at: unix_now(),
        };
        self.index(&record);
        if let Some(out) = output {
            self.current.insert(InputId::from(&artifact), out);
        }
        self.invalidated.remove(&artifact);
        tracing::debug!(artifact = %artifact, inputs = record.inputs.len(), "provenance recorded");
        self.records.insert(artifact, record);
    }

    /// Snapshot of one record.
    pub fn get(&self, artifact: &ArtifactId) -> Option<ProvenanceRecord> {
        self.records.get(artifact).map(|r| r.clone())
    }

    /// Whether `artifact` must be rebuilt.
    pub fn is_stale(&self, artifact: &ArtifactId) -> bool {
        self.stale_reason(artifact).is_some()
    }

    /// The first reason `artifact` must be rebuilt, or `None` if it is fresh.
    pub fn stale_reason(&self, artifact: &ArtifactId) -> Option<StaleReason> {
        self.stale_reason_within(artifact, &mut BTreeSet::new())
    }

    /// `visiting` holds the artifacts on the current upstream walk; a cycle
    /// back into it counts as fresh.
    fn stale_reason_within(
        &self,
        artifact: &ArtifactId,
        visiting: &mut BTreeSet<ArtifactId>,
    ) -> Option<StaleReason> {
        // Cloned so no shard lock is held while walking upstream.
        let Some(record) = self.get(artifact) else {
            return Some(StaleReason::NeverBuilt);
        };
        if self.invalidated.contains(artifact) {
            return Some(StaleReason::Invalidated);
        }
        if record.engine_version != self.engine_version {
            return Some(StaleReason::EngineVersion {
                recorded: record.engine_version.clone(),
                current: self.engine_version.clone(),
            });
        }
        for (input, recorded) in &record.inputs {
            match self.current.get(input) {
                None => return Some(StaleReason::InputMissing(input.clone())),
                Some(fp) if *fp != *recorded => {
                    return Some(StaleReason::InputChanged(input.clone()));
                }
                Some(_) => {}
            }
        }
        visiting.insert(artifact.clone());
        for (input, _) in &record.inputs {
            let upstream = ArtifactId::new(input.as_str());
            if visiting.contains(&upstream) || !self.records.contains_key(&upstream) {
                continue;
            }
            if self.stale_reason_within(&upstream, visiting).is_some() {
                visiting.remove(artifact);
                return Some(StaleReason::UpstreamStale(upstream));
            }
        }
        visiting.remove(artifact);
        None
    }

    /// Artifacts that recorded `fingerprint` as one of their inputs.
    pub fn dependents_of(&self, fingerprint: &Fingerprint) -> BTreeSet<ArtifactId> {
        self.dependents
            .get(fingerprint)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Artifacts that consume `input`, whatever fingerprint they recorded.
    pub fn consumers_of(&self, input: &InputId) -> BTreeSet<ArtifactId> {
        self.consumers
            .get(input)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Mark every artifact depending on `fingerprint`, and everything
    /// downstream of those artifacts, as invalidated. Returns the closure.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> BTreeSet<ArtifactId> {
        let affected = self.downstream(self.dependents_of(fingerprint));
        for artifact in &affected {
            self.invalidated.insert(artifact.clone());
        }
        tracing::info!(fingerprint = ?fingerprint, affected = affected.len(), "invalidated");
        affected
    }

    /// Drop an artifact's record. A missing record means "must rebuild".
    pub fn evict(&self, artifact: &ArtifactId) -> Option<ProvenanceRecord> {
        let (_, record) = self.records.remove(artifact)?;
        self.unindex(&record);
        self.invalidated.remove(artifact);
        Some(record)
    }

    /// All recorded artifacts, sorted.
    pub fn artifacts(&self) -> Vec<ArtifactId> {
        let mut ids: Vec<ArtifactId> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Output fingerprints of every recorded artifact.
    pub fn live_outputs(&self) -> BTreeSet<Fingerprint> {
        self.records.iter().filter_map(|r| r.output).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `seeds` plus every artifact consuming one of them, transitively.
    fn downstream(&self, seeds: BTreeSet<ArtifactId>) -> BTreeSet<ArtifactId> {
        let mut closed = BTreeSet::new();
        let mut queue: VecDeque<ArtifactId> = seeds.into_iter().collect();
        while let Some(artifact) = queue.pop_front() {
            if !closed.insert(artifact.clone()) {
                continue;
            }
            queue.extend(self.consumers_of(&InputId::from(&artifact)));
        }
        closed
    }

    fn index(&self, record: &ProvenanceRecord) {
        for (input, fp) in &record.inputs {
            self.dependents
                .entry(*fp)
                .or_default()
                .insert(record.artifact.clone());
            self.consumers
                .entry(input.clone())
                .or_default()
                .insert(record.artifact.clone());
        }
    }

    fn unindex(&self, record: &ProvenanceRecord) {
        for (input, fp) in &record.inputs {
            if let Some(mut set) = self.dependents.get_mut(fp) {
                set.remove(&record.artifact);
            }
            self.dependents.remove_if(fp, |_, set| set.is_empty());
            if let Some(mut set) = self.consumers.get_mut(input) {
                set.remove(&record.artifact);
            }
            self.consumers.remove_if(input, |_, set| set.is_empty());
        }
    }

    /// Snapshot of current input fingerprints, for persistence.
    pub(crate) fn current_inputs(&self) -> Vec<(InputId, Fingerprint)> {
        let mut inputs: Vec<(InputId, Fingerprint)> = self
            .current
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        inputs
    }

    /// Snapshot of all records sorted by artifact id, for persistence.
    pub(crate) fn records_sorted(&self) -> Vec<ProvenanceRecord> {
        let mut records: Vec<ProvenanceRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.artifact.cmp(&b.artifact));
        records
    }

    pub(crate) fn invalidated_sorted(&self) -> Vec<ArtifactId> {
        let mut ids: Vec<ArtifactId> = self.invalidated.iter().map(|a| a.clone()).collect();
        ids.sort();
        ids
    }

    /// Rebuild a store from persisted parts.
    pub(crate) fn restore(
        engine_version: impl Into<String>,
        inputs: Vec<(InputId, Fingerprint)>,
        records: Vec<ProvenanceRecord>,
        invalidated: Vec<ArtifactId>,
    ) -> Self {
        let store = Self::new(engine_version);
        for (input, fp) in inputs {
            store.current.insert(input, fp);
        }
        for record in records {
            store.index(&record);
            store.records.insert(record.artifact.clone(), record);
        }
        for artifact in invalidated {
            store.invalidated.insert(artifact);
        }
        store
    }
}

impl std::fmt::Debug for ProvenanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvenanceStore")
            .field("engine_version", &self.engine_version)
            .field("records", &self.records.len())
            .field("inputs", &self.current.len())
            .finish()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
