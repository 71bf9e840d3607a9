//! Content-addressed build cache with single-flight production.
//!
//! Artifacts are keyed by the fingerprint of everything that went into them.
//! Concurrent requests for the same fingerprint are coalesced: exactly one
//! caller runs the producer, everyone else waits on the slot and receives the
//! same `Arc<CachedArtifact>` (or the same error). Failures are never cached.
//!
//! An optional [`DurableCache`] keeps artifacts across runs. In-memory entries
//! are bounded by an LRU over ready slots; in-progress slots are never evicted.

pub mod context;
pub mod durable;

use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use crate::provenance::unix_now;

pub use context::{BuildContext, CancelToken, Interrupt};
pub use durable::DurableCache;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// How often a waiter re-checks cancellation while the producer runs.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// An immutable cached build product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    pub fingerprint: Fingerprint,
    pub bytes: Vec<u8>,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub engine_version: String,
    /// Fingerprints of the inputs the producer consumed.
    pub inputs: Vec<Fingerprint>,
}

/// What a producer hands back to the cache.
#[derive(Debug, Clone, Default)]
pub struct ProducedArtifact {
    pub bytes: Vec<u8>,
    pub inputs: Vec<Fingerprint>,
}

impl ProducedArtifact {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            inputs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<Fingerprint>) -> Self {
        self.inputs = inputs;
        self
    }
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub productions: u64,
    pub evictions: u64,
}

enum SlotState {
    InProgress,
    Ready(Arc<CachedArtifact>),
    Failed(CacheError),
    /// The producer was cancelled, or timed out without output; waiters
    /// retry on their own.
    Abandoned,
}

struct Slot {
    state: Mutex<SlotState>,
    settled: Condvar,
    last_used: AtomicU64,
}

impl Slot {
    fn new(state: SlotState, tick: u64) -> Self {
        Self {
            state: Mutex::new(state),
            settled: Condvar::new(),
            last_used: AtomicU64::new(tick),
        }
    }

    fn ready(&self) -> Option<Arc<CachedArtifact>> {
        match &*self.state.lock().expect("cache slot lock poisoned") {
            SlotState::Ready(artifact) => Some(Arc::clone(artifact)),
            _ => None,
        }
    }

    fn settle(&self, state: SlotState) {
        *self.state.lock().expect("cache slot lock poisoned") = state;
        self.settled.notify_all();
    }
}

enum Role {
    Producer(Arc<Slot>),
    Waiter(Arc<Slot>),
}

/// The build cache.
pub struct BuildCache {
    config: CacheConfig,
    engine_version: String,
    slots: DashMap<Fingerprint, Arc<Slot>>,
    durable: Option<DurableCache>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    productions: AtomicU64,
    evictions: AtomicU64,
}

impl BuildCache {
    /// Memory-only cache.
    pub fn new(config: CacheConfig, engine_version: impl Into<String>) -> Self {
        Self {
            config,
            engine_version: engine_version.into(),
            slots: DashMap::new(),
            durable: None,
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            productions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cache persisted under `dir`.
    pub fn open(
        dir: &Path,
        config: CacheConfig,
        engine_version: impl Into<String>,
    ) -> CacheResult<Self> {
        let durable = DurableCache::open(dir)?;
        let mut cache = Self::new(config, engine_version);
        cache.durable = Some(durable);
        tracing::debug!(dir = %dir.display(), "persisted build cache opened");
        Ok(cache)
    }

    /// Memory-only or persisted, depending on `config.dir`.
    pub fn from_config(config: CacheConfig, engine_version: impl Into<String>) -> CacheResult<Self> {
        match config.dir.clone() {
            Some(dir) => Self::open(&dir, config, engine_version),
            None => Ok(Self::new(config, engine_version)),
        }
    }

    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    pub fn is_persistent(&self) -> bool {
        self.durable.is_some()
    }

    /// Look up a ready artifact, falling back to the persisted cache.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CachedArtifact>> {
        let found = self.lookup(fingerprint);
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Whether a ready artifact exists. Does not touch the counters.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lookup(fingerprint).is_some()
    }

    /// [`get_or_produce_with`](Self::get_or_produce_with) without deadline or cancellation.
    pub fn get_or_produce<F>(
        &self,
        fingerprint: Fingerprint,
        producer: F,
    ) -> CacheResult<Arc<CachedArtifact>>
    where
        F: FnOnce() -> Result<ProducedArtifact, String>,
    {
        self.get_or_produce_with(fingerprint, &BuildContext::new(), |_| producer())
    }

    /// Return the artifact for `fingerprint`, producing it at most once across
    /// all concurrent callers.
    pub fn get_or_produce_with<F>(
        &self,
        fingerprint: Fingerprint,
        ctx: &BuildContext,
        producer: F,
    ) -> CacheResult<Arc<CachedArtifact>>
    where
        F: FnOnce(&BuildContext) -> Result<ProducedArtifact, String>,
    {
        loop {
            ctx.check()
                .map_err(|i| interrupt_error(i, &fingerprint))?;

            let role = match self.slots.entry(fingerprint) {
                Entry::Occupied(e) => Role::Waiter(Arc::clone(e.get())),
                Entry::Vacant(e) => {
                    let slot = Arc::new(Slot::new(SlotState::InProgress, self.next_tick()));
                    e.insert(Arc::clone(&slot));
                    Role::Producer(slot)
                }
            };

            match role {
                Role::Waiter(slot) => {
                    if let Some(result) = self.wait(&slot, &fingerprint, ctx)? {
                        return result;
                    }
                    // Producer abandoned the slot; try again.
                }
                Role::Producer(slot) => return self.produce(slot, fingerprint, ctx, producer),
            }
        }
    }

    /// `Ok(None)` means the slot was abandoned and the caller should retry.
    fn wait(
        &self,
        slot: &Arc<Slot>,
        fingerprint: &Fingerprint,
        ctx: &BuildContext,
    ) -> CacheResult<Option<CacheResult<Arc<CachedArtifact>>>> {
        let mut state = slot.state.lock().expect("cache slot lock poisoned");
        loop {
            match &*state {
                SlotState::Ready(artifact) => {
                    slot.last_used.store(self.next_tick(), Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(Ok(Arc::clone(artifact))));
                }
                SlotState::Failed(err) => return Ok(Some(Err(err.clone()))),
                SlotState::Abandoned => return Ok(None),
                SlotState::InProgress => {}
            }
            ctx.check()
                .map_err(|i| interrupt_error(i, fingerprint))?;
            let timeout = ctx
                .remaining()
                .map(|r| r.min(WAIT_POLL))
                .unwrap_or(WAIT_POLL);
            state = slot
                .settled
                .wait_timeout(state, timeout)
                .expect("cache slot lock poisoned")
                .0;
        }
    }

    fn produce<F>(
        &self,
        slot: Arc<Slot>,
        fingerprint: Fingerprint,
        ctx: &BuildContext,
        producer: F,
    ) -> CacheResult<Arc<CachedArtifact>>
    where
        F: FnOnce(&BuildContext) -> Result<ProducedArtifact, String>,
    {
        if let Some(artifact) = self.load_persisted(&fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            slot.settle(SlotState::Ready(Arc::clone(&artifact)));
            self.enforce_capacity();
            return Ok(artifact);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let outcome = catch_unwind(AssertUnwindSafe(|| producer(ctx)))
            .unwrap_or_else(|panic| Err(panic_message(panic.as_ref())));

        // Output finished past the deadline is still stored; only the caller
        // sees the timeout.
        let late = match (ctx.check(), &outcome) {
            (Ok(()), _) => None,
            (Err(Interrupt::DeadlineExceeded), Ok(_)) => Some(Interrupt::DeadlineExceeded),
            (Err(interrupt), _) => {
                slot.settle(SlotState::Abandoned);
                self.release(&fingerprint, &slot);
                tracing::debug!(fingerprint = ?fingerprint, ?interrupt, "production abandoned");
                return Err(interrupt_error(interrupt, &fingerprint));
            }
        };

        match outcome {
            Ok(produced) => {
                let artifact = Arc::new(CachedArtifact {
                    fingerprint,
                    bytes: produced.bytes,
                    created_at: unix_now(),
                    engine_version: self.engine_version.clone(),
                    inputs: produced.inputs,
                });
                if let Some(durable) = &self.durable {
                    if let Err(e) = durable.put(&artifact) {
                        tracing::warn!(fingerprint = ?fingerprint, error = %e, "failed to persist artifact");
                    }
                }
                self.productions.fetch_add(1, Ordering::Relaxed);
                slot.settle(SlotState::Ready(Arc::clone(&artifact)));
                self.enforce_capacity();
                if let Some(interrupt) = late {
                    tracing::debug!(fingerprint = ?fingerprint, "production finished past the deadline, output kept");
                    return Err(interrupt_error(interrupt, &fingerprint));
                }
                Ok(artifact)
            }
            Err(reason) => {
                let err = CacheError::ProducerFailed {
                    fingerprint: fingerprint.to_hex(),
                    reason,
                };
                slot.settle(SlotState::Failed(err.clone()));
                self.release(&fingerprint, &slot);
                Err(err)
            }
        }
    }

    /// Remove `slot` from the map if it is still the registered one.
    fn release(&self, fingerprint: &Fingerprint, slot: &Arc<Slot>) {
        self.slots
            .remove_if(fingerprint, |_, current| Arc::ptr_eq(current, slot));
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<CachedArtifact>> {
        let slot = self.slots.get(fingerprint).map(|s| Arc::clone(s.value()));
        if let Some(slot) = slot {
            if let Some(artifact) = slot.ready() {
                slot.last_used.store(self.next_tick(), Ordering::Relaxed);
                return Some(artifact);
            }
            return None;
        }

        let artifact = self.load_persisted(fingerprint)?;
        self.slots.entry(*fingerprint).or_insert_with(|| {
            Arc::new(Slot::new(
                SlotState::Ready(Arc::clone(&artifact)),
                self.next_tick(),
            ))
        });
        self.enforce_capacity();
        Some(artifact)
    }

    fn load_persisted(&self, fingerprint: &Fingerprint) -> Option<Arc<CachedArtifact>> {
        let durable = self.durable.as_ref()?;
        match durable.get(fingerprint, &self.engine_version) {
            Ok(found) => found.map(Arc::new),
            Err(e) => {
                tracing::warn!(fingerprint = ?fingerprint, error = %e, "persisted cache read failed");
                None
            }
        }
    }

    /// Evict least-recently-used ready entries until within capacity.
    fn enforce_capacity(&self) {
        if self.slots.len() <= self.config.capacity {
            return;
        }
        let mut ready: Vec<(u64, Fingerprint)> = self
            .slots
            .iter()
            .filter(|e| e.value().ready().is_some())
            .map(|e| (e.value().last_used.load(Ordering::Relaxed), *e.key()))
            .collect();
        if ready.len() <= self.config.capacity {
            return;
        }
        ready.sort();
        let excess = ready.len() - self.config.capacity;
        for (_, fp) in ready.into_iter().take(excess) {
            if self
                .slots
                .remove_if(&fp, |_, slot| slot.ready().is_some())
                .is_some()
            {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop entries older than `max_age` from memory and the persisted cache.
    /// `now` is seconds since the Unix epoch. Returns the number dropped.
    pub fn evict_expired(&self, now: u64) -> CacheResult<usize> {
        let Some(max_age) = self.config.max_age_secs else {
            return Ok(0);
        };
        let expired = |created_at: u64| created_at.saturating_add(max_age) < now;

        let stale: Vec<Fingerprint> = self
            .slots
            .iter()
            .filter(|e| e.value().ready().is_some_and(|a| expired(a.created_at)))
            .map(|e| *e.key())
            .collect();
        let mut dropped = 0;
        for fp in &stale {
            if self.slots.remove_if(fp, |_, slot| slot.ready().is_some()).is_some() {
                dropped += 1;
            }
        }

        if let Some(durable) = &self.durable {
            for fp in durable.fingerprints()? {
                if stale.contains(&fp) {
                    durable.remove(&fp)?;
                    continue;
                }
                if let Some(artifact) = durable.get(&fp, &self.engine_version)? {
                    if expired(artifact.created_at) {
                        durable.remove(&fp)?;
                        dropped += 1;
                    }
                }
            }
        }

        self.evictions.fetch_add(dropped as u64, Ordering::Relaxed);
        if dropped > 0 {
            tracing::info!(dropped, max_age_secs = max_age, "expired cache entries evicted");
        }
        Ok(dropped)
    }

    /// Remove every ready entry (in memory and persisted) not in `live`.
    pub fn gc(&self, live: &BTreeSet<Fingerprint>) -> CacheResult<usize> {
        let dead: Vec<Fingerprint> = self
            .slots
            .iter()
            .filter(|e| !live.contains(e.key()) && e.value().ready().is_some())
            .map(|e| *e.key())
            .collect();
        let mut removed = BTreeSet::new();
        for fp in dead {
            if self.slots.remove_if(&fp, |_, slot| slot.ready().is_some()).is_some() {
                removed.insert(fp);
            }
        }
        if let Some(durable) = &self.durable {
            removed.extend(durable.gc(live)?);
        }
        Ok(removed.len())
    }

    /// Number of ready entries held in memory.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| e.value().ready().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            productions: self.productions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCache")
            .field("engine_version", &self.engine_version)
            .field("slots", &self.slots.len())
            .field("persistent", &self.durable.is_some())
            .finish()
    }
}

fn interrupt_error(interrupt: Interrupt, fingerprint: &Fingerprint) -> CacheError {
    match interrupt {
        Interrupt::Cancelled => CacheError::Cancelled {
            fingerprint: fingerprint.to_hex(),
        },
        Interrupt::DeadlineExceeded => CacheError::Timeout {
            fingerprint: fingerprint.to_hex(),
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("producer panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("producer panicked: {s}")
    } else {
        "producer panicked".to_string()
    }
}
