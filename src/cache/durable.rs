//! Cross-run artifact persistence backed by redb.
//!
//! Two tables keyed by fingerprint bytes: `artifacts` holds payloads and
//! `artifact_meta` holds bincode-encoded [`ArtifactMeta`] with a SHA-256
//! checksum of the payload. Reads validate format, engine version and checksum;
//! anything that fails validation is deleted and reported as a miss.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

use super::CachedArtifact;

const ARTIFACTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("artifacts");
const ARTIFACT_META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("artifact_meta");

/// File name of the cache database inside the cache directory.
pub const CACHE_FILE: &str = "cache.redb";

const META_FORMAT: u32 = 1;

/// Per-artifact metadata stored beside the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub format: u32,
    pub engine_version: String,
    /// SHA-256 of the payload bytes.
    pub checksum: Fingerprint,
    pub created_at: u64,
    pub inputs: Vec<Fingerprint>,
}

fn redb_err(op: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

/// redb-backed artifact table.
pub struct DurableCache {
    db: Arc<Database>,
}

impl DurableCache {
    /// Open or create the cache database in `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let db_path = dir.join(CACHE_FILE);
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;

        // Create both tables up front so read transactions never see them missing.
        let txn = db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        txn.open_table(ARTIFACTS)
            .map_err(|e| redb_err("open_table", e))?;
        txn.open_table(ARTIFACT_META)
            .map_err(|e| redb_err("open_table", e))?;
        txn.commit().map_err(|e| redb_err("commit", e))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Persist one artifact, replacing any previous entry for its fingerprint.
    pub fn put(&self, artifact: &CachedArtifact) -> Result<(), StoreError> {
        let meta = ArtifactMeta {
            format: META_FORMAT,
            engine_version: artifact.engine_version.clone(),
            checksum: Fingerprint::from_digest(sha256(&artifact.bytes)),
            created_at: artifact.created_at,
            inputs: artifact.inputs.clone(),
        };
        let meta_bytes = bincode::serialize(&meta).map_err(|e| StoreError::Serialization {
            message: format!("artifact meta: {e}"),
        })?;
        let key = artifact.fingerprint.as_bytes().as_slice();

        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_err("begin_write", e))?;
        {
            let mut payloads = txn
                .open_table(ARTIFACTS)
                .map_err(|e| redb_err("open_table", e))?;
            payloads
                .insert(key, artifact.bytes.as_slice())
                .map_err(|e| redb_err("insert", e))?;
            let mut metas = txn
                .open_table(ARTIFACT_META)
                .map_err(|e| redb_err("open_table", e))?;
            metas
                .insert(key, meta_bytes.as_slice())
                .map_err(|e| redb_err("insert", e))?;
        }
        txn.commit().map_err(|e| redb_err("commit", e))?;
        Ok(())
    }

    /// Read and validate one artifact.
    ///
    /// `Ok(None)` for a miss, including entries that fail validation (those are
    /// deleted on the way out).
    pub fn get(
        &self,
        fingerprint: &Fingerprint,
        engine_version: &str,
    ) -> Result<Option<CachedArtifact>, StoreError> {
        let key = fingerprint.as_bytes().as_slice();
        let (payload, meta_bytes) = {
            let txn = self
                .db
                .begin_read()
                .map_err(|e| redb_err("begin_read", e))?;
            let payloads = txn
                .open_table(ARTIFACTS)
                .map_err(|e| redb_err("open_table", e))?;
            let metas = txn
                .open_table(ARTIFACT_META)
                .map_err(|e| redb_err("open_table", e))?;
            let payload = payloads
                .get(key)
                .map_err(|e| redb_err("get", e))?
                .map(|g| g.value().to_vec());
            let meta = metas
                .get(key)
                .map_err(|e| redb_err("get", e))?
                .map(|g| g.value().to_vec());
            (payload, meta)
        };

        let (payload, meta_bytes) = match (payload, meta_bytes) {
            (None, None) => return Ok(None),
            (Some(p), Some(m)) => (p, m),
            _ => {
                tracing::debug!(fingerprint = ?fingerprint, "half-written cache entry discarded");
                self.remove(fingerprint)?;
                return Ok(None);
            }
        };

        let meta: ArtifactMeta = match bincode::deserialize(&meta_bytes) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!(fingerprint = ?fingerprint, error = %e, "unreadable cache metadata discarded");
                self.remove(fingerprint)?;
                return Ok(None);
            }
        };

        let problem = if meta.format != META_FORMAT {
            Some("format")
        } else if meta.engine_version != engine_version {
            Some("engine version")
        } else if meta.checksum != Fingerprint::from_digest(sha256(&payload)) {
            Some("checksum")
        } else {
            None
        };
        if let Some(problem) = problem {
            tracing::debug!(fingerprint = ?fingerprint, mismatch = problem, "stale cache entry discarded");
            self.remove(fingerprint)?;
            return Ok(None);
        }

        Ok(Some(CachedArtifact {
            fingerprint: *fingerprint,
            bytes: payload,
            created_at: meta.created_at,
            engine_version: meta.engine_version,
            inputs: meta.inputs,
        }))
    }

    /// Delete one entry. Returns whether anything existed.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        let key = fingerprint.as_bytes().as_slice();
        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_err("begin_write", e))?;
        let existed = {
            let mut payloads = txn
                .open_table(ARTIFACTS)
                .map_err(|e| redb_err("open_table", e))?;
            let a = payloads
                .remove(key)
                .map_err(|e| redb_err("remove", e))?
                .is_some();
            let mut metas = txn
                .open_table(ARTIFACT_META)
                .map_err(|e| redb_err("open_table", e))?;
            let b = metas
                .remove(key)
                .map_err(|e| redb_err("remove", e))?
                .is_some();
            a || b
        };
        txn.commit().map_err(|e| redb_err("commit", e))?;
        Ok(existed)
    }

    /// All persisted fingerprints, sorted.
    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| redb_err("begin_read", e))?;
        let mut keys = BTreeSet::new();
        for def in [ARTIFACTS, ARTIFACT_META] {
            let table = txn.open_table(def).map_err(|e| redb_err("open_table", e))?;
            for entry in table.iter().map_err(|e| redb_err("iter", e))? {
                let (key, _) = entry.map_err(|e| redb_err("iter", e))?;
                if let Ok(digest) = <[u8; 32]>::try_from(key.value()) {
                    keys.insert(Fingerprint::from_digest(digest));
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Remove every entry whose fingerprint is not in `live`. Returns what was removed.
    pub fn gc(&self, live: &BTreeSet<Fingerprint>) -> Result<Vec<Fingerprint>, StoreError> {
        let dead: Vec<Fingerprint> = self
            .fingerprints()?
            .into_iter()
            .filter(|fp| !live.contains(fp))
            .collect();
        if dead.is_empty() {
            return Ok(dead);
        }

        let txn = self
            .db
            .begin_write()
            .map_err(|e| redb_err("begin_write", e))?;
        {
            let mut payloads = txn
                .open_table(ARTIFACTS)
                .map_err(|e| redb_err("open_table", e))?;
            let mut metas = txn
                .open_table(ARTIFACT_META)
                .map_err(|e| redb_err("open_table", e))?;
            for fp in &dead {
                let key = fp.as_bytes().as_slice();
                payloads.remove(key).map_err(|e| redb_err("remove", e))?;
                metas.remove(key).map_err(|e| redb_err("remove", e))?;
            }
        }
        txn.commit().map_err(|e| redb_err("commit", e))?;
        tracing::info!(removed = dead.len(), kept = live.len(), "cache gc");
        Ok(dead)
    }

    #[cfg(test)]
    fn corrupt_payload(&self, fingerprint: &Fingerprint, bytes: &[u8]) {
        let txn = self.db.begin_write().unwrap();
        {
            let mut payloads = txn.open_table(ARTIFACTS).unwrap();
            payloads
                .insert(fingerprint.as_bytes().as_slice(), bytes)
                .unwrap();
        }
        txn.commit().unwrap();
    }
}

impl std::fmt::Debug for DurableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableCache").finish()
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}
