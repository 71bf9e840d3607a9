//! Persisted provenance log (`provenance.json`).
//!
//! One pretty-printed JSON document, records sorted by artifact id, rewritten
//! in full on every save. A missing or unreadable log is never an error: the
//! store starts empty and everything rebuilds.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

use super::{ArtifactId, InputId, ProvenanceRecord, ProvenanceStore};

/// File name of the log inside the state directory.
pub const PROVENANCE_FILE: &str = "provenance.json";

const LOG_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct LogDocument {
    format: u32,
    engine_version: String,
    inputs: Vec<(InputId, Fingerprint)>,
    records: Vec<ProvenanceRecord>,
    #[serde(default)]
    invalidated: Vec<ArtifactId>,
}

/// Save/load entry points for the provenance log.
pub struct ProvenanceLog;

impl ProvenanceLog {
    /// Write the store to `<dir>/provenance.json`, replacing any previous log.
    pub fn save(store: &ProvenanceStore, dir: &Path) -> Result<PathBuf, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        let doc = LogDocument {
            format: LOG_FORMAT,
            engine_version: store.engine_version().to_string(),
            inputs: store.current_inputs(),
            records: store.records_sorted(),
            invalidated: store.invalidated_sorted(),
        };
        let json = serde_json::to_string_pretty(&doc).map_err(|e| StoreError::Serialization {
            message: format!("provenance log: {e}"),
        })?;

        let path = dir.join(PROVENANCE_FILE);
        let tmp = dir.join(format!("{PROVENANCE_FILE}.tmp"));
        std::fs::write(&tmp, json).map_err(|e| StoreError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), records = doc.records.len(), "provenance log saved");
        Ok(path)
    }

    /// Load `<dir>/provenance.json` into a store for `engine_version`.
    ///
    /// Records written by another engine version are kept; they simply report
    /// [`super::StaleReason::EngineVersion`].
    pub fn load(dir: &Path, engine_version: &str) -> ProvenanceStore {
        let path = dir.join(PROVENANCE_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProvenanceStore::new(engine_version);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "provenance log unreadable, starting empty");
                return ProvenanceStore::new(engine_version);
            }
        };
        match serde_json::from_str::<LogDocument>(&content) {
            Ok(doc) if doc.format == LOG_FORMAT => {
                tracing::debug!(records = doc.records.len(), "provenance log loaded");
                ProvenanceStore::restore(engine_version, doc.inputs, doc.records, doc.invalidated)
            }
            Ok(doc) => {
                tracing::warn!(format = doc.format, "unknown provenance log format, starting empty");
                ProvenanceStore::new(engine_version)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "provenance log corrupt, starting empty");
                ProvenanceStore::new(engine_version)
            }
        }
    }
}
