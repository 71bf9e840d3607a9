//! Aggregate outcome of one scheduler run.

use std::time::Duration;

use serde::Serialize;

use crate::config::BuildMode;
use crate::fingerprint::Fingerprint;
use crate::provenance::ArtifactId;

/// Why an artifact failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The run deadline passed while the artifact was waiting or producing.
    Timeout,
    /// The run was cancelled while the artifact was in progress.
    Cancelled,
    /// The producer returned an error or panicked.
    Producer(String),
    /// The cache itself failed.
    Cache(String),
    /// An input of the artifact could not be read.
    Input(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => f.write_str("timeout"),
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Producer(reason) => write!(f, "producer failed: {reason}"),
            FailureReason::Cache(message) => write!(f, "cache error: {message}"),
            FailureReason::Input(message) => write!(f, "input unreadable: {message}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Provenance and cache both say the artifact is current.
    UpToDate,
    /// The run was cancelled before the artifact started.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedArtifact {
    pub artifact: ArtifactId,
    pub fingerprint: Option<Fingerprint>,
    pub reason: FailureReason,
}

impl std::fmt::Display for FailedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fingerprint {
            Some(fp) => write!(f, "{} [{:?}]: {}", self.artifact, fp, self.reason),
            None => write!(f, "{}: {}", self.artifact, self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedArtifact {
    pub artifact: ArtifactId,
    pub reason: SkipReason,
}

/// The single source of truth for whether a run succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub succeeded: Vec<ArtifactId>,
    pub failed: Vec<FailedArtifact>,
    pub skipped: Vec<SkippedArtifact>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub mode: BuildMode,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl RunReport {
    pub(crate) fn new(mode: BuildMode) -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            elapsed: Duration::ZERO,
            mode,
        }
    }

    /// Sort every list by artifact id.
    pub(crate) fn finish(mut self, elapsed: Duration) -> Self {
        self.succeeded.sort();
        self.failed.sort_by(|a, b| a.artifact.cmp(&b.artifact));
        self.skipped.sort_by(|a, b| a.artifact.cmp(&b.artifact));
        self.elapsed = elapsed;
        self
    }

    /// Success means no failures, except in best-effort mode.
    pub fn is_success(&self) -> bool {
        match self.mode {
            BuildMode::BestEffort => true,
            BuildMode::Strict | BuildMode::FailFast => self.failed.is_empty(),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    pub fn up_to_date(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| s.reason == SkipReason::UpToDate)
            .count()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        format!(
            "{} built, {} failed, {} skipped ({} up to date) in {:.2}s [{}]",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.up_to_date(),
            self.elapsed.as_secs_f64(),
            self.mode,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(id: &str) -> FailedArtifact {
        FailedArtifact {
            artifact: ArtifactId::new(id),
            fingerprint: None,
            reason: FailureReason::Producer("boom".into()),
        }
    }

    #[test]
    fn success_depends_on_mode() {
        let mut report = RunReport::new(BuildMode::Strict);
        assert!(report.is_success());
        report.failed.push(failed("page:a"));
        assert!(!report.is_success());
        report.mode = BuildMode::BestEffort;
        assert!(report.is_success());
        report.mode = BuildMode::FailFast;
        assert!(!report.is_success());
    }

    #[test]
    fn finish_sorts_and_summarizes() {
        let mut report = RunReport::new(BuildMode::Strict);
        report.succeeded.push(ArtifactId::new("page:b"));
        report.succeeded.push(ArtifactId::new("page:a"));
        report.skipped.push(SkippedArtifact {
            artifact: ArtifactId::new("page:c"),
            reason: SkipReason::UpToDate,
        });
        let report = report.finish(Duration::from_millis(1500));
        assert_eq!(report.succeeded[0], ArtifactId::new("page:a"));
        assert_eq!(report.total(), 3);
        assert_eq!(
            report.summary(),
            "2 built, 0 failed, 1 skipped (1 up to date) in 1.50s [strict]"
        );
    }

    #[test]
    fn serializes_for_the_cli() {
        let mut report = RunReport::new(BuildMode::BestEffort);
        report.failed.push(failed("page:x"));
        let v = serde_json::to_value(report.finish(Duration::from_millis(42))).unwrap();
        assert_eq!(v["elapsed_ms"], 42);
        assert_eq!(v["mode"], "best-effort");
        assert_eq!(v["failed"][0]["reason"]["kind"], "producer");
        assert_eq!(v["failed"][0]["artifact"], "page:x");
    }
}
