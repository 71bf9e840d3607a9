//! Parallel, partially-failing build runs.
//!
//! Each artifact moves through `Unknown -> Stale -> InProgress -> Done | Failed`
//! (or straight to `Done` when provenance and cache say it is current). A
//! bounded pool of scoped threads pulls jobs off a shared queue; exclusivity
//! per fingerprint comes from [`BuildCache::get_or_produce_with`]. One failed
//! artifact never stops unrelated ones unless the run is in fail-fast mode.

pub mod report;

use std::collections::BTreeSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::cache::{BuildCache, BuildContext, CancelToken, Interrupt, ProducedArtifact};
use crate::config::{BuildMode, SchedulerConfig};
use crate::error::{CacheError, SchedulerError};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::provenance::{ArtifactId, InputId, ProvenanceStore};

pub use report::{FailedArtifact, FailureReason, RunReport, SkipReason, SkippedArtifact};

/// Result type for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Lifecycle of one artifact within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Unknown,
    Stale,
    InProgress,
    Done,
    Failed,
}

impl ArtifactState {
    pub fn can_transition(self, to: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (self, to),
            (Unknown, Stale)
                | (Unknown, Done)
                | (Stale, InProgress)
                | (Stale, Failed)
                | (InProgress, Done)
                | (InProgress, Failed)
        )
    }

    /// Move to `to`, rejecting anything that is not a forward step.
    pub fn transition(self, artifact: &ArtifactId, to: ArtifactState) -> SchedulerResult<Self> {
        if !self.can_transition(to) {
            return Err(SchedulerError::IllegalTransition {
                artifact: artifact.to_string(),
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        tracing::trace!(artifact = %artifact, from = %self, to = %to, "artifact state");
        Ok(to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ArtifactState::Done | ArtifactState::Failed)
    }
}

impl std::fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ArtifactState::Unknown => "unknown",
            ArtifactState::Stale => "stale",
            ArtifactState::InProgress => "in-progress",
            ArtifactState::Done => "done",
            ArtifactState::Failed => "failed",
        })
    }
}

/// One unit of work for the scheduler.
pub trait BuildJob: Send + Sync {
    fn artifact_id(&self) -> ArtifactId;

    /// Inputs with their current fingerprints.
    fn inputs(&self) -> Vec<(InputId, Fingerprint)>;

    /// Cache key: the artifact id plus every input, in order.
    fn fingerprint(&self) -> Fingerprint {
        let mut fp = Fingerprinter::new().text(self.artifact_id().as_str());
        for (input, input_fp) in self.inputs() {
            fp = fp.text(input.as_str()).fingerprint(&input_fp);
        }
        fp.finish()
    }

    /// Produce the artifact bytes. Long producers should call
    /// [`BuildContext::check`] between units of work.
    fn produce(&self, ctx: &BuildContext) -> Result<Vec<u8>, String>;
}

enum JobOutcome {
    Succeeded(ArtifactId),
    Failed(FailedArtifact),
    Skipped(SkippedArtifact),
}

/// Drives build jobs over explicitly owned provenance and cache state.
pub struct BuildScheduler {
    config: SchedulerConfig,
    provenance: Arc<ProvenanceStore>,
    cache: Arc<BuildCache>,
    engine_version: String,
}

impl BuildScheduler {
    pub fn new(
        config: SchedulerConfig,
        provenance: Arc<ProvenanceStore>,
        cache: Arc<BuildCache>,
        engine_version: impl Into<String>,
    ) -> Self {
        Self {
            config,
            provenance,
            cache,
            engine_version: engine_version.into(),
        }
    }

    pub fn mode(&self) -> BuildMode {
        self.config.mode
    }

    /// Run `jobs` to completion with a fresh cancellation token.
    pub fn run(&self, jobs: Vec<Box<dyn BuildJob>>) -> SchedulerResult<RunReport> {
        self.run_with(jobs, &CancelToken::new())
    }

    /// Run `jobs`; cancelling `token` from elsewhere stops the run.
    pub fn run_with(
        &self,
        jobs: Vec<Box<dyn BuildJob>>,
        token: &CancelToken,
    ) -> SchedulerResult<RunReport> {
        let started = Instant::now();
        let mut seen = BTreeSet::new();
        for job in &jobs {
            let artifact = job.artifact_id();
            if !seen.insert(artifact.clone()) {
                return Err(SchedulerError::DuplicateArtifact {
                    artifact: artifact.to_string(),
                });
            }
        }

        let ctx = BuildContext::new()
            .with_token(token.clone())
            .with_deadline(self.config.deadline().map(|d| started + d));
        let workers = self.config.worker_count().clamp(1, jobs.len().max(1));
        tracing::info!(
            jobs = jobs.len(),
            workers,
            mode = %self.config.mode,
            "build run starting"
        );

        let (job_tx, job_rx) = mpsc::channel::<usize>();
        for i in 0..jobs.len() {
            // The receiver is alive until the end of this function.
            let _ = job_tx.send(i);
        }
        drop(job_tx);
        let job_rx = Mutex::new(job_rx);
        let (result_tx, result_rx) = mpsc::channel::<JobOutcome>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let result_tx = result_tx.clone();
                let (job_rx, jobs, ctx) = (&job_rx, &jobs, &ctx);
                scope.spawn(move || {
                    loop {
                        let next = job_rx.lock().expect("job queue lock poisoned").recv();
                        let Ok(i) = next else { break };
                        let outcome = self.run_job(jobs[i].as_ref(), ctx);
                        if matches!(outcome, JobOutcome::Failed(_))
                            && self.config.mode == BuildMode::FailFast
                        {
                            ctx.cancel();
                        }
                        if result_tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut report = RunReport::new(self.config.mode);
        for outcome in result_rx {
            match outcome {
                JobOutcome::Succeeded(artifact) => report.succeeded.push(artifact),
                JobOutcome::Failed(failed) => report.failed.push(failed),
                JobOutcome::Skipped(skipped) => report.skipped.push(skipped),
            }
        }
        let report = report.finish(started.elapsed());
        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            success = report.is_success(),
            "build run finished"
        );
        Ok(report)
    }

    fn run_job(&self, job: &dyn BuildJob, ctx: &BuildContext) -> JobOutcome {
        let artifact = job.artifact_id();
        let fingerprint = job.fingerprint();
        let inputs = job.inputs();
        let state = ArtifactState::Unknown;

        match ctx.check() {
            Err(Interrupt::Cancelled) => {
                return JobOutcome::Skipped(SkippedArtifact {
                    artifact,
                    reason: SkipReason::Cancelled,
                });
            }
            Err(Interrupt::DeadlineExceeded) => {
                return self.fail(&artifact, fingerprint, FailureReason::Timeout);
            }
            Ok(()) => {}
        }

        for (input, fp) in &inputs {
            self.provenance.observe(input.clone(), *fp);
        }
        if !self.provenance.is_stale(&artifact) && self.cache.contains(&fingerprint) {
            return match state.transition(&artifact, ArtifactState::Done) {
                Ok(_) => JobOutcome::Skipped(SkippedArtifact {
                    artifact,
                    reason: SkipReason::UpToDate,
                }),
                Err(e) => self.fail(&artifact, fingerprint, FailureReason::Cache(e.to_string())),
            };
        }

        let state = match state
            .transition(&artifact, ArtifactState::Stale)
            .and_then(|s| s.transition(&artifact, ArtifactState::InProgress))
        {
            Ok(s) => s,
            Err(e) => return self.fail(&artifact, fingerprint, FailureReason::Cache(e.to_string())),
        };

        let input_fps: Vec<Fingerprint> = inputs.iter().map(|(_, fp)| *fp).collect();
        let result = self.cache.get_or_produce_with(fingerprint, ctx, |ctx| {
            job.produce(ctx)
                .map(|bytes| ProducedArtifact::new(bytes).with_inputs(input_fps))
        });

        let reason = match result {
            Ok(_) => {
                self.provenance
                    .record(artifact.clone(), inputs, Some(fingerprint), &self.engine_version);
                return match state.transition(&artifact, ArtifactState::Done) {
                    Ok(_) => {
                        tracing::debug!(artifact = %artifact, "artifact built");
                        JobOutcome::Succeeded(artifact)
                    }
                    Err(e) => self.fail(&artifact, fingerprint, FailureReason::Cache(e.to_string())),
                };
            }
            Err(CacheError::Timeout { .. }) => FailureReason::Timeout,
            Err(CacheError::Cancelled { .. }) => FailureReason::Cancelled,
            Err(CacheError::ProducerFailed { reason, .. }) => FailureReason::Producer(reason),
            Err(e @ CacheError::Persist { .. }) => FailureReason::Cache(e.to_string()),
        };
        if let Err(e) = state.transition(&artifact, ArtifactState::Failed) {
            tracing::warn!(artifact = %artifact, error = %e, "failure recorded from unexpected state");
        }
        self.fail(&artifact, fingerprint, reason)
    }

    fn fail(&self, artifact: &ArtifactId, fingerprint: Fingerprint, reason: FailureReason) -> JobOutcome {
        tracing::error!(artifact = %artifact, fingerprint = ?fingerprint, %reason, "artifact failed");
        JobOutcome::Failed(FailedArtifact {
            artifact: artifact.clone(),
            fingerprint: Some(fingerprint),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct TestJob {
        id: String,
        content: String,
        fail: bool,
        slow: Option<Duration>,
        calls: Arc<AtomicUsize>,
    }

    impl TestJob {
        fn new(id: &str, content: &str, calls: &Arc<AtomicUsize>) -> Self {
            Self {
                id: id.into(),
                content: content.into(),
                fail: false,
                slow: None,
                calls: Arc::clone(calls),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn slow(mut self, d: Duration) -> Self {
            self.slow = Some(d);
            self
        }

        fn boxed(self) -> Box<dyn BuildJob> {
            Box::new(self)
        }
    }

    impl BuildJob for TestJob {
        fn artifact_id(&self) -> ArtifactId {
            ArtifactId::new(format!("page:{}", self.id))
        }

        fn inputs(&self) -> Vec<(InputId, Fingerprint)> {
            vec![(
                InputId::new(format!("content:{}", self.id)),
                Fingerprint::of_bytes(self.content.as_bytes()),
            )]
        }

        fn produce(&self, ctx: &BuildContext) -> Result<Vec<u8>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.slow {
                let until = Instant::now() + d;
                while Instant::now() < until {
                    ctx.check().map_err(|i| i.to_string())?;
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            if self.fail {
                return Err(format!("cannot render {}", self.id));
            }
            Ok(self.content.to_uppercase().into_bytes())
        }
    }

    fn scheduler(mode: BuildMode, workers: usize, deadline_secs: Option<u64>) -> BuildScheduler {
        let config = SchedulerConfig {
            workers,
            deadline_secs,
            mode,
        };
        BuildScheduler::new(
            config,
            Arc::new(ProvenanceStore::new("v1")),
            Arc::new(BuildCache::new(CacheConfig::default(), "v1")),
            "v1",
        )
    }

    #[test]
    fn transitions_only_move_forward() {
        let a = ArtifactId::new("page:a");
        let s = ArtifactState::Unknown
            .transition(&a, ArtifactState::Stale)
            .and_then(|s| s.transition(&a, ArtifactState::InProgress))
            .and_then(|s| s.transition(&a, ArtifactState::Done))
            .unwrap();
        assert!(s.is_terminal());
        assert!(matches!(
            ArtifactState::Done.transition(&a, ArtifactState::InProgress),
            Err(SchedulerError::IllegalTransition { .. })
        ));
        assert!(!ArtifactState::Unknown.can_transition(ArtifactState::InProgress));
        // A running artifact can always fail; a finished one never can.
        assert!(ArtifactState::InProgress.can_transition(ArtifactState::Failed));
        assert!(matches!(
            ArtifactState::Done.transition(&a, ArtifactState::Failed),
            Err(SchedulerError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn second_run_is_up_to_date() {
        let calls = Arc::new(AtomicUsize::new(0));
        let s = scheduler(BuildMode::Strict, 4, None);
        let jobs = || {
            vec![
                TestJob::new("a", "alpha", &calls).boxed(),
                TestJob::new("b", "beta", &calls).boxed(),
                TestJob::new("c", "gamma", &calls).boxed(),
            ]
        };

        let first = s.run(jobs()).unwrap();
        assert!(first.is_success());
        assert_eq!(first.succeeded.len(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let second = s.run(jobs()).unwrap();
        assert_eq!(second.up_to_date(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn changed_input_rebuilds_only_that_artifact() {
        let calls = Arc::new(AtomicUsize::new(0));
        let s = scheduler(BuildMode::Strict, 2, None);
        s.run(vec![
            TestJob::new("a", "alpha", &calls).boxed(),
            TestJob::new("b", "beta", &calls).boxed(),
        ])
        .unwrap();

        let report = s
            .run(vec![
                TestJob::new("a", "alpha v2", &calls).boxed(),
                TestJob::new("b", "beta", &calls).boxed(),
            ])
            .unwrap();
        assert_eq!(report.succeeded, vec![ArtifactId::new("page:a")]);
        assert_eq!(report.up_to_date(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failure_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let jobs = || {
            vec![
                TestJob::new("a", "alpha", &calls).boxed(),
                TestJob::new("bad", "x", &calls).failing().boxed(),
                TestJob::new("c", "gamma", &calls).boxed(),
            ]
        };

        let strict = scheduler(BuildMode::Strict, 3, None).run(jobs()).unwrap();
        assert_eq!(strict.succeeded.len(), 2);
        assert_eq!(strict.failed.len(), 1);
        assert_eq!(strict.failed[0].artifact, ArtifactId::new("page:bad"));
        assert!(matches!(strict.failed[0].reason, FailureReason::Producer(ref r) if r.contains("bad")));
        assert!(!strict.is_success());

        let lenient = scheduler(BuildMode::BestEffort, 3, None).run(jobs()).unwrap();
        assert_eq!(lenient.failed.len(), 1);
        assert!(lenient.is_success());
    }

    #[test]
    fn failed_artifact_is_retried_next_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let s = scheduler(BuildMode::Strict, 1, None);
        s.run(vec![TestJob::new("bad", "x", &calls).failing().boxed()])
            .unwrap();
        let report = s.run(vec![TestJob::new("bad", "x", &calls).boxed()]).unwrap();
        assert_eq!(report.succeeded, vec![ArtifactId::new("page:bad")]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fail_fast_cancels_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let s = scheduler(BuildMode::FailFast, 1, None);
        let report = s
            .run(vec![
                TestJob::new("a", "x", &calls).failing().boxed(),
                TestJob::new("b", "beta", &calls).boxed(),
                TestJob::new("c", "gamma", &calls).boxed(),
            ])
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().all(|s| s.reason == SkipReason::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn deadline_fails_slow_and_unstarted_jobs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let s = scheduler(BuildMode::Strict, 1, Some(1));
        let report = s
            .run(vec![
                TestJob::new("slow", "x", &calls)
                    .slow(Duration::from_secs(5))
                    .boxed(),
                TestJob::new("late", "y", &calls).boxed(),
            ])
            .unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| f.reason == FailureReason::Timeout));
        assert!(report.succeeded.is_empty());
    }

    #[test]
    fn external_cancel_skips_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();
        token.cancel();
        let report = scheduler(BuildMode::Strict, 2, None)
            .run_with(vec![TestJob::new("a", "alpha", &calls).boxed()], &token)
            .unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn duplicate_artifacts_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = scheduler(BuildMode::Strict, 1, None).run(vec![
            TestJob::new("a", "one", &calls).boxed(),
            TestJob::new("a", "two", &calls).boxed(),
        ]);
        assert!(matches!(result, Err(SchedulerError::DuplicateArtifact { .. })));
    }
}
