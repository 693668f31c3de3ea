use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProbeError, Result};

use super::engine::AnalysisEngine;
use super::job::JobDescriptor;

/// Result of running one job. `Aborted` means the job was interrupted by a
/// shutdown request and is not a failure.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed,
    Failed { error: String },
    Aborted,
}

impl JobOutcome {
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => JobOutcome::Completed,
            Err(ProbeError::Cancelled(_)) => JobOutcome::Aborted,
            Err(err) => JobOutcome::Failed {
                error: err.to_string(),
            },
        }
    }
}

/// Runs one job against `engine`, racing it against `interrupt`.
///
/// An interrupt that is already pending when the job starts aborts it
/// without ever calling the engine.
pub async fn run_job(
    engine: &dyn AnalysisEngine,
    job: &JobDescriptor,
    interrupt: &CancellationToken,
) -> JobOutcome {
    tokio::select! {
        biased;
        _ = interrupt.cancelled() => JobOutcome::Aborted,
        result = engine.analyze(job) => JobOutcome::from_result(result),
    }
}

/// Aggregate job outcomes for a dispatcher's lifetime.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct DispatchTally {
    pub completed: u64,
    pub failed: u64,
    pub aborted: u64,
}

impl DispatchTally {
    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.aborted
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutcomeCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
}

impl OutcomeCounters {
    /// Logs the outcome against the job's name and counts it.
    pub(crate) fn record(&self, job: &JobDescriptor, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(target: "dnsprobe::dispatch", domain = %job.canonical_name(), "analysis completed");
            }
            JobOutcome::Failed { error } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "dnsprobe::dispatch",
                    domain = %job.canonical_name(),
                    error = %error,
                    "error analyzing domain"
                );
            }
            JobOutcome::Aborted => {
                self.aborted.fetch_add(1, Ordering::Relaxed);
                debug!(target: "dnsprobe::dispatch", domain = %job.canonical_name(), "analysis aborted by shutdown");
            }
        }
    }

    pub(crate) fn snapshot(&self) -> DispatchTally {
        DispatchTally {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

/// Hands jobs to the analysis engine under some concurrency policy.
///
/// Per-job errors never escape a dispatcher; `submit` only fails once the
/// dispatcher is shut down or cancelled.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Accepts one job, waiting while the dispatcher is at capacity.
    async fn submit(&self, job: JobDescriptor) -> Result<()>;

    /// Accepted jobs that no worker has picked up yet.
    fn queue_depth(&self) -> usize;

    fn tally(&self) -> DispatchTally;

    /// Stops accepting work and waits for everything accepted to finish.
    async fn close(&self);

    /// Stops accepting work and abandons in-flight jobs. Safe to call more
    /// than once and after `close`.
    async fn terminate(&self);
}

impl fmt::Debug for dyn Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_depth", &self.queue_depth())
            .field("tally", &self.tally())
            .finish()
    }
}

/// Runs jobs one at a time on the caller's task, in submission order.
pub struct SequentialDispatcher {
    engine: Arc<dyn AnalysisEngine>,
    abort: CancellationToken,
    closed: AtomicBool,
    running: Mutex<()>,
    counters: OutcomeCounters,
}

impl fmt::Debug for SequentialDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialDispatcher")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("aborted", &self.abort.is_cancelled())
            .field("tally", &self.counters.snapshot())
            .finish()
    }
}

impl SequentialDispatcher {
    /// `shutdown` is the run-wide token; cancelling it aborts the job in
    /// progress and refuses further submissions.
    pub fn new(engine: Arc<dyn AnalysisEngine>, shutdown: &CancellationToken) -> Self {
        Self {
            engine,
            abort: shutdown.child_token(),
            closed: AtomicBool::new(false),
            running: Mutex::new(()),
            counters: OutcomeCounters::default(),
        }
    }
}

#[async_trait]
impl Dispatcher for SequentialDispatcher {
    async fn submit(&self, job: JobDescriptor) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.abort.is_cancelled() {
            return Err(ProbeError::Cancelled("dispatcher is shut down".into()));
        }
        let _running = self.running.lock().await;
        let outcome = run_job(self.engine.as_ref(), &job, &self.abort).await;
        self.counters.record(&job, &outcome);
        Ok(())
    }

    fn queue_depth(&self) -> usize {
        0
    }

    fn tally(&self) -> DispatchTally {
        self.counters.snapshot()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _idle = self.running.lock().await;
    }

    async fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.abort.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::job::JobTemplate;
    use chrono::Utc;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingEngine {
        calls: std::sync::Mutex<Vec<String>>,
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl AnalysisEngine for RecordingEngine {
        async fn analyze(&self, job: &JobDescriptor) -> Result<()> {
            self.calls.lock().unwrap().push(job.name.clone());
            if self.failing.contains(&job.name.as_str()) {
                return Err(ProbeError::analysis(&job.name, "SERVFAIL"));
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct HangingEngine;

    #[async_trait]
    impl AnalysisEngine for HangingEngine {
        async fn analyze(&self, _job: &JobDescriptor) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(())
        }
    }

    fn jobs(names: &[&str]) -> Vec<JobDescriptor> {
        let start = Utc::now();
        let template = JobTemplate::default();
        names.iter().map(|n| template.job_for(*n, start)).collect()
    }

    #[tokio::test]
    async fn failure_does_not_stop_following_jobs() {
        let engine = Arc::new(RecordingEngine {
            failing: vec!["b.example"],
            ..Default::default()
        });
        let token = CancellationToken::new();
        let dispatcher = SequentialDispatcher::new(engine.clone(), &token);

        for job in jobs(&["a.example", "b.example", "c.example"]) {
            dispatcher.submit(job).await.unwrap();
        }
        dispatcher.close().await;

        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec!["a.example", "b.example", "c.example"]
        );
        let tally = dispatcher.tally();
        assert_eq!(tally.completed, 2);
        assert_eq!(tally.failed, 1);
    }

    #[tokio::test]
    async fn submit_after_close_is_refused() {
        let engine = Arc::new(RecordingEngine::default());
        let token = CancellationToken::new();
        let dispatcher = SequentialDispatcher::new(engine.clone(), &token);
        dispatcher.close().await;

        let err = dispatcher.submit(jobs(&["a.example"]).remove(0)).await;
        assert!(matches!(err, Err(ProbeError::Cancelled(_))));
        assert!(engine.calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_running_job_silently() {
        let token = CancellationToken::new();
        let dispatcher = Arc::new(SequentialDispatcher::new(Arc::new(HangingEngine), &token));

        let running = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.submit(jobs(&["slow.example"]).remove(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        running.await.unwrap().unwrap();
        let tally = dispatcher.tally();
        assert_eq!(tally.aborted, 1);
        assert_eq!(tally.failed, 0);

        dispatcher.terminate().await;
        dispatcher.terminate().await;
    }

    #[test]
    fn cancelled_error_maps_to_abort() {
        assert_eq!(
            JobOutcome::from_result(Err(ProbeError::Cancelled("interrupt".into()))),
            JobOutcome::Aborted
        );
        assert!(matches!(
            JobOutcome::from_result(Err(ProbeError::analysis("x.example", "timeout"))),
            JobOutcome::Failed { .. }
        ));
    }
}
