use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProbeError, Result};

use super::config::RefreshConfig;
use super::dispatcher::Dispatcher;
use super::job::JobTemplate;
use super::store::AnalysisStore;

/// Rolling watermark for one refresh interval.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RefreshIntervalState {
    pub interval: Duration,
    /// Offset recorded at the end of the previous cycle. Unset until the
    /// interval has been seen once.
    pub last_offset: Option<Duration>,
}

impl RefreshIntervalState {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_offset: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunStatistics {
    pub refreshed_since_last_report: u64,
    pub refreshed_total: u64,
    pub last_report: Instant,
}

impl RunStatistics {
    fn new() -> Self {
        Self {
            refreshed_since_last_report: 0,
            refreshed_total: 0,
            last_report: Instant::now(),
        }
    }

    fn record(&mut self, dispatched: u64) {
        self.refreshed_since_last_report += dispatched;
        self.refreshed_total += dispatched;
    }
}

/// Periodic throughput record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RefreshReport {
    pub timestamp: DateTime<Utc>,
    pub refreshed_since_last_report: u64,
    pub pending_queue_depth: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RefreshSummary {
    pub cycles: u64,
    pub refreshed_total: u64,
    pub cancelled: bool,
}

/// Polls the store on a fixed cadence and dispatches names whose refresh
/// offset was crossed since the previous cycle.
///
/// An interval seen for the first time only records its offset; nothing is
/// dispatched for it until the next cycle.
pub struct RefreshScheduler<S: AnalysisStore + ?Sized> {
    store: Arc<S>,
    dispatcher: Arc<dyn Dispatcher>,
    template: JobTemplate,
    config: RefreshConfig,
    intervals: BTreeMap<Duration, RefreshIntervalState>,
    stats: RunStatistics,
    shutdown: CancellationToken,
}

impl<S: AnalysisStore + ?Sized> fmt::Debug for RefreshScheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("intervals", &self.intervals.len())
            .field("stats", &self.stats)
            .field("config", &self.config)
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<S: AnalysisStore + ?Sized> RefreshScheduler<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<dyn Dispatcher>,
        template: JobTemplate,
        config: RefreshConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            template,
            config,
            intervals: BTreeMap::new(),
            stats: RunStatistics::new(),
            shutdown,
        }
    }

    pub fn interval_state(&self, interval: Duration) -> Option<&RefreshIntervalState> {
        self.intervals.get(&interval)
    }

    pub fn intervals(&self) -> impl Iterator<Item = &RefreshIntervalState> {
        self.intervals.values()
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.stats
    }

    /// Tracks intervals the store reports and forgets the ones it no longer
    /// does.
    pub async fn reconcile(&mut self) -> Result<()> {
        let current = self.store.distinct_refresh_intervals().await?;

        self.intervals.retain(|interval, _| {
            let keep = current.contains(interval);
            if !keep {
                debug!(target: "dnsprobe::refresh", interval_secs = interval.as_secs(), "refresh interval dropped");
            }
            keep
        });
        let poll = self.config.poll_interval();
        for interval in current {
            self.intervals.entry(interval).or_insert_with(|| {
                if interval <= poll {
                    warn!(
                        target: "dnsprobe::refresh",
                        interval_secs = interval.as_secs(),
                        poll_secs = poll.as_secs(),
                        "refresh interval does not exceed the poll cadence; its names are refreshed every cycle"
                    );
                } else {
                    debug!(target: "dnsprobe::refresh", interval_secs = interval.as_secs(), "refresh interval observed");
                }
                RefreshIntervalState::new(interval)
            });
        }
        Ok(())
    }

    /// One pass over every tracked interval. Returns the number of jobs
    /// dispatched; fails only when cancelled mid-cycle.
    pub async fn run_cycle(&mut self) -> Result<u64> {
        if let Err(err) = self.reconcile().await {
            warn!(target: "dnsprobe::refresh", error = %err, "failed to list refresh intervals");
        }

        let start_time = Utc::now();
        let mut dispatched = 0u64;
        let tracked: Vec<Duration> = self.intervals.keys().copied().collect();

        for interval in tracked {
            let current = self.store.offset_for_interval(interval);
            let Some(state) = self.intervals.get(&interval).copied() else {
                continue;
            };

            if let Some(since) = state.last_offset {
                let names = match self.due_names(interval, since, current).await {
                    Ok(names) => names,
                    Err(err) => {
                        warn!(
                            target: "dnsprobe::refresh",
                            interval_secs = interval.as_secs(),
                            error = %err,
                            "failed to query due names; retrying next cycle"
                        );
                        continue;
                    }
                };

                for name in names {
                    if self.shutdown.is_cancelled() {
                        return Err(ProbeError::Cancelled("refresh cycle interrupted".into()));
                    }
                    self.dispatcher
                        .submit(self.template.job_for(name, start_time))
                        .await?;
                    dispatched += 1;
                    self.stats.record(1);
                }
            }

            if let Some(state) = self.intervals.get_mut(&interval) {
                state.last_offset = Some(current);
            }
        }

        debug!(target: "dnsprobe::refresh", dispatched, intervals = self.intervals.len(), "refresh cycle finished");
        Ok(dispatched)
    }

    /// Names crossed between `since` and `until`. An interval no longer than
    /// the poll cadence completes at least one lap between cycles, so its
    /// whole cycle is due: `(until, interval]` plus the wrapped `[0, until]`.
    async fn due_names(
        &self,
        interval: Duration,
        since: Duration,
        until: Duration,
    ) -> Result<BTreeSet<String>> {
        if interval > self.config.poll_interval() {
            return self.store.names_due_for_refresh(interval, since, until).await;
        }
        let mut names = self
            .store
            .names_due_for_refresh(interval, until, interval)
            .await?;
        names.extend(
            self.store
                .names_due_for_refresh(interval, interval, until)
                .await?,
        );
        Ok(names)
    }

    /// Emits a report once more than the reporting cadence has passed since
    /// the previous one, resetting the per-report counter.
    pub fn maybe_report(&mut self) -> Option<RefreshReport> {
        if self.stats.last_report.elapsed() <= self.config.report_interval() {
            return None;
        }
        let report = RefreshReport {
            timestamp: Utc::now(),
            refreshed_since_last_report: self.stats.refreshed_since_last_report,
            pending_queue_depth: self.dispatcher.queue_depth(),
        };
        info!(
            target: "dnsprobe::report",
            timestamp = %report.timestamp,
            refreshed = report.refreshed_since_last_report,
            queue_depth = report.pending_queue_depth,
            "refresh throughput"
        );
        self.stats.refreshed_since_last_report = 0;
        self.stats.last_report = Instant::now();
        Some(report)
    }

    /// Runs cycles until the shutdown token fires, then tears down the
    /// dispatcher.
    pub async fn run(mut self) -> Result<RefreshSummary> {
        let poll = self.config.poll_interval();
        let mut cycles = 0u64;
        info!(
            target: "dnsprobe::refresh",
            poll_secs = poll.as_secs(),
            report_secs = self.config.report_interval_secs,
            "refresh scheduler started"
        );

        while !self.shutdown.is_cancelled() {
            let cycle_start = Instant::now();
            match self.run_cycle().await {
                Ok(_) => {}
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    warn!(target: "dnsprobe::refresh", error = %err, "refresh cycle failed");
                }
            }
            cycles += 1;

            let remaining = poll.saturating_sub(cycle_start.elapsed());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
            self.maybe_report();
        }

        let cancelled = self.shutdown.is_cancelled();
        if cancelled {
            info!(target: "dnsprobe::shutdown", cycles, "refresh scheduler stopping");
            self.dispatcher.terminate().await;
        } else {
            self.dispatcher.close().await;
        }

        Ok(RefreshSummary {
            cycles,
            refreshed_total: self.stats.refreshed_total,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::dispatcher::DispatchTally;
    use crate::orchestration::job::JobDescriptor;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const HOUR: Duration = Duration::from_secs(3_600);

    #[derive(Debug, Default)]
    struct RecordingDispatcher {
        jobs: Mutex<Vec<JobDescriptor>>,
        closed: AtomicBool,
        terminated: AtomicBool,
    }

    impl RecordingDispatcher {
        fn names(&self) -> Vec<String> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .map(|job| job.name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn submit(&self, job: JobDescriptor) -> Result<()> {
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }

        fn queue_depth(&self) -> usize {
            7
        }

        fn tally(&self) -> DispatchTally {
            DispatchTally::default()
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        async fn terminate(&self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Default)]
    struct ScriptedStore {
        intervals: Mutex<BTreeSet<Duration>>,
        offsets: Mutex<VecDeque<Duration>>,
        due: Mutex<BTreeSet<String>>,
        queries: Mutex<Vec<(Duration, Duration, Duration)>>,
        failing: AtomicBool,
    }

    impl ScriptedStore {
        fn hourly(offsets: &[u64]) -> Self {
            let store = Self::default();
            store.intervals.lock().unwrap().insert(HOUR);
            store
                .offsets
                .lock()
                .unwrap()
                .extend(offsets.iter().map(|s| Duration::from_secs(*s)));
            store
        }
    }

    #[async_trait]
    impl AnalysisStore for ScriptedStore {
        async fn distinct_refresh_intervals(&self) -> Result<BTreeSet<Duration>> {
            Ok(self.intervals.lock().unwrap().clone())
        }

        fn offset_for_interval(&self, _interval: Duration) -> Duration {
            let mut offsets = self.offsets.lock().unwrap();
            if offsets.len() > 1 {
                offsets.pop_front().unwrap_or_default()
            } else {
                offsets.front().copied().unwrap_or_default()
            }
        }

        async fn names_due_for_refresh(
            &self,
            interval: Duration,
            since: Duration,
            until: Duration,
        ) -> Result<BTreeSet<String>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProbeError::Store("connection reset".into()));
            }
            self.queries.lock().unwrap().push((interval, since, until));
            Ok(self.due.lock().unwrap().clone())
        }
    }

    fn scheduler(
        store: Arc<ScriptedStore>,
        dispatcher: Arc<RecordingDispatcher>,
        token: CancellationToken,
    ) -> RefreshScheduler<ScriptedStore> {
        RefreshScheduler::new(
            store,
            dispatcher,
            JobTemplate::default(),
            RefreshConfig::default(),
            token,
        )
    }

    #[tokio::test]
    async fn first_cycle_only_records_offset() {
        let store = Arc::new(ScriptedStore::hourly(&[100, 160]));
        store
            .due
            .lock()
            .unwrap()
            .extend(["a.example".to_string(), "b.example".to_string()]);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut scheduler = scheduler(store.clone(), dispatcher.clone(), CancellationToken::new());

        assert_eq!(scheduler.run_cycle().await.unwrap(), 0);
        assert_eq!(
            scheduler.interval_state(HOUR).unwrap().last_offset,
            Some(Duration::from_secs(100))
        );
        assert!(store.queries.lock().unwrap().is_empty());

        assert_eq!(scheduler.run_cycle().await.unwrap(), 2);
        assert_eq!(
            *store.queries.lock().unwrap(),
            vec![(HOUR, Duration::from_secs(100), Duration::from_secs(160))]
        );
        assert_eq!(dispatcher.names(), vec!["a.example", "b.example"]);
        assert_eq!(scheduler.statistics().refreshed_since_last_report, 2);
        assert_eq!(
            scheduler.interval_state(HOUR).unwrap().last_offset,
            Some(Duration::from_secs(160))
        );
    }

    #[tokio::test]
    async fn jobs_of_one_cycle_share_start_time() {
        let store = Arc::new(ScriptedStore::hourly(&[0, 60]));
        store
            .due
            .lock()
            .unwrap()
            .extend(["x.example".to_string(), "y.example".to_string()]);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut scheduler = scheduler(store, dispatcher.clone(), CancellationToken::new());

        scheduler.run_cycle().await.unwrap();
        scheduler.run_cycle().await.unwrap();

        let jobs = dispatcher.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].start_time, jobs[1].start_time);
    }

    #[tokio::test]
    async fn stale_intervals_are_dropped_and_new_ones_wait() {
        let store = Arc::new(ScriptedStore::hourly(&[100]));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut scheduler = scheduler(store.clone(), dispatcher, CancellationToken::new());
        scheduler.run_cycle().await.unwrap();

        {
            let mut intervals = store.intervals.lock().unwrap();
            intervals.clear();
            intervals.insert(Duration::from_secs(86_400));
        }
        scheduler.run_cycle().await.unwrap();

        assert!(scheduler.interval_state(HOUR).is_none());
        assert_eq!(
            scheduler
                .interval_state(Duration::from_secs(86_400))
                .unwrap()
                .last_offset,
            Some(Duration::from_secs(100))
        );
        assert!(store.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_failure_keeps_previous_watermark() {
        let store = Arc::new(ScriptedStore::hourly(&[100, 160, 220]));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut scheduler = scheduler(store.clone(), dispatcher, CancellationToken::new());

        scheduler.run_cycle().await.unwrap();
        store.failing.store(true, Ordering::SeqCst);
        scheduler.run_cycle().await.unwrap();
        assert_eq!(
            scheduler.interval_state(HOUR).unwrap().last_offset,
            Some(Duration::from_secs(100))
        );

        store.failing.store(false, Ordering::SeqCst);
        scheduler.run_cycle().await.unwrap();
        assert_eq!(
            *store.queries.lock().unwrap(),
            vec![(HOUR, Duration::from_secs(100), Duration::from_secs(220))]
        );
    }

    #[tokio::test]
    async fn short_interval_queries_whole_cycle() {
        let half_minute = Duration::from_secs(30);
        let store = Arc::new(ScriptedStore::default());
        store.intervals.lock().unwrap().insert(half_minute);
        store
            .offsets
            .lock()
            .unwrap()
            .extend([Duration::from_secs(12), Duration::from_secs(12)]);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut scheduler = scheduler(store.clone(), dispatcher, CancellationToken::new());

        scheduler.run_cycle().await.unwrap();
        scheduler.run_cycle().await.unwrap();

        assert_eq!(
            *store.queries.lock().unwrap(),
            vec![
                (half_minute, Duration::from_secs(12), half_minute),
                (half_minute, half_minute, Duration::from_secs(12)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn report_fires_after_cadence_and_resets_counter() {
        let store = Arc::new(ScriptedStore::hourly(&[100, 160]));
        store.due.lock().unwrap().insert("a.example".to_string());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let mut scheduler = scheduler(store, dispatcher, CancellationToken::new());

        scheduler.run_cycle().await.unwrap();
        scheduler.run_cycle().await.unwrap();
        assert!(scheduler.maybe_report().is_none());

        tokio::time::advance(Duration::from_secs(1_801)).await;
        let report = scheduler.maybe_report().unwrap();
        assert_eq!(report.refreshed_since_last_report, 1);
        assert_eq!(report.pending_queue_depth, 7);
        assert_eq!(scheduler.statistics().refreshed_since_last_report, 0);
        assert_eq!(scheduler.statistics().refreshed_total, 1);
        assert!(scheduler.maybe_report().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_on_cadence_until_cancelled() {
        let store = Arc::new(ScriptedStore::hourly(&[100, 160, 220, 280]));
        store.due.lock().unwrap().insert("a.example".to_string());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let token = CancellationToken::new();
        let scheduler = scheduler(store, dispatcher.clone(), token.clone());

        let running = tokio::spawn(scheduler.run());
        // Cycles start at t=0, 60, 120; cancel during the third sleep.
        tokio::time::sleep(Duration::from_secs(150)).await;
        token.cancel();

        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.refreshed_total, 2);
        assert!(summary.cancelled);
        assert!(dispatcher.terminated.load(Ordering::SeqCst));
        assert!(!dispatcher.closed.load(Ordering::SeqCst));
    }
}
