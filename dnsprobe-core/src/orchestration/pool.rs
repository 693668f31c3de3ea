use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ProbeError, Result};

use super::config::DispatchConfig;
use super::dispatcher::{DispatchTally, Dispatcher, JobOutcome, OutcomeCounters};
use super::job::JobDescriptor;
use super::worker::{Worker, WorkerLauncher};

/// A job travels with the permit that admitted it; the permit is released
/// only after the job has finished, so pending plus running never exceeds
/// the pool size.
struct QueuedJob {
    job: JobDescriptor,
    permit: OwnedSemaphorePermit,
}

/// Runs jobs across a fixed pool of workers.
///
/// `submit` blocks once `size` jobs are queued or running. Each slot
/// launches its worker lazily and replaces it after
/// [`DispatchConfig::max_jobs_per_worker`] jobs.
pub struct ParallelDispatcher {
    capacity: usize,
    permits: Arc<Semaphore>,
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    slots: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    abort: CancellationToken,
    counters: Arc<OutcomeCounters>,
}

impl fmt::Debug for ParallelDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelDispatcher")
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .field("queued", &self.queued.load(Ordering::SeqCst))
            .field("aborted", &self.abort.is_cancelled())
            .finish()
    }
}

impl ParallelDispatcher {
    /// Spawns `size` worker slots on the current runtime. Cancelling
    /// `shutdown` abandons in-flight jobs and refuses further submissions.
    pub fn new(
        size: usize,
        launcher: Arc<dyn WorkerLauncher>,
        config: DispatchConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        if size == 0 {
            return Err(ProbeError::Internal(
                "worker pool size must be at least 1".into(),
            ));
        }
        config.validate()?;

        let (sender, receiver) = mpsc::channel(size);
        let receiver = Arc::new(Mutex::new(receiver));
        let abort = shutdown.child_token();
        let queued = Arc::new(AtomicUsize::new(0));
        let counters = Arc::new(OutcomeCounters::default());

        let slots = (0..size)
            .map(|slot| {
                let ctx = SlotContext {
                    slot,
                    launcher: Arc::clone(&launcher),
                    receiver: Arc::clone(&receiver),
                    config,
                    abort: abort.clone(),
                    queued: Arc::clone(&queued),
                    counters: Arc::clone(&counters),
                };
                tokio::spawn(ctx.run())
            })
            .collect();

        info!(
            target: "dnsprobe::dispatch",
            workers = size,
            max_jobs_per_worker = config.max_jobs_per_worker,
            "worker pool started"
        );

        Ok(Self {
            capacity: size,
            permits: Arc::new(Semaphore::new(size)),
            sender: Mutex::new(Some(sender)),
            slots: Mutex::new(slots),
            queued,
            abort,
            counters,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs admitted and not yet finished, queued or running.
    pub fn outstanding(&self) -> usize {
        self.capacity
            .saturating_sub(self.permits.available_permits())
    }

    async fn join_slots(&self) {
        let handles = std::mem::take(&mut *self.slots.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                error!(target: "dnsprobe::dispatch", error = %err, "worker slot panicked");
            }
        }
    }
}

#[async_trait]
impl Dispatcher for ParallelDispatcher {
    async fn submit(&self, job: JobDescriptor) -> Result<()> {
        let permit = tokio::select! {
            biased;
            _ = self.abort.cancelled() => {
                return Err(ProbeError::Cancelled("dispatcher is shut down".into()));
            }
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map_err(|_| ProbeError::Cancelled("dispatcher is shut down".into()))?,
        };

        let Some(sender) = self.sender.lock().await.clone() else {
            return Err(ProbeError::Cancelled("dispatcher is shut down".into()));
        };
        self.queued.fetch_add(1, Ordering::SeqCst);
        if sender.send(QueuedJob { job, permit }).await.is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(ProbeError::Cancelled("worker pool has stopped".into()));
        }
        Ok(())
    }

    fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn tally(&self) -> DispatchTally {
        self.counters.snapshot()
    }

    async fn close(&self) {
        self.sender.lock().await.take();
        self.join_slots().await;
        self.permits.close();
        debug!(target: "dnsprobe::dispatch", tally = ?self.tally(), "worker pool drained");
    }

    async fn terminate(&self) {
        if !self.abort.is_cancelled() {
            info!(target: "dnsprobe::shutdown", "terminating worker pool");
        }
        self.abort.cancel();
        self.permits.close();
        self.sender.lock().await.take();
        self.join_slots().await;
    }
}

struct SlotContext {
    slot: usize,
    launcher: Arc<dyn WorkerLauncher>,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    config: DispatchConfig,
    abort: CancellationToken,
    queued: Arc<AtomicUsize>,
    counters: Arc<OutcomeCounters>,
}

impl SlotContext {
    async fn next_job(&self) -> Option<QueuedJob> {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            next = async { self.receiver.lock().await.recv().await } => next,
        }
    }

    fn grace(&self) -> Duration {
        self.config.termination_grace()
    }

    async fn run(self) {
        let mut worker: Option<Box<dyn Worker>> = None;
        let mut served = 0usize;

        while let Some(QueuedJob { job, permit }) = self.next_job().await {
            self.queued.fetch_sub(1, Ordering::SeqCst);

            if worker.is_none() {
                // A dropped launch kills a child still waiting on its handshake.
                let launched = tokio::select! {
                    biased;
                    _ = self.abort.cancelled() => None,
                    launched = self.launcher.launch(self.slot) => Some(launched),
                };
                let Some(launched) = launched else {
                    self.counters.record(&job, &JobOutcome::Aborted);
                    drop(permit);
                    break;
                };
                match launched {
                    Ok(launched) => {
                        debug!(target: "dnsprobe::worker", slot = self.slot, worker = %launched.id(), "worker launched");
                        worker = Some(launched);
                        served = 0;
                    }
                    Err(err) => {
                        if err.is_fatal() {
                            error!(target: "dnsprobe::worker", slot = self.slot, error = %err, "worker has no usable network");
                        }
                        self.counters.record(
                            &job,
                            &JobOutcome::Failed {
                                error: err.to_string(),
                            },
                        );
                        drop(permit);
                        continue;
                    }
                }
            }
            let Some(active) = worker.as_mut() else {
                continue;
            };

            let result = tokio::select! {
                biased;
                _ = self.abort.cancelled() => None,
                result = active.run(&job) => Some(result),
            };

            match result {
                None => {
                    self.counters.record(&job, &JobOutcome::Aborted);
                    if let Some(busy) = worker.take() {
                        debug!(target: "dnsprobe::shutdown", worker = %busy.id(), "interrupting busy worker");
                        busy.abort(self.grace()).await;
                    }
                    drop(permit);
                    break;
                }
                Some(Ok(outcome)) => {
                    served += 1;
                    self.counters.record(&job, &outcome);
                    // A worker that reports an abort has exited on its own.
                    if outcome == JobOutcome::Aborted
                        && let Some(gone) = worker.take()
                    {
                        gone.retire().await;
                    }
                }
                Some(Err(err)) => {
                    warn!(target: "dnsprobe::worker", slot = self.slot, error = %err, "worker lost; replacing");
                    self.counters.record(
                        &job,
                        &JobOutcome::Failed {
                            error: err.to_string(),
                        },
                    );
                    if let Some(lost) = worker.take() {
                        lost.abort(self.grace()).await;
                    }
                }
            }
            drop(permit);

            if served >= self.config.max_jobs_per_worker
                && let Some(spent) = worker.take()
            {
                debug!(target: "dnsprobe::worker", slot = self.slot, worker = %spent.id(), served, "recycling worker");
                spent.retire().await;
                served = 0;
            }
        }

        if let Some(idle) = worker.take() {
            if self.abort.is_cancelled() {
                idle.abort(self.grace()).await;
            } else {
                idle.retire().await;
            }
        }
        debug!(target: "dnsprobe::dispatch", slot = self.slot, "worker slot stopped");
    }
}
