//! Job model, dispatchers, worker pool, refresh scheduling and shutdown.

pub mod batch;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod job;
pub mod network;
pub mod pool;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use batch::{BatchDriver, BatchSummary};
pub use cancel::{CancellationController, InterruptOutcome};
pub use config::{DispatchConfig, OrchestratorConfig, RefreshConfig, RunMode, RunOptions};
pub use dispatcher::{DispatchTally, Dispatcher, JobOutcome, SequentialDispatcher, run_job};
pub use engine::{AnalysisEngine, EngineFactory};
pub use job::{ClientAddresses, JobDescriptor, JobTemplate};
pub use pool::ParallelDispatcher;
pub use runtime::{ProbeRuntime, RunPlan, RunSummary};
pub use scheduler::{
    RefreshIntervalState, RefreshReport, RefreshScheduler, RefreshSummary, RunStatistics,
};
pub use store::{
    AnalysisStore, Clock, DomainEntry, ManualClock, MemoryStore, SystemClock, window_contains,
};
pub use worker::{
    InProcessLauncher, ProcessLauncher, Worker, WorkerLauncher, WorkerReply, WorkerRequest, serve,
    serve_stdio,
};
