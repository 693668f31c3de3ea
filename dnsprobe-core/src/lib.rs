//! # dnsprobe core
//!
//! Scheduling and dispatch engine for recurring DNS probes.
//!
//! ## Overview
//!
//! `dnsprobe-core` decides *when* each monitored domain is due for another
//! probe and fans the resulting work out to a bounded pool of workers:
//!
//! - **Jobs**: [`orchestration::job::JobDescriptor`] is the plain value that
//!   crosses every concurrency boundary
//! - **Dispatch**: a sequential dispatcher for single-process runs and a
//!   parallel dispatcher with blocking backpressure and worker recycling
//! - **Workers**: in-process workers for tests and embedding, child-process
//!   workers speaking newline-delimited JSON for isolation
//! - **Refresh scheduling**: per-interval rolling offset windows queried from
//!   an [`orchestration::store::AnalysisStore`]
//! - **Cancellation**: idempotent interrupt handling that tears the pool down
//!   without letting a repeated signal escape
//!
//! The DNS analysis itself and the persistent store are collaborators behind
//! the [`orchestration::engine::AnalysisEngine`] and
//! [`orchestration::store::AnalysisStore`] traits.

pub mod error;
pub mod orchestration;

pub use error::{ProbeError, Result};
