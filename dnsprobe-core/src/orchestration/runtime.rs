use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::error::{ProbeError, Result};

use super::batch::BatchDriver;
use super::cancel::CancellationController;
use super::config::{OrchestratorConfig, RunMode, RunOptions};
use super::dispatcher::{DispatchTally, Dispatcher, SequentialDispatcher};
use super::engine::EngineFactory;
use super::job::JobTemplate;
use super::pool::ParallelDispatcher;
use super::scheduler::RefreshScheduler;
use super::store::AnalysisStore;
use super::worker::{InProcessLauncher, WorkerLauncher};

/// Work source for one run; must agree with [`RunOptions::mode`].
pub enum RunPlan<S: AnalysisStore + ?Sized> {
    Batch { names: Vec<String> },
    Refresh { store: Arc<S> },
}

impl<S: AnalysisStore + ?Sized> RunPlan<S> {
    pub fn mode(&self) -> RunMode {
        match self {
            RunPlan::Batch { .. } => RunMode::Batch,
            RunPlan::Refresh { .. } => RunMode::Refresh,
        }
    }
}

impl<S: AnalysisStore + ?Sized> fmt::Debug for RunPlan<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPlan::Batch { names } => f
                .debug_struct("Batch")
                .field("names", &names.len())
                .finish(),
            RunPlan::Refresh { .. } => f.debug_struct("Refresh").finish_non_exhaustive(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct RunSummary {
    pub mode: RunMode,
    pub submitted: u64,
    /// Refresh cycles completed; zero for batch runs.
    pub cycles: u64,
    pub cancelled: bool,
    pub tally: DispatchTally,
}

/// Wires options, engine factory and cancellation into a dispatcher and a
/// driver, then runs the driver to completion.
pub struct ProbeRuntime {
    options: RunOptions,
    config: OrchestratorConfig,
    factory: Arc<dyn EngineFactory>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
    controller: Arc<CancellationController>,
}

impl fmt::Debug for ProbeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRuntime")
            .field("options", &self.options)
            .field("config", &self.config)
            .field("custom_launcher", &self.launcher.is_some())
            .field("cancelled", &self.controller.is_cancelled())
            .finish()
    }
}

impl ProbeRuntime {
    pub fn new(
        options: RunOptions,
        config: OrchestratorConfig,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            options,
            config,
            factory,
            launcher: None,
            controller: Arc::new(CancellationController::new()),
        }
    }

    /// Pool workers come from `launcher` instead of in-process engines.
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_controller(mut self, controller: Arc<CancellationController>) -> Self {
        self.controller = controller;
        self
    }

    pub fn controller(&self) -> &Arc<CancellationController> {
        &self.controller
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Runs `plan`. A missing network fails here before any job is
    /// dispatched; per-job failures only show up in the summary's tally.
    pub async fn run<S>(&self, plan: RunPlan<S>) -> Result<RunSummary>
    where
        S: AnalysisStore + ?Sized,
    {
        self.options.validate()?;
        self.config.validate()?;
        if plan.mode() != self.options.mode {
            return Err(ProbeError::Internal(format!(
                "run mode is {} but a {} plan was supplied",
                self.options.mode,
                plan.mode()
            )));
        }

        let clients = self.factory.client_addresses().inspect_err(|err| {
            error!(target: "dnsprobe::network", error = %err, "cannot start analysis");
        })?;
        let engine = self.factory.build().inspect_err(|err| {
            error!(target: "dnsprobe::network", error = %err, "cannot build analysis engine");
        })?;

        let template = JobTemplate {
            dlv_domain: self.options.dlv_domain.clone(),
            clients,
            force_ancestry: self.options.force_ancestry,
        };
        let token = self.controller.token();

        let dispatcher: Arc<dyn Dispatcher> = if self.options.is_parallel() {
            drop(engine);
            let launcher = self.launcher.clone().unwrap_or_else(|| {
                Arc::new(InProcessLauncher::new(Arc::clone(&self.factory)))
            });
            Arc::new(ParallelDispatcher::new(
                self.options.process_count,
                launcher,
                self.config.dispatch,
                &token,
            )?)
        } else {
            Arc::new(SequentialDispatcher::new(engine, &token))
        };

        info!(
            target: "dnsprobe::dispatch",
            mode = %self.options.mode,
            processes = self.options.process_count,
            clients = %template.clients,
            "run starting"
        );

        let (submitted, cycles, cancelled) = match plan {
            RunPlan::Batch { names } => {
                let summary = BatchDriver::new(Arc::clone(&dispatcher), template, token)
                    .run(names)
                    .await?;
                (summary.submitted, 0, summary.cancelled)
            }
            RunPlan::Refresh { store } => {
                let summary = RefreshScheduler::new(
                    store,
                    Arc::clone(&dispatcher),
                    template,
                    self.config.refresh,
                    token,
                )
                .run()
                .await?;
                (summary.refreshed_total, summary.cycles, summary.cancelled)
            }
        };

        Ok(RunSummary {
            mode: self.options.mode,
            submitted,
            cycles,
            cancelled,
            tally: dispatcher.tally(),
        })
    }
}
