use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{info, warn};

use dnsprobe_config::{ConfigSource, DomainList, ProbeConfig, read_name_list};
use dnsprobe_core::orchestration::{
    AnalysisStore, CancellationController, MemoryStore, ProbeRuntime, ProcessLauncher, RunPlan,
    RunSummary, serve_stdio,
};

use crate::cli::{BatchArgs, Cli, Command, RefreshArgs};
use crate::engine::DnsEngineFactory;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let (config, source) = ProbeConfig::load(cli.global.config.as_deref())?;
    if source == ConfigSource::Default && !matches!(cli.command, Command::Worker) {
        info!("no configuration file found; using defaults");
    }

    match &cli.command {
        Command::Worker => run_worker(config).await,
        Command::Batch(args) => {
            let names = batch_names(args).await?;
            if names.is_empty() {
                warn!("no names to probe");
                return Ok(());
            }
            drive::<MemoryStore>(&cli, config, RunPlan::Batch { names }).await
        }
        Command::Refresh(args) => {
            let store = Arc::new(load_store(args, &config)?);
            drive(&cli, config, RunPlan::Refresh { store }).await
        }
    }
}

async fn drive<S>(cli: &Cli, config: ProbeConfig, plan: RunPlan<S>) -> anyhow::Result<()>
where
    S: AnalysisStore + ?Sized,
{
    let options = cli
        .run_options()
        .context("worker invocation cannot drive a run")?;
    let controller = Arc::new(CancellationController::new());
    let listener = controller.listen_for_signals();

    let factory = Arc::new(DnsEngineFactory::new(config.engine.clone()));
    let mut runtime = ProbeRuntime::new(options, config.orchestrator.clone(), factory)
        .with_controller(Arc::clone(&controller));
    if runtime.options().is_parallel() {
        let program = env::current_exe().context("failed to locate the dnsprobe executable")?;
        let launcher = ProcessLauncher::new(program)
            .args(cli.worker_args())
            .with_grace(config.orchestrator.dispatch.termination_grace());
        runtime = runtime.with_launcher(Arc::new(launcher));
    }

    let result = runtime.run(plan).await;
    listener.abort();

    let summary = result.map_err(|err| anyhow!(err)).context("probe run aborted")?;
    report(&summary);
    Ok(())
}

fn report(summary: &RunSummary) {
    let rendered = serde_json::to_string(summary).unwrap_or_default();
    info!(
        mode = %summary.mode,
        submitted = summary.submitted,
        completed = summary.tally.completed,
        failed = summary.tally.failed,
        aborted = summary.tally.aborted,
        cancelled = summary.cancelled,
        summary = %rendered,
        "run finished"
    );
}

async fn run_worker(config: ProbeConfig) -> anyhow::Result<()> {
    let controller = Arc::new(CancellationController::new());
    let listener = controller.listen_for_signals();
    let factory = DnsEngineFactory::new(config.engine);

    let result = serve_stdio(&factory, controller.token()).await;
    listener.abort();
    result.map_err(|err| anyhow!(err)).context("worker stopped")
}

async fn batch_names(args: &BatchArgs) -> anyhow::Result<Vec<String>> {
    if !args.names.is_empty() {
        return Ok(args.names.clone());
    }
    if let Some(path) = &args.file {
        let list = DomainList::load_from_file(path)?;
        return Ok(list.names().map(str::to_string).collect());
    }
    tokio::task::spawn_blocking(|| read_name_list(std::io::stdin().lock()))
        .await
        .context("stdin reader failed")?
}

fn domain_list_path(args: &RefreshArgs, config: &ProbeConfig) -> anyhow::Result<PathBuf> {
    args.domains
        .clone()
        .or_else(|| config.store.domains_path.clone())
        .context("refresh mode needs a domain list: pass --domains or set store.domains_path")
}

fn load_store(args: &RefreshArgs, config: &ProbeConfig) -> anyhow::Result<MemoryStore> {
    let path = domain_list_path(args, config)?;
    let store = DomainList::load_from_file(&path)?
        .into_store(config.store.default_refresh_interval())
        .with_context(|| format!("failed to build store from {}", path.display()))?;
    info!(path = %path.display(), "domain list loaded");
    Ok(store)
}
