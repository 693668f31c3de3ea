use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dnsprobe_daemon::cli::{Cli, Command};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Per-job outcomes at debug; failures and reports stay visible. Override via RUST_LOG.
                "info,dnsprobe::dispatch=info,dnsprobe::report=info,dnsprobe::worker=warn".into()
            }),
        )
        // stdout belongs to the worker protocol.
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let worker = matches!(cli.command, Command::Worker);
    let result = dnsprobe_daemon::app::run(cli).await;
    if worker {
        // The blocking stdin reader would otherwise keep the runtime alive.
        if let Err(err) = &result {
            tracing::error!(error = %format!("{err:#}"), "worker exiting");
        }
        std::process::exit(i32::from(result.is_err()));
    }
    result
}
