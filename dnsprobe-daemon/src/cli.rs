use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use dnsprobe_core::orchestration::{RunMode, RunOptions};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "dnsprobe")]
#[command(about = "Recurring DNS probes across a pool of worker processes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file (TOML or JSON); overrides $DNSPROBE_CONFIG_PATH
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Worker processes; 1 runs every probe in this process
    #[arg(
        short = 'n',
        long,
        global = true,
        env = "DNSPROBE_PROCESSES",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub processes: u32,

    /// Also probe every ancestor zone of each name
    #[arg(short = 'A', long, global = true, default_value_t = false)]
    pub force_ancestry: bool,

    /// DNSSEC lookaside validation registry to query
    #[arg(short = 'D', long, global = true)]
    pub dlv_domain: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Probe a list of names once and exit
    Batch(BatchArgs),
    /// Re-probe names from the domain list as their refresh comes due
    Refresh(RefreshArgs),
    /// Serve probe requests on stdin/stdout (used by the worker pool)
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Names to probe; read from --file or stdin when empty
    pub names: Vec<String>,

    /// Read names from a domain list file
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RefreshArgs {
    /// Domain list to load into the refresh store (overrides store.domains_path)
    #[arg(long)]
    pub domains: Option<PathBuf>,
}

impl Cli {
    pub fn mode(&self) -> Option<RunMode> {
        match self.command {
            Command::Batch(_) => Some(RunMode::Batch),
            Command::Refresh(_) => Some(RunMode::Refresh),
            Command::Worker => None,
        }
    }

    /// Run options for a driver invocation; `None` for the worker.
    pub fn run_options(&self) -> Option<RunOptions> {
        Some(RunOptions {
            force_ancestry: self.global.force_ancestry,
            dlv_domain: self.global.dlv_domain.clone(),
            process_count: self.global.processes as usize,
            mode: self.mode()?,
        })
    }

    /// Arguments a pool worker needs to load the same engine settings.
    pub fn worker_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(path) = &self.global.config {
            args.push(OsString::from("--config"));
            args.push(path.clone().into_os_string());
        }
        args.push(OsString::from("worker"));
        args
    }
}
