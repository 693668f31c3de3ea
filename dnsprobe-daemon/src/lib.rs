//! # dnsprobe
//!
//! Command-line runner for recurring DNS probes.
//!
//! - `dnsprobe batch` probes an explicit list of names once
//! - `dnsprobe refresh` keeps re-probing names from a domain list as their
//!   refresh intervals come due
//! - `-n N` spreads probes over `N` worker processes, each running the hidden
//!   `dnsprobe worker` subcommand

pub mod app;
pub mod cli;
pub mod engine;
