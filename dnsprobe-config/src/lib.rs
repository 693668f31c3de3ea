//! Configuration loading for dnsprobe.
//!
//! Resolves the probe configuration from an explicit path, the environment,
//! or well-known files, and reads the domain lists that feed batch runs and
//! the in-memory refresh store.

pub mod models;

pub use models::domains::{DomainList, DomainSpec, parse_name_list, read_name_list};
pub use models::probe::{ConfigFormat, ConfigSource, EngineConfig, ProbeConfig, StoreConfig};
