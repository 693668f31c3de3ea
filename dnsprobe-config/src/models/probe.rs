use anyhow::{Context, anyhow, bail};
use dnsprobe_core::orchestration::OrchestratorConfig;
use dnsprobe_core::orchestration::network::{ROOT_PROBE_V4, ROOT_PROBE_V6};
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

/// Source that produced the probe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Top-level settings for a dnsprobe run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Dispatch and refresh cadences. Raising `refresh.poll_interval_secs`
    /// lowers store load at the cost of coarser refresh timing.
    pub orchestrator: OrchestratorConfig,
    /// How probes are sent.
    pub engine: EngineConfig,
    /// Where refresh mode reads its domains from.
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Recursive resolvers queried in order until one answers.
    pub resolvers: Vec<SocketAddr>,
    /// Upper bound for a single query (ms). The dispatcher enforces no
    /// timeout of its own, so this is what bounds a stuck probe.
    pub query_timeout_ms: u64,
    /// Addresses used only to discover local source addresses.
    pub connectivity_probe_v4: SocketAddr,
    pub connectivity_probe_v6: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resolvers: vec![
                SocketAddr::from(([1, 1, 1, 1], 53)),
                SocketAddr::from(([8, 8, 8, 8], 53)),
            ],
            query_timeout_ms: 5_000,
            connectivity_probe_v4: ROOT_PROBE_V4,
            connectivity_probe_v6: ROOT_PROBE_V6,
        }
    }
}

impl EngineConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Domain list loaded into the in-memory store (TOML, JSON or plain
    /// text).
    pub domains_path: Option<PathBuf>,
    /// Interval for entries that do not name one (seconds).
    pub default_refresh_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            domains_path: None,
            default_refresh_interval_secs: 86_400,
        }
    }
}

impl StoreConfig {
    pub fn default_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.default_refresh_interval_secs)
    }
}

const ENV_PATH: &str = "DNSPROBE_CONFIG_PATH";
const ENV_JSON: &str = "DNSPROBE_CONFIG_JSON";
const DEFAULT_FILES: &[&str] = &[
    "dnsprobe.toml",
    "dnsprobe.json",
    "config/dnsprobe.toml",
    "config/dnsprobe.json",
];

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl ConfigSource {
    /// Picks where configuration comes from without reading it: `explicit`,
    /// then `$DNSPROBE_CONFIG_PATH`, then `$DNSPROBE_CONFIG_JSON`, then the
    /// first default file present in the working directory.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::Explicit(path.to_path_buf());
        }
        if let Some(path) = env_value(ENV_PATH) {
            return Self::EnvPath(PathBuf::from(path));
        }
        if env_value(ENV_JSON).is_some() {
            return Self::EnvInline;
        }
        DEFAULT_FILES
            .iter()
            .map(Path::new)
            .find(|path| path.is_file())
            .map(|path| Self::File(path.to_path_buf()))
            .unwrap_or_default()
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Explicit(path) | Self::EnvPath(path) | Self::File(path) => Some(path),
            Self::Default | Self::EnvInline => None,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("built-in defaults"),
            Self::EnvInline => write!(f, "${ENV_JSON}"),
            Self::Explicit(path) | Self::EnvPath(path) | Self::File(path) => {
                write!(f, "{}", path.display())
            }
        }
    }
}

/// Encoding of a config document.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigFormat {
    Toml,
    Json,
    /// Unknown extension: TOML first, then JSON.
    Either,
}

impl ConfigFormat {
    pub fn of(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::Json,
            Some("toml") | Some("tml") => Self::Toml,
            _ => Self::Either,
        }
    }
}

impl ProbeConfig {
    /// Resolves, reads and validates the configuration.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, ConfigSource)> {
        let source = ConfigSource::resolve(explicit);
        let config = Self::read(&source)?;
        config
            .validate()
            .with_context(|| format!("configuration from {source} rejected"))?;
        debug!(%source, "configuration loaded");
        Ok((config, source))
    }

    /// Reads the document `source` points at, without validating it.
    pub fn read(source: &ConfigSource) -> anyhow::Result<Self> {
        match source {
            ConfigSource::Default => Ok(Self::default()),
            ConfigSource::EnvInline => {
                let raw = env_value(ENV_JSON)
                    .with_context(|| format!("${ENV_JSON} was cleared before it could be read"))?;
                Self::parse(&raw, ConfigFormat::Json)
                    .with_context(|| format!("${ENV_JSON} holds no usable dnsprobe config"))
            }
            ConfigSource::Explicit(path) | ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
                Self::load_from_file(path)
            }
        }
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read dnsprobe config {}", path.display()))?;
        Self::parse(&contents, ConfigFormat::of(path))
            .with_context(|| format!("{} holds no usable dnsprobe config", path.display()))
    }

    pub fn parse(contents: &str, format: ConfigFormat) -> anyhow::Result<Self> {
        match format {
            ConfigFormat::Toml => Ok(toml::from_str(contents)?),
            ConfigFormat::Json => Ok(serde_json::from_str(contents)?),
            ConfigFormat::Either => toml::from_str(contents).or_else(|toml_err| {
                serde_json::from_str(contents).map_err(|json_err| {
                    anyhow!("neither TOML ({toml_err}) nor JSON ({json_err})")
                })
            }),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.orchestrator
            .validate()
            .map_err(|err| anyhow!("{err}"))?;
        if self.engine.resolvers.is_empty() {
            bail!("engine.resolvers must list at least one resolver");
        }
        if self.engine.query_timeout_ms == 0 {
            bail!("engine.query_timeout_ms must be greater than zero");
        }
        if self.store.default_refresh_interval_secs == 0 {
            bail!("store.default_refresh_interval_secs must be greater than zero");
        }
        if self.store.default_refresh_interval_secs <= self.orchestrator.refresh.poll_interval_secs
        {
            warn!(
                interval_secs = self.store.default_refresh_interval_secs,
                poll_secs = self.orchestrator.refresh.poll_interval_secs,
                "default refresh interval does not exceed the poll cadence; such names are refreshed every cycle"
            );
        }
        Ok(())
    }
}
