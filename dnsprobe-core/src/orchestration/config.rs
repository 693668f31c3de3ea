use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

/// Global knobs that tune dispatch and refresh behaviour.
///
/// All fields carry defaults so a partial configuration file only has to
/// mention the values it overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Worker pool tuning.
    pub dispatch: DispatchConfig,
    /// Refresh loop cadences.
    pub refresh: RefreshConfig,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.refresh.validate()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Jobs a worker completes before it is retired and replaced. Bounds the
    /// drift a long-lived worker accumulates.
    pub max_jobs_per_worker: usize,
    /// How long a worker gets to acknowledge an interrupt during cancelled
    /// shutdown before it is killed (ms).
    pub termination_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_worker: 50,
            termination_grace_ms: 2_000,
        }
    }
}

impl DispatchConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_jobs_per_worker == 0 {
            return Err(ProbeError::Internal(
                "dispatch.max_jobs_per_worker must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Target length of one scheduler cycle (seconds).
    pub poll_interval_secs: u64,
    /// Minimum spacing between two throughput reports (seconds).
    pub report_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            report_interval_secs: 1_800,
        }
    }
}

impl RefreshConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(ProbeError::Internal(
                "refresh.poll_interval_secs must be greater than zero".into(),
            ));
        }
        if self.report_interval_secs == 0 {
            return Err(ProbeError::Internal(
                "refresh.report_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// How a run produces its jobs. Resolved once, before any dispatcher exists.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunMode {
    /// Probe an explicit list of names once, then exit.
    #[default]
    Batch,
    /// Poll the store forever and probe names as their refresh comes due.
    Refresh,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Batch => write!(f, "batch"),
            RunMode::Refresh => write!(f, "refresh"),
        }
    }
}

/// Operator-facing switches for one invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOptions {
    pub force_ancestry: bool,
    pub dlv_domain: Option<String>,
    pub process_count: usize,
    pub mode: RunMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_ancestry: false,
            dlv_domain: None,
            process_count: 1,
            mode: RunMode::Batch,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.process_count == 0 {
            return Err(ProbeError::Internal(
                "process count must be at least 1".into(),
            ));
        }
        if let Some(dlv) = &self.dlv_domain
            && dlv.trim().is_empty()
        {
            return Err(ProbeError::Internal("DLV domain must not be empty".into()));
        }
        Ok(())
    }

    /// One process means no pool at all.
    pub fn is_parallel(&self) -> bool {
        self.process_count > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cadences() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.dispatch.max_jobs_per_worker, 50);
        assert_eq!(config.refresh.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.refresh.report_interval(), Duration::from_secs(1_800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"refresh": {"poll_interval_secs": 5}}"#).unwrap();
        assert_eq!(config.refresh.poll_interval_secs, 5);
        assert_eq!(config.refresh.report_interval_secs, 1_800);
        assert_eq!(config.dispatch.termination_grace_ms, 2_000);
    }

    #[test]
    fn zero_processes_rejected() {
        let options = RunOptions {
            process_count: 0,
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
        assert!(!RunOptions::default().is_parallel());
    }

    #[test]
    fn zero_recycle_threshold_rejected() {
        let config = DispatchConfig {
            max_jobs_per_worker: 0,
            ..DispatchConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
