use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

use super::job::{ClientAddresses, JobDescriptor};

/// Performs one probe. Any error returned here is scoped to the job; the
/// dispatcher logs it against the job's name and moves on.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(&self, job: &JobDescriptor) -> Result<()>;
}

/// Builds engines for the driver and for every (re)launched worker.
///
/// Both methods may fail with [`crate::ProbeError::NetworkUnavailable`]; the
/// runtime calls them before the first dispatch so that condition aborts the
/// run instead of failing every job.
pub trait EngineFactory: Send + Sync {
    /// Local source addresses jobs should carry.
    fn client_addresses(&self) -> Result<ClientAddresses>;

    fn build(&self) -> Result<Arc<dyn AnalysisEngine>>;
}

impl fmt::Debug for dyn AnalysisEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnalysisEngine")
    }
}

impl fmt::Debug for dyn EngineFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EngineFactory")
    }
}
