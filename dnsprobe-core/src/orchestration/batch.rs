use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;

use super::dispatcher::Dispatcher;
use super::job::JobTemplate;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct BatchSummary {
    pub submitted: u64,
    pub cancelled: bool,
}

/// One-shot driver: probes an explicit list of names once.
#[derive(Debug)]
pub struct BatchDriver {
    dispatcher: Arc<dyn Dispatcher>,
    template: JobTemplate,
    shutdown: CancellationToken,
}

impl BatchDriver {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        template: JobTemplate,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            template,
            shutdown,
        }
    }

    /// Submits every name with one shared start time, then drains the
    /// dispatcher. Cancellation stops submission and terminates instead.
    pub async fn run<I, N>(self, names: I) -> Result<BatchSummary>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let start_time = Utc::now();
        let mut submitted = 0u64;

        for name in names {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self
                .dispatcher
                .submit(self.template.job_for(name, start_time))
                .await
            {
                Ok(()) => submitted += 1,
                Err(err) if err.is_cancelled() => {
                    debug!(target: "dnsprobe::dispatch", error = %err, "submission refused");
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        let cancelled = self.shutdown.is_cancelled();
        if cancelled {
            info!(target: "dnsprobe::shutdown", submitted, "batch interrupted");
            self.dispatcher.terminate().await;
        } else {
            self.dispatcher.close().await;
            info!(target: "dnsprobe::dispatch", submitted, "batch finished");
        }

        Ok(BatchSummary {
            submitted,
            cancelled,
        })
    }
}
