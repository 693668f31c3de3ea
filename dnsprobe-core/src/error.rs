use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No usable network interface: {0}")]
    NetworkUnavailable(String),

    #[error("Analysis of {name} failed: {message}")]
    Analysis { name: String, message: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Worker launch failed: {0}")]
    WorkerLaunch(String),

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProbeError {
    pub fn analysis(name: impl Into<String>, message: impl Into<String>) -> Self {
        ProbeError::Analysis {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Only a missing network aborts a whole run; everything else is scoped
    /// to a job, a worker, or a scheduler cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProbeError::NetworkUnavailable(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProbeError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;
