use crate::models::deployment::DeploymentState;

/// Error taxonomy for the guard. Variants map onto how the controller is
/// allowed to react: preconditions are rejected synchronously, transient
/// failures may be retried a bounded number of times, ambiguous and fatal
/// conditions halt automation and page an operator.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: DeploymentState,
        to: DeploymentState,
    },

    #[error("rollback already in progress")]
    RollbackInProgress,

    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Retryable infrastructure failure (timeout, 5xx, connection refused).
    #[error("transient failure: {0}")]
    Transient(String),

    /// An external call whose outcome is unknown. Never treated as success.
    #[error("ambiguous outcome: {0}")]
    Ambiguous(String),

    /// Automation halts; requires operator intervention.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("migration tool error: {0}")]
    Migration(String),
}

impl GuardError {
    /// Whether the retry helper may re-attempt the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, GuardError::Transient(_))
    }
}

impl From<rusqlite::Error> for GuardError {
    fn from(e: rusqlite::Error) -> Self {
        GuardError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(e: serde_json::Error) -> Self {
        GuardError::Store(format!("serialization: {e}"))
    }
}

pub type GuardResult<T> = Result<T, GuardError>;
