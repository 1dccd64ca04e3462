//! Error types shared by the engine and the audit store.

use thiserror::Error;

/// Why a single engine run did not succeed.
///
/// None of these abort the surrounding session: the engine folds them into
/// the [`ExecutionOutcome`](crate::executor::ExecutionOutcome) and the
/// command is still logged with status `error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecFailure {
    #[error("failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("failed to allocate pseudo-terminal: {0}")]
    PtyAllocationFailed(String),

    #[error("terminal i/o error: {0}")]
    Io(String),

    #[error("command exceeded its {budget_secs}s timeout and was terminated")]
    Timeout { budget_secs: u64 },

    #[error("command exited abnormally ({0})")]
    AbnormalExit(String),
}

impl ExecFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecFailure::Timeout { .. })
    }
}

/// Failures while reading or writing the persisted store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid engagement name: {0:?}")]
    InvalidEngagement(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = std::result::Result<T, PersistenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_recognised() {
        assert!(ExecFailure::Timeout { budget_secs: 60 }.is_timeout());
        assert!(!ExecFailure::Io("broken pipe".into()).is_timeout());
    }

    #[test]
    fn timeout_message_names_budget() {
        let msg = ExecFailure::Timeout { budget_secs: 7200 }.to_string();
        assert!(msg.contains("7200s"));
    }
}
