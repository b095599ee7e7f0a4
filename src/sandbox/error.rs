//! Handle-level error types.

use crate::error::RunError;
use crate::types::TaskId;
use std::fmt;

/// Failures of a sandbox handle itself, as opposed to the program it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxErrorKind {
    /// The configured interpreter could not be found on this host.
    InterpreterNotFound {
        /// The interpreter that was looked up
        interpreter: String,
    },

    /// Launching the hosting context failed.
    SpawnFailed {
        /// Detailed reason for the failure
        reason: String,
    },

    /// The handle was used after `destroy()`.
    AlreadyDestroyed,

    /// A request could not be delivered to the hosting context.
    RequestFailed {
        /// Detailed reason for the failure
        reason: String,
    },

    /// Invalid configuration provided.
    InvalidConfiguration {
        /// The configuration field that is invalid
        field: String,
        /// Why it's invalid
        reason: String,
    },
}

impl SandboxErrorKind {
    /// Converts this failure into the environment error a task settles with.
    #[must_use]
    pub fn into_run_error(self, task_id: Option<TaskId>) -> RunError {
        RunError::environment(task_id, self.to_string())
    }
}

impl fmt::Display for SandboxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InterpreterNotFound { interpreter } => {
                write!(
                    f,
                    "interpreter '{interpreter}' not found; install it or set process.interpreter"
                )
            }
            Self::SpawnFailed { reason } => {
                write!(f, "failed to start sandbox: {reason}")
            }
            Self::AlreadyDestroyed => {
                write!(f, "sandbox has already been destroyed")
            }
            Self::RequestFailed { reason } => {
                write!(f, "failed to deliver request to sandbox: {reason}")
            }
            Self::InvalidConfiguration { field, reason } => {
                write!(f, "invalid sandbox configuration for '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for SandboxErrorKind {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_not_found_names_interpreter() {
        let err = SandboxErrorKind::InterpreterNotFound {
            interpreter: "python3".to_string(),
        };
        assert!(err.to_string().contains("python3"));
    }

    #[test]
    fn converts_to_environment_error() {
        let id = TaskId::new();
        let err = SandboxErrorKind::AlreadyDestroyed.into_run_error(Some(id.clone()));
        assert_eq!(err.code(), "ENVIRONMENT_ERROR");
        assert_eq!(err.task_id, Some(id));
        assert!(err.detail().contains("destroyed"));
    }
}
