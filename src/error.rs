//! Error types for the execution pool.
//!
//! `RunError` is what a caller's `run()` future rejects with; its kind is the
//! settlement taxonomy (`CODE_EMPTY`, `SETUP_CODE_ERROR`, `EXEC_TIMEOUT`,
//! `TASK_ERROR`, `ENVIRONMENT_ERROR`). `PoolError` covers failures of the pool
//! itself: bad configuration, launch failures and a stopped actor.
//!
//! No external error crates are used here; `anyhow` appears only in the
//! `pyexec` binary.

use crate::types::TaskId;
use std::fmt;
use std::time::Duration;

/// Why a submitted run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    /// The task that failed; `None` when rejected before an id was assigned
    pub task_id: Option<TaskId>,
    /// The specific failure
    pub kind: RunErrorKind,
}

/// Failure classes a run can settle with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunErrorKind {
    /// The submitted code was empty or whitespace only
    CodeEmpty,
    /// A setup script failed before the program ran; the worker stays usable
    SetupCode {
        /// The setup failure as reported by the sandbox
        message: String,
    },
    /// The program exceeded the execution time limit; its worker was replaced
    Timeout {
        /// The limit that was exceeded
        limit: Duration,
    },
    /// The program itself raised or failed; the worker stays usable
    Task {
        /// The program's own error text, internal frames stripped
        message: String,
    },
    /// The hosting context crashed, was reset, or the pool went away
    Environment {
        /// Description of what went wrong
        reason: String,
    },
}

impl RunError {
    /// Creates a new RunError for the given task.
    #[must_use]
    pub fn new(task_id: Option<TaskId>, kind: RunErrorKind) -> Self {
        Self { task_id, kind }
    }

    /// Creates an empty-code rejection.
    #[must_use]
    pub fn code_empty() -> Self {
        Self::new(None, RunErrorKind::CodeEmpty)
    }

    /// Creates a setup-code failure.
    #[must_use]
    pub fn setup_code(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::new(
            Some(task_id),
            RunErrorKind::SetupCode {
                message: message.into(),
            },
        )
    }

    /// Creates a timeout failure.
    #[must_use]
    pub fn timeout(task_id: TaskId, limit: Duration) -> Self {
        Self::new(Some(task_id), RunErrorKind::Timeout { limit })
    }

    /// Creates a failure raised by the program itself.
    #[must_use]
    pub fn task(task_id: TaskId, message: impl Into<String>) -> Self {
        Self::new(
            Some(task_id),
            RunErrorKind::Task {
                message: message.into(),
            },
        )
    }

    /// Creates an environment failure.
    #[must_use]
    pub fn environment(task_id: Option<TaskId>, reason: impl Into<String>) -> Self {
        Self::new(
            task_id,
            RunErrorKind::Environment {
                reason: reason.into(),
            },
        )
    }

    /// Returns the stable error code for this failure class.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self.kind {
            RunErrorKind::CodeEmpty => "CODE_EMPTY",
            RunErrorKind::SetupCode { .. } => "SETUP_CODE_ERROR",
            RunErrorKind::Timeout { .. } => "EXEC_TIMEOUT",
            RunErrorKind::Task { .. } => "TASK_ERROR",
            RunErrorKind::Environment { .. } => "ENVIRONMENT_ERROR",
        }
    }

    /// Returns the human readable detail without the code prefix.
    #[must_use]
    pub fn detail(&self) -> String {
        match &self.kind {
            RunErrorKind::CodeEmpty => "no code to run".to_string(),
            RunErrorKind::SetupCode { message } => message.clone(),
            RunErrorKind::Timeout { limit } => {
                format!("execution exceeded {} ms", limit.as_millis())
            }
            RunErrorKind::Task { message } => message.clone(),
            RunErrorKind::Environment { reason } => reason.clone(),
        }
    }

    /// Returns true if the failure came from the submitted program itself.
    #[must_use]
    pub fn is_task_error(&self) -> bool {
        matches!(self.kind, RunErrorKind::Task { .. })
    }

    /// Returns true if the run was killed by the execution time limit.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, RunErrorKind::Timeout { .. })
    }

    /// Returns true if the worker that ran this task was destroyed and replaced.
    #[must_use]
    pub fn destroyed_worker(&self) -> bool {
        matches!(
            self.kind,
            RunErrorKind::Timeout { .. } | RunErrorKind::Environment { .. }
        )
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RunErrorKind::CodeEmpty => write!(f, "CODE_EMPTY: nothing to run; submit non-blank code"),
            RunErrorKind::SetupCode { message } => {
                write!(f, "SETUP_CODE_ERROR: {message}")
            }
            RunErrorKind::Timeout { limit } => write!(
                f,
                "EXEC_TIMEOUT: program did not finish within {} ms; simplify it or raise the limit",
                limit.as_millis()
            ),
            RunErrorKind::Task { message } => write!(f, "{message}"),
            RunErrorKind::Environment { reason } => {
                write!(f, "ENVIRONMENT_ERROR: {reason}")
            }
        }
    }
}

impl std::error::Error for RunError {}

/// Errors raised by the pool itself rather than by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolError {
    /// The specific error that occurred
    pub kind: PoolErrorKind,
}

/// Specific pool error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// A configuration value was rejected
    InvalidConfig {
        /// The offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },
    /// The actor runtime could not be started or stopped cleanly
    RuntimeFailed {
        /// Reason reported by the runtime
        reason: String,
    },
    /// The pool actor is no longer answering requests
    Stopped,
}

impl PoolError {
    /// Creates a new PoolError with the given kind.
    #[must_use]
    pub fn new(kind: PoolErrorKind) -> Self {
        Self { kind }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(PoolErrorKind::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// Creates a runtime failure error.
    #[must_use]
    pub fn runtime_failed(reason: impl Into<String>) -> Self {
        Self::new(PoolErrorKind::RuntimeFailed {
            reason: reason.into(),
        })
    }

    /// Creates a stopped-pool error.
    #[must_use]
    pub fn stopped() -> Self {
        Self::new(PoolErrorKind::Stopped)
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self.kind, PoolErrorKind::InvalidConfig { .. })
    }

    /// Returns true if the pool actor has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self.kind, PoolErrorKind::Stopped)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PoolErrorKind::InvalidConfig { field, reason } => {
                write!(f, "invalid configuration for '{field}': {reason}")
            }
            PoolErrorKind::RuntimeFailed { reason } => {
                write!(f, "actor runtime failure: {reason}")
            }
            PoolErrorKind::Stopped => {
                write!(f, "execution pool has stopped; create a new pool to run code")
            }
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        let id = TaskId::new();
        assert_eq!(RunError::code_empty().code(), "CODE_EMPTY");
        assert_eq!(RunError::setup_code(id.clone(), "x").code(), "SETUP_CODE_ERROR");
        assert_eq!(
            RunError::timeout(id.clone(), Duration::from_millis(5)).code(),
            "EXEC_TIMEOUT"
        );
        assert_eq!(RunError::task(id.clone(), "boom").code(), "TASK_ERROR");
        assert_eq!(RunError::environment(Some(id), "gone").code(), "ENVIRONMENT_ERROR");
    }

    #[test]
    fn task_error_displays_program_text_verbatim() {
        let err = RunError::task(TaskId::new(), "ValueError: bad input");
        assert_eq!(err.to_string(), "ValueError: bad input");
        assert!(err.is_task_error());
        assert!(!err.destroyed_worker());
    }

    #[test]
    fn timeout_reports_limit() {
        let err = RunError::timeout(TaskId::new(), Duration::from_millis(5000));
        assert!(err.to_string().contains("5000 ms"));
        assert!(err.is_timeout());
        assert!(err.destroyed_worker());
    }

    #[test]
    fn code_empty_has_no_task() {
        let err = RunError::code_empty();
        assert!(err.task_id.is_none());
        assert!(err.to_string().starts_with("CODE_EMPTY"));
    }

    #[test]
    fn pool_error_predicates() {
        assert!(PoolError::invalid_config("pool_size", "must be at least 1").is_configuration());
        assert!(PoolError::stopped().is_stopped());
        let msg = PoolError::invalid_config("pool_size", "must be at least 1").to_string();
        assert!(msg.contains("pool_size"));
    }
}
