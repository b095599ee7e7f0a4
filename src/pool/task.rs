//! Queued units of work and their single-shot settlement.

use crate::error::RunError;
use crate::protocol::{ExecuteRequest, RunOptions};
use crate::types::TaskId;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// What a run settles with: the program's value or why it did not succeed.
pub type RunResult = Result<Value, RunError>;

/// Single-use reply channel that can travel inside cloneable actor messages.
///
/// Clones share one sender; whichever clone sends first settles the reply and
/// every later send is a no-op.
///
/// ```rust
/// use pyexec_pool::pool::ReplySlot;
///
/// # tokio_test::block_on(async {
/// let (slot, rx) = ReplySlot::new();
/// let copy = slot.clone();
/// assert!(slot.send(5));
/// assert!(!copy.send(6));
/// assert_eq!(rx.await.unwrap(), 5);
/// # });
/// ```
pub struct ReplySlot<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> ReplySlot<T> {
    /// Creates a slot and the receiver its value arrives on.
    #[must_use]
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Delivers `value` unless the slot was already used.
    ///
    /// Returns true if this call settled the slot, even when the receiver has
    /// gone away in the meantime.
    pub fn send(&self, value: T) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    /// Returns true once a value has been sent.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T> Clone for ReplySlot<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<T> fmt::Debug for ReplySlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySlot")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// A submitted program waiting for, or occupying, a worker.
#[derive(Debug, Clone)]
pub struct Task {
    /// Identifier correlating every protocol message with this task
    pub id: TaskId,
    /// Program text
    pub code: String,
    /// Inputs, globals and setup scripts
    pub options: RunOptions,
    reply: ReplySlot<RunResult>,
}

impl Task {
    /// Creates a task with a fresh id, returning the receiver its result
    /// arrives on.
    #[must_use]
    pub fn new(code: impl Into<String>, options: RunOptions) -> (Self, oneshot::Receiver<RunResult>) {
        let (reply, rx) = ReplySlot::new();
        (
            Self {
                id: TaskId::new(),
                code: code.into(),
                options,
                reply,
            },
            rx,
        )
    }

    /// Builds the request a handle executes for this task.
    #[must_use]
    pub fn request(&self) -> ExecuteRequest {
        ExecuteRequest {
            task_id: self.id.clone(),
            code: self.code.clone(),
            options: self.options.clone(),
        }
    }

    /// Settles the task successfully. Returns false if already settled.
    pub fn resolve(&self, value: Value) -> bool {
        self.reply.send(Ok(value))
    }

    /// Settles the task with a failure. Returns false if already settled.
    pub fn reject(&self, error: RunError) -> bool {
        self.reply.send(Err(error))
    }

    /// Returns true once the task has been settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.reply.is_settled()
    }
}
