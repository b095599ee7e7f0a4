//! Messages understood by the pool actor.

use super::status::PoolStatus;
use super::task::{ReplySlot, Task};
use crate::protocol::ProtocolMessage;
use crate::types::TaskId;
use acton_reactive::prelude::*;

/// Spawns every worker's first handle. Sent once, right after start.
#[acton_message]
pub struct BootPool;

/// Enqueues a task and runs dispatch.
#[acton_message]
pub struct SubmitTask {
    /// The task to run
    pub task: Task,
}

/// A protocol message from one worker's handle.
#[acton_message]
pub struct HandleEvent {
    /// Worker index
    pub worker: usize,
    /// Handle generation the message came from
    pub generation: u64,
    /// The message itself
    pub message: ProtocolMessage,
}

/// A task's execution time limit elapsed.
#[acton_message]
pub struct TaskDeadline {
    /// Worker index
    pub worker: usize,
    /// Handle generation the task was started on
    pub generation: u64,
    /// The task that ran out of time
    pub task_id: TaskId,
}

/// Retry starting a handle after a failed spawn or boot.
#[acton_message]
pub struct RespawnWorker {
    /// Worker index
    pub worker: usize,
    /// Generation that failed; stale retries are ignored
    pub generation: u64,
}

/// Requests a status snapshot.
#[acton_message]
pub struct GetPoolStatus {
    /// Where the snapshot is delivered
    pub reply: ReplySlot<PoolStatus>,
}

/// Replaces every handle and rejects everything in flight or queued.
#[acton_message]
pub struct ResetPool {
    /// Signalled once the reset has been applied
    pub reply: ReplySlot<()>,
}

/// Destroys every handle and rejects everything in flight or queued.
#[acton_message]
pub struct ShutdownPool {
    /// Signalled once all handles are gone
    pub reply: ReplySlot<()>,
}
