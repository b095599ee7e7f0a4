//! Worker pool: queueing, dispatch, supervision and self-healing.
//!
//! [`PoolManager`] is an actor that owns a fixed number of
//! [`WorkerWrapper`]s and a FIFO queue of [`Task`]s. Each wrapper holds one
//! sandbox handle at a time; handles that crash or exceed the execution
//! limit are destroyed and replaced without disturbing the rest of the pool.

mod actor;
mod messages;
mod status;
mod task;
mod worker;

pub use actor::PoolManager;
pub use messages::{
    BootPool, GetPoolStatus, HandleEvent, ResetPool, RespawnWorker, ShutdownPool, SubmitTask,
    TaskDeadline,
};
pub use status::{PoolMetrics, PoolStatus};
pub use task::{ReplySlot, RunResult, Task};
pub use worker::{WorkerState, WorkerWrapper};
