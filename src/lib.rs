//! # pyexec-pool: sandboxed Python execution pool
//!
//! A fixed-size pool of isolated interpreter contexts that run untrusted
//! programs concurrently. Built on acton-reactive: a single pool manager actor
//! owns the queue and every worker, so dispatch and recovery are plain
//! sequential state updates.
//!
//! ## Architecture
//!
//! - **ExecutionPool**: caller-facing facade (`run`, `submit`, `status`, `reset_all`)
//! - **PoolManager**: actor that queues tasks, dispatches them and replaces broken workers
//! - **WorkerWrapper**: one pool slot; tracks state, generation and the task in flight
//! - **Sandbox**: one isolated context, either an interpreter process or an in-process stub
//! - **OutputBatcher**: coalesces the guest's writes into ordered, bounded batches
//! - **OutputSink**: receives every flushed batch (`LineBuffer`, `StdioSink`, `ChannelSink`)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pyexec_pool::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PoolError> {
//!     let pool = ExecutionPool::builder().launch().await?;
//!
//!     let value = pool
//!         .run("x = int(input())\nx * 2", RunOptions::new().with_input("21"))
//!         .await;
//!     println!("{value:?}");
//!
//!     pool.shutdown().await
//! }
//! ```

pub mod batcher;
pub mod config;
pub mod error;
pub mod facade;
pub mod logging;
pub mod output;
pub mod pool;
pub mod protocol;
pub mod sandbox;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batcher::{BatchConfig, OutputBatcher};
    pub use crate::config::{PoolConfig, ProcessConfig, PyExecConfig};
    pub use crate::error::{PoolError, PoolErrorKind, RunError, RunErrorKind};
    pub use crate::facade::{ExecutionPool, ExecutionPoolBuilder, PendingRun};
    pub use crate::logging::{init_logging, LogLevel, LoggingConfig};
    pub use crate::output::{ChannelSink, LineBuffer, OutputKind, OutputSink, StdioSink};
    pub use crate::pool::{PoolMetrics, PoolStatus, RunResult};
    pub use crate::protocol::{RunOptions, SetupScript};
    pub use crate::sandbox::{
        ProcessSandboxFactory, Sandbox, SandboxFactory, StubSandboxFactory,
    };
    pub use crate::types::TaskId;
}
