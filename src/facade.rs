//! High-level facade for the execution pool.
//!
//! This module hides the actor runtime and the pool manager behind a small
//! async API: submit code, await its result, observe the pool.
//!
//! # Example
//!
//! ```rust,ignore
//! use pyexec_pool::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PoolError> {
//!     let pool = ExecutionPool::builder()
//!         .pool(PoolConfig::new().with_pool_size(4))
//!         .launch()
//!         .await?;
//!
//!     match pool.run("1 + 2", RunOptions::new()).await {
//!         Ok(value) => println!("{value}"),
//!         Err(e) => eprintln!("{e}"),
//!     }
//!
//!     pool.shutdown().await
//! }
//! ```

use crate::config::{PoolConfig, ProcessConfig, PyExecConfig};
use crate::error::{PoolError, RunError};
use crate::output::{LineBuffer, OutputKind, OutputSink};
use crate::pool::{
    GetPoolStatus, PoolManager, PoolStatus, ReplySlot, ResetPool, RunResult, ShutdownPool,
    SubmitTask, Task,
};
use crate::protocol::RunOptions;
use crate::sandbox::{ProcessSandboxFactory, SandboxFactory};
use crate::types::TaskId;
use acton_reactive::prelude::*;
use futures::future::{BoxFuture, FutureExt};
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// A pool of sandboxed interpreters that runs submitted programs.
///
/// `ExecutionPool` owns the actor runtime and the pool manager. Any number of
/// programs can be submitted at once; at most `pool_size` run concurrently
/// and the rest wait in FIFO order.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ExecutionPool::builder().launch().await?;
///
/// let pending = pool.submit("print('hi')", RunOptions::new()).await;
/// let result = pending.await;
/// ```
pub struct ExecutionPool {
    /// The underlying actor runtime
    runtime: ActorRuntime,
    /// Handle to the pool manager actor
    manager: ActorHandle,
    /// Latest published pool status
    status_rx: watch::Receiver<PoolStatus>,
    /// Where flushed output goes
    sink: Arc<dyn OutputSink>,
    /// Whether the pool has been shut down
    is_shutdown: bool,
}

impl std::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("status", &*self.status_rx.borrow())
            .field("is_shutdown", &self.is_shutdown)
            .finish_non_exhaustive()
    }
}

impl ExecutionPool {
    /// Creates a new builder for configuring a pool.
    #[must_use]
    pub fn builder() -> ExecutionPoolBuilder {
        ExecutionPoolBuilder::default()
    }

    /// Queues `code` and returns a handle to its eventual result.
    ///
    /// Blank code settles immediately with `CODE_EMPTY`; the pool is never
    /// contacted and no metrics change.
    pub async fn submit(&self, code: impl Into<String>, options: RunOptions) -> PendingRun {
        let code = code.into();
        if code.trim().is_empty() {
            return PendingRun::settled(Err(RunError::code_empty()));
        }

        let (task, rx) = Task::new(code, options);
        let task_id = task.id.clone();
        tracing::debug!(task_id = %task_id, "Submitting task");
        self.manager.send(SubmitTask { task }).await;

        PendingRun {
            task_id: Some(task_id),
            state: PendingState::Waiting(rx),
        }
    }

    /// Runs `code` and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns the [`RunError`] the task settled with.
    pub async fn run(&self, code: impl Into<String>, options: RunOptions) -> RunResult {
        self.submit(code, options).await.await
    }

    /// Runs `code` and reports any failure to the output sink.
    ///
    /// A failure's description is appended as stderr. A divider is always
    /// appended afterwards, so consecutive runs stay visually separated.
    ///
    /// # Errors
    ///
    /// Returns the [`RunError`] the task settled with.
    pub async fn run_and_report(&self, code: impl Into<String>, options: RunOptions) -> RunResult {
        let result = self.run(code, options).await;
        if let Err(e) = &result {
            self.sink.append(&format!("{e}\n"), OutputKind::Stderr);
        }
        self.sink.append("", OutputKind::Divider);
        result
    }

    /// Returns a fresh snapshot from the pool manager.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::stopped`] if the manager no longer answers.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let (reply, rx) = ReplySlot::new();
        self.manager.send(GetPoolStatus { reply }).await;
        rx.await.map_err(|_| PoolError::stopped())
    }

    /// Subscribes to status snapshots, published after every state change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<PoolStatus> {
        self.status_rx.clone()
    }

    /// Replaces every handle and rejects every pending task with
    /// `ENVIRONMENT_ERROR`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::stopped`] if the manager no longer answers.
    pub async fn reset_all(&self) -> Result<(), PoolError> {
        let (reply, rx) = ReplySlot::new();
        self.manager.send(ResetPool { reply }).await;
        rx.await.map_err(|_| PoolError::stopped())
    }

    /// Returns the sink flushed output is delivered to.
    #[must_use]
    pub fn sink(&self) -> Arc<dyn OutputSink> {
        Arc::clone(&self.sink)
    }

    /// Returns a reference to the underlying actor runtime.
    #[must_use]
    pub fn runtime(&self) -> &ActorRuntime {
        &self.runtime
    }

    /// Returns whether the pool has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Destroys every handle, rejects everything pending and stops the
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime fails to stop.
    pub async fn shutdown(mut self) -> Result<(), PoolError> {
        self.is_shutdown = true;

        let (reply, rx) = ReplySlot::new();
        self.manager.send(ShutdownPool { reply }).await;
        if rx.await.is_err() {
            tracing::warn!("Pool manager stopped before acknowledging shutdown");
        }

        self.runtime
            .shutdown_all()
            .await
            .map_err(|e| PoolError::runtime_failed(e.to_string()))
    }
}

/// A submitted run whose result has not been awaited yet.
///
/// Await it directly, or call [`wait`](Self::wait).
#[derive(Debug)]
pub struct PendingRun {
    task_id: Option<TaskId>,
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Settled(RunResult),
    Waiting(oneshot::Receiver<RunResult>),
}

impl PendingRun {
    fn settled(result: RunResult) -> Self {
        Self {
            task_id: None,
            state: PendingState::Settled(result),
        }
    }

    /// Id of the task, or `None` if it was rejected before queueing.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    /// Waits for the result.
    ///
    /// # Errors
    ///
    /// Returns the [`RunError`] the task settled with, or an environment
    /// error if the pool went away without settling it.
    pub async fn wait(self) -> RunResult {
        match self.state {
            PendingState::Settled(result) => result,
            PendingState::Waiting(rx) => rx.await.unwrap_or_else(|_| {
                Err(RunError::environment(
                    self.task_id,
                    "pool stopped before the task settled",
                ))
            }),
        }
    }
}

impl IntoFuture for PendingRun {
    type Output = RunResult;
    type IntoFuture = BoxFuture<'static, RunResult>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

/// Builder for configuring and launching an [`ExecutionPool`].
///
/// # Example
///
/// ```rust,ignore
/// let buffer = Arc::new(LineBuffer::default());
/// let pool = ExecutionPool::builder()
///     .pool(PoolConfig::new().with_pool_size(2).with_max_execution_time_ms(1000))
///     .sink(buffer.clone())
///     .launch()
///     .await?;
/// ```
#[derive(Default)]
pub struct ExecutionPoolBuilder {
    config: PyExecConfig,
    factory: Option<Arc<dyn SandboxFactory>>,
    sink: Option<Arc<dyn OutputSink>>,
}

impl ExecutionPoolBuilder {
    /// Replaces the whole configuration, e.g. one loaded from a file.
    #[must_use]
    pub fn config(mut self, config: PyExecConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets pool sizing, timing and batching.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Sets how interpreter processes are launched.
    ///
    /// Ignored when a custom [`factory`](Self::factory) is given.
    #[must_use]
    pub fn process(mut self, process: ProcessConfig) -> Self {
        self.config.process = process;
        self
    }

    /// Uses a custom sandbox factory instead of interpreter processes.
    #[must_use]
    pub fn factory(mut self, factory: Arc<dyn SandboxFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets where flushed output goes. Defaults to a [`LineBuffer`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Launches the runtime and the pool manager.
    ///
    /// Workers boot in the background; tasks submitted before any worker is
    /// ready simply wait in the queue.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if any setting is out of range.
    pub async fn launch(self) -> Result<ExecutionPool, PoolError> {
        self.config.validate()?;

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(ProcessSandboxFactory::new(self.config.process.clone()))
        });
        if !factory.is_available() {
            tracing::warn!(
                interpreter = %self.config.process.interpreter,
                "Sandbox backend is not available; workers will fail to boot"
            );
        }
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(LineBuffer::default()));

        let (status_tx, status_rx) = watch::channel(PoolStatus::default());

        let mut runtime = ActonApp::launch_async().await;
        let manager = PoolManager::spawn(
            &mut runtime,
            self.config.pool,
            factory,
            Some(Arc::clone(&sink)),
            status_tx,
        )
        .await;

        Ok(ExecutionPool {
            runtime,
            manager,
            status_rx,
            sink,
            is_shutdown: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = ExecutionPool::builder();
        assert!(builder.factory.is_none());
        assert!(builder.sink.is_none());
        assert_eq!(builder.config, PyExecConfig::default());
    }

    #[test]
    fn builder_pool_overrides_pool_section() {
        let builder = ExecutionPool::builder().pool(PoolConfig::new().with_pool_size(7));
        assert_eq!(builder.config.pool.pool_size, 7);
    }

    #[tokio::test]
    async fn launch_rejects_zero_pool_size() {
        let err = ExecutionPool::builder()
            .pool(PoolConfig::new().with_pool_size(0))
            .launch()
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn settled_pending_run_resolves_without_pool() {
        let pending = PendingRun::settled(Err(RunError::code_empty()));
        assert!(pending.task_id().is_none());
        assert_eq!(pending.await.unwrap_err().code(), "CODE_EMPTY");
    }

    #[tokio::test]
    async fn dropped_reply_becomes_environment_error() {
        let (tx, rx) = oneshot::channel::<RunResult>();
        drop(tx);
        let pending = PendingRun {
            task_id: Some(TaskId::new()),
            state: PendingState::Waiting(rx),
        };
        let err = pending.await.unwrap_err();
        assert_eq!(err.code(), "ENVIRONMENT_ERROR");
        assert!(err.task_id.is_some());
    }
}
