//! Pool manager actor.
//!
//! The manager is the single owner of the task queue and of every worker
//! slot. Submissions, handle events, deadlines and respawn timers all arrive
//! as messages and are applied one at a time by mutation handlers, so the
//! queue and the wrapper flags never need a lock.

use super::messages::{
    BootPool, GetPoolStatus, HandleEvent, ResetPool, RespawnWorker, ShutdownPool, SubmitTask,
    TaskDeadline,
};
use super::status::{PoolMetrics, PoolStatus};
use super::task::Task;
use super::worker::{WorkerState, WorkerWrapper};
use crate::config::PoolConfig;
use crate::error::RunError;
use crate::output::{OutputKind, OutputSink};
use crate::protocol::{HandleErrorKind, Outcome, ProtocolMessage};
use crate::sandbox::SandboxFactory;
use crate::types::TaskId;
use acton_reactive::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

const RESET_REASON: &str = "pool reset";
const SHUTDOWN_REASON: &str = "pool shut down";

/// The pool manager actor state.
#[acton_actor]
pub struct PoolManager {
    /// Pool settings
    pub config: PoolConfig,
    /// Creates sandbox handles
    pub factory: Option<Arc<dyn SandboxFactory>>,
    /// Receives every flushed output batch
    pub sink: Option<Arc<dyn OutputSink>>,
    /// Publishes a status snapshot after every change
    pub status_tx: Option<watch::Sender<PoolStatus>>,
    /// Worker slots, dispatched in index order
    pub workers: Vec<WorkerWrapper>,
    /// Tasks waiting for a worker, oldest first
    pub queue: VecDeque<Task>,
    /// Running counters
    pub metrics: PoolMetrics,
    /// Most recent reason a handle failed to start
    pub last_boot_error: Option<String>,
    /// Set once shutdown has been applied
    pub shut_down: bool,
}

impl PoolManager {
    /// Spawns the pool manager and boots its workers.
    ///
    /// Status snapshots are published on `status_tx`. Output batches go to
    /// `sink`, if one is given.
    pub async fn spawn(
        runtime: &mut ActorRuntime,
        config: PoolConfig,
        factory: Arc<dyn SandboxFactory>,
        sink: Option<Arc<dyn OutputSink>>,
        status_tx: watch::Sender<PoolStatus>,
    ) -> ActorHandle {
        let mut builder = runtime.new_actor_with_name::<PoolManager>("pool_manager".to_string());

        builder.model.config = config;
        builder.model.factory = Some(factory);
        builder.model.sink = sink;
        builder.model.status_tx = Some(status_tx);

        builder
            .before_start(|_actor| {
                tracing::debug!("Pool manager initializing");
                Reply::ready()
            })
            .after_start(|actor| {
                tracing::info!(
                    pool_size = actor.model.config.pool_size,
                    max_execution_time_ms = actor.model.config.max_execution_time_ms,
                    "Pool manager ready"
                );
                Reply::ready()
            })
            .before_stop(|actor| {
                tracing::info!(
                    submitted = actor.model.metrics.submitted,
                    succeeded = actor.model.metrics.succeeded,
                    failed = actor.model.metrics.failed,
                    timed_out = actor.model.metrics.timed_out,
                    "Pool manager stopping"
                );
                Reply::ready()
            });

        configure_handlers(&mut builder);

        let handle = builder.start().await;
        handle.send(BootPool).await;
        handle
    }

    /// Builds a snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> PoolStatus {
        let available = self.workers.iter().filter(|w| w.is_idle()).count();
        let busy = self
            .workers
            .iter()
            .filter(|w| w.state() == WorkerState::Busy)
            .count();
        PoolStatus {
            available,
            busy,
            ready: available + busy,
            total: self.workers.len(),
            queued: self.queue.len(),
            metrics: self.metrics.clone(),
        }
    }

    fn publish(&self) {
        if let Some(tx) = &self.status_tx {
            tx.send_replace(self.snapshot());
        }
    }

    /// True when every slot has used up its boot attempts without a success.
    fn boot_exhausted(&self) -> bool {
        let limit = self.config.max_boot_attempts;
        !self.workers.is_empty() && self.workers.iter().all(|w| w.boot_failures() >= limit)
    }

    fn boot_exhausted_error(&self, task_id: TaskId) -> RunError {
        let reason = self
            .last_boot_error
            .as_deref()
            .unwrap_or("handle failed to start");
        RunError::environment(
            Some(task_id),
            format!("no worker could be started: {reason}"),
        )
    }

    /// Starts a fresh handle in slot `index`.
    fn start_worker(&mut self, index: usize, pool: &ActorHandle) {
        let Some(factory) = self.factory.clone() else {
            return;
        };
        let batch = self.config.batch_config();
        if let Err(e) = self.workers[index].spawn(factory.as_ref(), batch, pool) {
            tracing::warn!(worker = index, error = %e, "Failed to spawn worker handle");
            self.boot_failed(index, e.to_string(), pool);
        }
    }

    /// Records a failed boot and schedules the next attempt.
    fn boot_failed(&mut self, index: usize, reason: String, pool: &ActorHandle) {
        let failures = self.workers[index].record_boot_failure();
        self.last_boot_error = Some(reason);

        if failures == self.config.max_boot_attempts {
            tracing::error!(
                worker = index,
                attempts = failures,
                reason = ?self.last_boot_error,
                "Worker keeps failing to boot"
            );
        }

        if self.boot_exhausted() && !self.queue.is_empty() {
            tracing::error!(
                queued = self.queue.len(),
                "No worker could be started; rejecting queued tasks"
            );
            while let Some(task) = self.queue.pop_front() {
                self.metrics.failed += 1;
                task.reject(self.boot_exhausted_error(task.id.clone()));
            }
        }

        self.workers[index].schedule_respawn(self.config.respawn_delay(), pool);
    }

    /// Destroys slot `index` and spawns its replacement. A task still in
    /// flight is rejected with an environment error carrying `reason`.
    fn recycle(&mut self, index: usize, reason: &str, pool: &ActorHandle) {
        if let Some(orphan) = self.workers[index].destroy() {
            self.metrics.failed += 1;
            orphan.reject(RunError::environment(Some(orphan.id.clone()), reason));
        }
        self.metrics.resets += 1;
        tracing::info!(worker = index, reason, "Replacing worker handle");
        self.start_worker(index, pool);
    }

    /// Hands queued tasks to idle workers, lowest index first.
    fn dispatch(&mut self, pool: &ActorHandle) {
        if self.shut_down {
            return;
        }
        let limit = self.config.execution_limit();

        for index in 0..self.workers.len() {
            if !self.workers[index].is_idle() {
                continue;
            }
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            if let Err((task, e)) = self.workers[index].begin(task, limit, pool) {
                tracing::warn!(worker = index, error = %e, "Worker rejected task; replacing it");
                self.queue.push_front(task);
                self.recycle(index, &e.to_string(), pool);
            }
        }
    }

    fn enqueue(&mut self, task: Task, pool: &ActorHandle) {
        self.metrics.submitted += 1;

        if self.shut_down {
            self.metrics.failed += 1;
            task.reject(RunError::environment(Some(task.id.clone()), SHUTDOWN_REASON));
            return;
        }
        if self.boot_exhausted() {
            self.metrics.failed += 1;
            task.reject(self.boot_exhausted_error(task.id.clone()));
            return;
        }

        tracing::debug!(task_id = %task.id, queued = self.queue.len(), "Task queued");
        self.queue.push_back(task);
        self.dispatch(pool);
    }

    fn handle_event(&mut self, index: usize, message: ProtocolMessage, pool: &ActorHandle) {
        match message {
            ProtocolMessage::Ready => {
                if self.workers[index].state() != WorkerState::Booting {
                    return;
                }
                if let Some(elapsed) = self.workers[index].mark_ready() {
                    self.metrics.record_boot(elapsed.as_secs_f64() * 1000.0);
                }
                tracing::debug!(worker = index, "Worker ready");
                self.dispatch(pool);
            }
            ProtocolMessage::Stdout { task_id, text } => {
                self.forward_output(index, &task_id, &text, OutputKind::Stdout);
            }
            ProtocolMessage::Stderr { task_id, text } => {
                self.forward_output(index, &task_id, &text, OutputKind::Stderr);
            }
            ProtocolMessage::End { task_id, outcome } => {
                let Some(task) = self.workers[index].finish(&task_id) else {
                    tracing::debug!(worker = index, task_id = %task_id, "Ignoring end for unknown task");
                    return;
                };
                match outcome {
                    Outcome::Success { value } => {
                        self.metrics.succeeded += 1;
                        task.resolve(value);
                    }
                    Outcome::Failure { message } => {
                        self.metrics.failed += 1;
                        task.reject(RunError::task(task_id, message));
                    }
                }
                self.dispatch(pool);
            }
            ProtocolMessage::Error {
                task_id: Some(task_id),
                kind,
            } => {
                let Some(task) = self.workers[index].finish(&task_id) else {
                    tracing::debug!(worker = index, task_id = %task_id, "Ignoring error for unknown task");
                    return;
                };
                self.metrics.failed += 1;
                match kind {
                    HandleErrorKind::SetupError { message } => {
                        task.reject(RunError::setup_code(task_id, message));
                        self.dispatch(pool);
                    }
                    HandleErrorKind::EnvironmentError { message } => {
                        tracing::warn!(worker = index, task_id = %task_id, %message, "Worker environment failed");
                        task.reject(RunError::environment(Some(task_id), message.clone()));
                        self.recycle(index, &message, pool);
                    }
                }
            }
            ProtocolMessage::Error {
                task_id: None,
                kind,
            } => {
                let message = match kind {
                    HandleErrorKind::SetupError { message }
                    | HandleErrorKind::EnvironmentError { message } => message,
                };
                if self.workers[index].state() == WorkerState::Booting {
                    tracing::warn!(worker = index, %message, "Worker failed to boot");
                    self.boot_failed(index, message, pool);
                } else {
                    tracing::warn!(worker = index, %message, "Worker handle failed");
                    self.recycle(index, &message, pool);
                }
            }
        }
    }

    fn forward_output(&self, index: usize, task_id: &TaskId, text: &str, kind: OutputKind) {
        if self.workers[index].in_flight_id() != Some(task_id) {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.append(text, kind);
        }
    }

    fn deadline(&mut self, index: usize, task_id: &TaskId, pool: &ActorHandle) {
        let Some(task) = self.workers[index].finish(task_id) else {
            return;
        };
        let limit = self.config.execution_limit().unwrap_or_default();
        tracing::warn!(worker = index, task_id = %task_id, limit_ms = limit.as_millis() as u64, "Task timed out");
        self.metrics.timed_out += 1;
        task.reject(RunError::timeout(task.id.clone(), limit));
        self.recycle(index, "execution timed out", pool);
    }

    fn reset_all(&mut self, pool: &ActorHandle) {
        tracing::info!(queued = self.queue.len(), "Resetting pool");
        while let Some(task) = self.queue.pop_front() {
            self.metrics.failed += 1;
            task.reject(RunError::environment(Some(task.id.clone()), RESET_REASON));
        }
        for index in 0..self.workers.len() {
            self.recycle(index, RESET_REASON, pool);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!(queued = self.queue.len(), "Shutting down pool");
        self.shut_down = true;
        for worker in &mut self.workers {
            if let Some(orphan) = worker.destroy() {
                self.metrics.failed += 1;
                orphan.reject(RunError::environment(Some(orphan.id.clone()), SHUTDOWN_REASON));
            }
        }
        while let Some(task) = self.queue.pop_front() {
            self.metrics.failed += 1;
            task.reject(RunError::environment(Some(task.id.clone()), SHUTDOWN_REASON));
        }
    }
}

/// Configures message handlers for the pool manager.
fn configure_handlers(builder: &mut ManagedActor<Idle, PoolManager>) {
    builder.mutate_on::<BootPool>(|actor, _envelope| {
        let pool = actor.handle().clone();
        let model = &mut actor.model;
        if !model.workers.is_empty() {
            return Reply::ready();
        }
        model.workers = (0..model.config.pool_size).map(WorkerWrapper::new).collect();
        for index in 0..model.workers.len() {
            model.start_worker(index, &pool);
        }
        tracing::info!(workers = model.workers.len(), "Pool booting");
        model.publish();
        Reply::ready()
    });

    builder.mutate_on::<SubmitTask>(|actor, envelope| {
        let pool = actor.handle().clone();
        let task = envelope.message().task.clone();
        actor.model.enqueue(task, &pool);
        actor.model.publish();
        Reply::ready()
    });

    builder.mutate_on::<HandleEvent>(|actor, envelope| {
        let msg = envelope.message();
        let pool = actor.handle().clone();
        let model = &mut actor.model;
        let current = model
            .workers
            .get(msg.worker)
            .is_some_and(|w| w.is_current(msg.generation));
        if !current || model.shut_down {
            tracing::trace!(worker = msg.worker, generation = msg.generation, "Dropping stale event");
            return Reply::ready();
        }
        model.handle_event(msg.worker, msg.message.clone(), &pool);
        model.publish();
        Reply::ready()
    });

    builder.mutate_on::<TaskDeadline>(|actor, envelope| {
        let msg = envelope.message();
        let pool = actor.handle().clone();
        let model = &mut actor.model;
        let current = model
            .workers
            .get(msg.worker)
            .is_some_and(|w| w.is_current(msg.generation));
        if !current || model.shut_down {
            return Reply::ready();
        }
        model.deadline(msg.worker, &msg.task_id, &pool);
        model.publish();
        Reply::ready()
    });

    builder.mutate_on::<RespawnWorker>(|actor, envelope| {
        let msg = envelope.message();
        let pool = actor.handle().clone();
        let model = &mut actor.model;
        let pending = model.workers.get(msg.worker).is_some_and(|w| {
            w.is_current(msg.generation) && w.state() == WorkerState::Booting
        });
        if !pending || model.shut_down {
            return Reply::ready();
        }
        tracing::debug!(worker = msg.worker, "Retrying worker boot");
        model.start_worker(msg.worker, &pool);
        model.publish();
        Reply::ready()
    });

    builder.act_on::<GetPoolStatus>(|actor, envelope| {
        envelope.message().reply.send(actor.model.snapshot());
        Reply::ready()
    });

    builder.mutate_on::<ResetPool>(|actor, envelope| {
        let pool = actor.handle().clone();
        let model = &mut actor.model;
        if !model.shut_down {
            model.reset_all(&pool);
            model.publish();
        }
        envelope.message().reply.send(());
        Reply::ready()
    });

    builder.mutate_on::<ShutdownPool>(|actor, envelope| {
        if !actor.model.shut_down {
            actor.model.shutdown();
            actor.model.publish();
        }
        envelope.message().reply.send(());
        Reply::ready()
    });
}
