//! Worker wrapper: one pool slot and the handle currently occupying it.
//!
//! A slot outlives its handles. Every (re)spawn bumps the slot's generation
//! and every event, deadline and respawn timer carries the generation it was
//! created for, so anything left over from a destroyed handle is recognised
//! and dropped by the pool.

use super::messages::{HandleEvent, RespawnWorker, TaskDeadline};
use super::task::Task;
use crate::batcher::BatchConfig;
use crate::sandbox::{Sandbox, SandboxErrorKind, SandboxFactory};
use crate::types::TaskId;
use acton_reactive::prelude::*;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lifecycle of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// A handle is starting, or a respawn is pending
    Booting,
    /// The handle is ready and has no task
    Idle,
    /// The handle is running a task
    Busy,
}

#[derive(Debug)]
struct InFlight {
    task: Task,
    deadline: Option<JoinHandle<()>>,
}

/// One slot of the pool.
#[derive(Debug)]
pub struct WorkerWrapper {
    index: usize,
    generation: u64,
    state: WorkerState,
    handle: Option<Box<dyn Sandbox>>,
    in_flight: Option<InFlight>,
    boot_failures: u32,
    booting_since: Option<Instant>,
    respawn: Option<JoinHandle<()>>,
}

impl WorkerWrapper {
    /// Creates an empty slot; call [`spawn`](Self::spawn) to start a handle.
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            generation: 0,
            state: WorkerState::Booting,
            handle: None,
            in_flight: None,
            boot_failures: 0,
            booting_since: None,
            respawn: None,
        }
    }

    /// Position of this slot in the pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation of the current (or most recently attempted) handle.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Returns true if the slot can take a task right now.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Consecutive boot failures since the last successful boot.
    #[must_use]
    pub fn boot_failures(&self) -> u32 {
        self.boot_failures
    }

    /// Id of the task currently running, if any.
    #[must_use]
    pub fn in_flight_id(&self) -> Option<&TaskId> {
        self.in_flight.as_ref().map(|f| &f.task.id)
    }

    /// Returns true if `generation` is this slot's current generation.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Starts a fresh handle under a new generation.
    ///
    /// The handle's events are forwarded to `pool` as [`HandleEvent`]s. The
    /// slot stays `Booting` until the handle reports `Ready`.
    ///
    /// # Errors
    ///
    /// Returns the factory's error if the handle could not be started; the
    /// slot is left `Booting` without a handle.
    pub fn spawn(
        &mut self,
        factory: &dyn SandboxFactory,
        batch: BatchConfig,
        pool: &ActorHandle,
    ) -> Result<(), SandboxErrorKind> {
        self.generation += 1;
        self.state = WorkerState::Booting;
        self.booting_since = Some(Instant::now());

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handle = factory.spawn(events_tx, batch)?;

        let worker = self.index;
        let generation = self.generation;
        let pool = pool.clone();
        tokio::spawn(async move {
            while let Some(message) = events_rx.recv().await {
                pool.send(HandleEvent {
                    worker,
                    generation,
                    message,
                })
                .await;
            }
        });

        self.handle = Some(handle);
        tracing::debug!(worker, generation, "worker handle spawned");
        Ok(())
    }

    /// Marks the handle ready. Returns how long it took to boot.
    pub fn mark_ready(&mut self) -> Option<Duration> {
        self.state = WorkerState::Idle;
        self.boot_failures = 0;
        self.booting_since.take().map(|since| since.elapsed())
    }

    /// Counts a failed boot and drops the broken handle.
    /// Returns the number of consecutive failures.
    pub fn record_boot_failure(&mut self) -> u32 {
        self.boot_failures = self.boot_failures.saturating_add(1);
        self.release_handle();
        self.state = WorkerState::Booting;
        self.boot_failures
    }

    /// Hands `task` to the idle handle and arms its deadline.
    ///
    /// # Errors
    ///
    /// Gives the task back with the handle's error if it could not be
    /// delivered; the slot is left unchanged.
    pub fn begin(
        &mut self,
        task: Task,
        limit: Option<Duration>,
        pool: &ActorHandle,
    ) -> Result<(), (Task, SandboxErrorKind)> {
        let Some(handle) = self.handle.as_ref() else {
            return Err((task, SandboxErrorKind::AlreadyDestroyed));
        };
        if let Err(e) = handle.execute(task.request()) {
            return Err((task, e));
        }

        let deadline = limit.map(|limit| {
            let worker = self.index;
            let generation = self.generation;
            let task_id = task.id.clone();
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                pool.send(TaskDeadline {
                    worker,
                    generation,
                    task_id,
                })
                .await;
            })
        });

        tracing::debug!(worker = self.index, generation = self.generation, task_id = %task.id, "task started");
        self.in_flight = Some(InFlight { task, deadline });
        self.state = WorkerState::Busy;
        Ok(())
    }

    /// Takes the running task if it is `task_id`, disarming its deadline.
    /// The slot becomes `Idle`.
    pub fn finish(&mut self, task_id: &TaskId) -> Option<Task> {
        if self.in_flight_id() != Some(task_id) {
            return None;
        }
        let task = self.take_in_flight();
        self.state = WorkerState::Idle;
        task
    }

    /// Destroys the handle, cancels all timers and returns the task that was
    /// running, if any. The slot is left `Booting` without a handle.
    pub fn destroy(&mut self) -> Option<Task> {
        let task = self.take_in_flight();
        if let Some(respawn) = self.respawn.take() {
            respawn.abort();
        }
        self.release_handle();
        self.state = WorkerState::Booting;
        self.booting_since = None;
        task
    }

    /// Schedules a [`RespawnWorker`] for the current generation after `delay`.
    pub fn schedule_respawn(&mut self, delay: Duration, pool: &ActorHandle) {
        if let Some(previous) = self.respawn.take() {
            previous.abort();
        }
        let worker = self.index;
        let generation = self.generation;
        let pool = pool.clone();
        self.respawn = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.send(RespawnWorker { worker, generation }).await;
        }));
    }

    fn take_in_flight(&mut self) -> Option<Task> {
        self.in_flight.take().map(|in_flight| {
            if let Some(deadline) = in_flight.deadline {
                deadline.abort();
            }
            in_flight.task
        })
    }

    fn release_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.destroy();
        }
    }
}

impl Drop for WorkerWrapper {
    fn drop(&mut self) {
        self.destroy();
    }
}
