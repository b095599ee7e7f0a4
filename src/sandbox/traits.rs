//! Sandbox trait definitions.
//!
//! A sandbox handle is one isolated execution context. Handles are driven by
//! messages rather than futures: `execute` only delivers a request, and every
//! response arrives later on the event channel the handle was spawned with.

use super::error::SandboxErrorKind;
use crate::batcher::BatchConfig;
use crate::protocol::{ExecuteRequest, ProtocolMessage};
use std::fmt::Debug;
use tokio::sync::mpsc;

/// Channel a handle delivers its protocol messages on.
pub type EventSender = mpsc::UnboundedSender<ProtocolMessage>;

/// One isolated execution context.
///
/// # Lifecycle
///
/// A freshly spawned handle is booting. It emits [`ProtocolMessage::Ready`]
/// once it accepts requests, or an `Error` without task id if it could not
/// boot. Each request is answered by any number of `Stdout`/`Stderr` batches
/// and exactly one `End` or `Error`, all tagged with the request's task id.
///
/// # Thread Safety
///
/// Handles must be `Send + Sync` so the pool actor can own them.
pub trait Sandbox: Send + Sync + Debug {
    /// Delivers one request. Never waits for the program to run.
    ///
    /// # Errors
    ///
    /// Returns `SandboxErrorKind::AlreadyDestroyed` after `destroy()`, or
    /// `SandboxErrorKind::RequestFailed` if the context is gone.
    fn execute(&self, request: ExecuteRequest) -> Result<(), SandboxErrorKind>;

    /// Destroys the handle unconditionally, releasing all resources.
    ///
    /// Interrupts a running program. Idempotent. No messages are delivered
    /// after this returns.
    fn destroy(&mut self);

    /// Returns whether the handle is still usable.
    fn is_alive(&self) -> bool;
}

/// Factory for sandbox handles.
pub trait SandboxFactory: Send + Sync + Debug {
    /// Starts a new handle that reports on `events`, batching output with
    /// `batch`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SandboxErrorKind::SpawnFailed` if the context cannot be
    /// launched at all.
    fn spawn(
        &self,
        events: EventSender,
        batch: BatchConfig,
    ) -> Result<Box<dyn Sandbox>, SandboxErrorKind>;

    /// Returns whether this factory can create handles on this host.
    fn is_available(&self) -> bool {
        true
    }
}
