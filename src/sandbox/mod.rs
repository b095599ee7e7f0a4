//! Sandbox trait and implementations.
//!
//! A sandbox handle is one isolated context that runs programs one at a time
//! and reports through [`ProtocolMessage`](crate::protocol::ProtocolMessage)s.
//!
//! ## Implementations
//!
//! - **ProcessSandbox**: one child Python interpreter per handle, in its own
//!   process group, optionally under rlimit caps (`resource-limits` feature)
//! - **StubSandbox**: in-process stand-in that interprets a tiny script
//!   language; for development and tests, does NOT run Python
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pyexec_pool::sandbox::{ProcessSandboxFactory, SandboxFactory};
//!
//! let factory = ProcessSandboxFactory::default();
//! if factory.is_available() {
//!     let (events, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     let sandbox = factory.spawn(events, BatchConfig::default())?;
//!     // wait for ProtocolMessage::Ready on rx, then sandbox.execute(...)
//! }
//! ```

mod error;
mod process;
mod stub;
mod traits;

pub use error::SandboxErrorKind;
pub use process::{ProcessSandbox, ProcessSandboxFactory, BLOCKED_MODULES_ENV, BOOTSTRAP};
pub use stub::{StubSandbox, StubSandboxFactory};
pub use traits::{EventSender, Sandbox, SandboxFactory};
