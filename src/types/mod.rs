//! Core type definitions.
//!
//! Identity types are TypeIDs: a readable prefix plus a time-sortable UUIDv7.

mod task_id;

pub use task_id::{InvalidTaskId, TaskId};
