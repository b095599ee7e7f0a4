//! Task identifier type using TypeID format.
//!
//! Every execution request and every message a handle emits in response to it
//! carries a `TaskId`. Format: `task_01h455vb4pex5vsknk084sn02q`

use mti::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier of one submitted execution.
///
/// Time-sortable (UUIDv7), so ids created later compare greater.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(MagicTypeId);

/// Error returned when a string is not a valid task ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidTaskId {
    /// TypeID parsing failed
    Parse(String),
    /// The TypeID carried a prefix other than `task`
    WrongPrefix(String),
}

impl fmt::Display for InvalidTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "invalid task ID: {e}"),
            Self::WrongPrefix(actual) => {
                write!(f, "expected task ID prefix '{}', got '{actual}'", TaskId::PREFIX)
            }
        }
    }
}

impl std::error::Error for InvalidTaskId {}

impl TaskId {
    /// The TypeID prefix for task identifiers.
    pub const PREFIX: &'static str = "task";

    /// Creates a fresh task ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Self::PREFIX.create_type_id::<V7>())
    }

    /// Parses a task ID, rejecting TypeIDs with a foreign prefix.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTaskId` when `s` is not a TypeID or has the wrong prefix.
    pub fn parse(s: &str) -> Result<Self, InvalidTaskId> {
        let id = MagicTypeId::from_str(s).map_err(|e| InvalidTaskId::Parse(e.to_string()))?;
        let prefix = id.prefix().as_str();
        if prefix != Self::PREFIX {
            return Err(InvalidTaskId::WrongPrefix(prefix.to_string()));
        }
        Ok(Self(id))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = InvalidTaskId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Guests echo the id back as a plain string, so the wire form is the
// TypeID text rather than a structured value.
impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
