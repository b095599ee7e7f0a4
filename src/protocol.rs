//! Message contract between the pool and a sandbox handle.
//!
//! Requests flow pool → handle as [`ExecuteRequest`]. A handle answers with
//! [`ProtocolMessage`]s: `Ready` once bootstrapped, batched `Stdout`/`Stderr`,
//! and exactly one terminal `End` or `Error` per request. Every message that
//! answers a request carries that request's [`TaskId`] even though a handle
//! only ever runs one task at a time.
//!
//! [`GuestFrame`] is the unbatched form a guest produces, one frame per write.
//! It doubles as the JSON-lines wire format spoken by interpreter processes:
//!
//! ```text
//! {"type":"ready"}
//! {"type":"output","task_id":"task_01h...","stream":"stdout","text":"hi\n"}
//! {"type":"end","task_id":"task_01h...","outcome":{"status":"success","value":3}}
//! {"type":"error","task_id":"task_01h...","kind":{"kind":"setup_error","message":"..."}}
//! ```

use crate::types::TaskId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Options accompanying a submitted program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Lines served, in order, to the program's input requests
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Names bound as globals before any code runs
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Scripts run in order, in the same globals, before the program
    #[serde(default)]
    pub setup_code: Vec<SetupScript>,
}

impl RunOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one input line.
    #[must_use]
    pub fn with_input(mut self, line: impl Into<String>) -> Self {
        self.inputs.push(line.into());
        self
    }

    /// Replaces the input lines.
    #[must_use]
    pub fn with_inputs<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Binds a global name.
    #[must_use]
    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.context.insert(name.into(), value);
        self
    }

    /// Appends a setup script.
    #[must_use]
    pub fn with_setup(mut self, script: SetupScript) -> Self {
        self.setup_code.push(script);
        self
    }
}

/// A script run before the main program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupScript {
    /// Source text
    pub code: String,
    /// Per-script options
    #[serde(default)]
    pub options: SetupOptions,
}

impl SetupScript {
    /// Creates a setup script with no extra options.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            options: SetupOptions::default(),
        }
    }
}

/// Options for a single setup script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupOptions {
    /// Extra globals bound just before this script runs
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// One execute request sent to a handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Correlates every response message with this request
    pub task_id: TaskId,
    /// Program text
    pub code: String,
    /// Inputs, globals and setup scripts
    #[serde(default)]
    pub options: RunOptions,
}

/// Which standard stream a write went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// How a program finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The program completed; `value` is its final expression, or null
    Success {
        /// Result value
        #[serde(default)]
        value: Value,
    },
    /// The program raised; `message` is its error text
    Failure {
        /// Error description with internal frames stripped
        message: String,
    },
}

/// Handle-level failures, as opposed to failures of the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandleErrorKind {
    /// A setup script failed; the handle remains usable
    SetupError {
        /// Failure detail
        message: String,
    },
    /// The execution environment itself broke; the handle must be replaced
    EnvironmentError {
        /// Failure detail
        message: String,
    },
}

/// Unbatched frames emitted by a guest, one per write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestFrame {
    /// Bootstrap finished
    Ready,
    /// One write to stdout or stderr
    Output {
        /// Task that produced the write
        task_id: TaskId,
        /// Target stream
        stream: OutputStream,
        /// Written text
        text: String,
    },
    /// The program finished
    End {
        /// Task that finished
        task_id: TaskId,
        /// How it finished
        outcome: Outcome,
    },
    /// Setup or environment failure
    Error {
        /// Affected task; absent when the handle failed while booting
        #[serde(default)]
        task_id: Option<TaskId>,
        /// What failed
        kind: HandleErrorKind,
    },
}

impl GuestFrame {
    /// Returns true for frames that conclude a request (`End`/`Error`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

/// Messages a handle delivers to the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    /// The handle finished booting and accepts requests
    Ready,
    /// A batch of standard output
    Stdout {
        /// Task that produced it
        task_id: TaskId,
        /// Batched text
        text: String,
    },
    /// A batch of standard error
    Stderr {
        /// Task that produced it
        task_id: TaskId,
        /// Batched text
        text: String,
    },
    /// The program finished
    End {
        /// Task that finished
        task_id: TaskId,
        /// How it finished
        outcome: Outcome,
    },
    /// Setup or environment failure
    Error {
        /// Affected task; `None` means the handle failed to boot
        task_id: Option<TaskId>,
        /// What failed
        kind: HandleErrorKind,
    },
}

impl ProtocolMessage {
    /// Builds an output message for the given stream.
    #[must_use]
    pub fn output(stream: OutputStream, task_id: TaskId, text: String) -> Self {
        match stream {
            OutputStream::Stdout => Self::Stdout { task_id, text },
            OutputStream::Stderr => Self::Stderr { task_id, text },
        }
    }

    /// Returns the task this message belongs to, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Ready => None,
            Self::Stdout { task_id, .. }
            | Self::Stderr { task_id, .. }
            | Self::End { task_id, .. } => Some(task_id),
            Self::Error { task_id, .. } => task_id.as_ref(),
        }
    }

    /// Returns true for messages that conclude a request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn guest_frames_parse_from_wire_lines() {
        let id = TaskId::new();
        let line = format!(
            r#"{{"type":"output","task_id":"{id}","stream":"stderr","text":"oops"}}"#
        );
        let frame: GuestFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(
            frame,
            GuestFrame::Output {
                task_id: id.clone(),
                stream: OutputStream::Stderr,
                text: "oops".to_string(),
            }
        );

        let line = format!(
            r#"{{"type":"end","task_id":"{id}","outcome":{{"status":"success","value":[1,2]}}}}"#
        );
        let frame: GuestFrame = serde_json::from_str(&line).unwrap();
        assert!(frame.is_terminal());
        assert!(matches!(
            frame,
            GuestFrame::End { outcome: Outcome::Success { ref value }, .. } if *value == json!([1, 2])
        ));
    }

    #[test]
    fn boot_error_frame_has_no_task() {
        let frame: GuestFrame = serde_json::from_str(
            r#"{"type":"error","kind":{"kind":"environment_error","message":"no python"}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            GuestFrame::Error {
                task_id: None,
                kind: HandleErrorKind::EnvironmentError {
                    message: "no python".to_string()
                },
            }
        );
    }

    #[test]
    fn success_value_defaults_to_null() {
        let outcome: Outcome = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert_eq!(outcome, Outcome::Success { value: Value::Null });
    }

    #[test]
    fn execute_request_wire_shape() {
        let request = ExecuteRequest {
            task_id: TaskId::new(),
            code: "print(x)".to_string(),
            options: RunOptions::new()
                .with_input("42")
                .with_global("x", json!(1))
                .with_setup(SetupScript::new("y = 2")),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["options"]["inputs"], json!(["42"]));
        assert_eq!(value["options"]["context"]["x"], json!(1));
        assert_eq!(value["options"]["setup_code"][0]["code"], json!("y = 2"));
    }

    #[test]
    fn protocol_message_task_ids() {
        let id = TaskId::new();
        assert!(ProtocolMessage::Ready.task_id().is_none());
        let msg = ProtocolMessage::output(OutputStream::Stdout, id.clone(), "a".into());
        assert_eq!(msg.task_id(), Some(&id));
        assert!(!msg.is_terminal());
        let boot = ProtocolMessage::Error {
            task_id: None,
            kind: HandleErrorKind::EnvironmentError {
                message: "x".into(),
            },
        };
        assert!(boot.task_id().is_none());
        assert!(boot.is_terminal());
    }
}
