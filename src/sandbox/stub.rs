//! In-process stub sandbox for development and testing.
//!
//! WARNING: StubSandbox does NOT run Python. It interprets a tiny
//! line-oriented script language that is just expressive enough to exercise
//! every protocol path of the pool (streamed output, inputs, globals, setup
//! scripts, failures, hangs and crashes) without an interpreter on the host.
//!
//! | command            | effect                                              |
//! |--------------------|-----------------------------------------------------|
//! | `print <text>`     | writes `<text>\n` to stdout                          |
//! | `eprint <text>`    | writes `<text>\n` to stderr                          |
//! | `write <text>`     | writes `<text>` to stdout (`\n` and `\t` escapes)     |
//! | `spin <n> <text>`  | writes `<text>` to stdout `n` times, one write each   |
//! | `sleep <ms>`       | waits                                               |
//! | `input <name>`     | binds the next input line to global `<name>`         |
//! | `global <name>`    | writes the JSON value of global `<name>` and `\n`    |
//! | `set <name> <v>`   | binds global `<name>` to JSON `<v>` (or the string)  |
//! | `return <v>`       | finishes with a global's value, JSON `<v>` or string |
//! | `raise <message>`  | fails with `<message>`                               |
//! | `hang`             | never finishes                                      |
//! | `crash`            | kills the handle with an environment error          |
//!
//! `print`, `eprint` and `write` substitute `{name}` with global values.
//! Blank lines and lines starting with `#` are ignored.

use super::error::SandboxErrorKind;
use super::traits::{EventSender, Sandbox, SandboxFactory};
use crate::batcher::{pump, BatchConfig};
use crate::protocol::{ExecuteRequest, GuestFrame, HandleErrorKind, Outcome, OutputStream};
use crate::types::TaskId;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// In-process handle running stub scripts.
#[derive(Debug)]
pub struct StubSandbox {
    requests: mpsc::UnboundedSender<ExecuteRequest>,
    tasks: Vec<JoinHandle<()>>,
    destroyed: bool,
}

impl Sandbox for StubSandbox {
    fn execute(&self, request: ExecuteRequest) -> Result<(), SandboxErrorKind> {
        if self.destroyed {
            return Err(SandboxErrorKind::AlreadyDestroyed);
        }
        self.requests
            .send(request)
            .map_err(|_| SandboxErrorKind::RequestFailed {
                reason: "stub interpreter has exited".to_string(),
            })
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::debug!("StubSandbox destroyed");
    }

    fn is_alive(&self) -> bool {
        !self.destroyed
    }
}

impl Drop for StubSandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Factory for [`StubSandbox`] handles.
///
/// Clones share their boot-failure budget and spawn counter, so a test can
/// keep one clone to observe what the pool did with the other.
#[derive(Debug, Clone, Default)]
pub struct StubSandboxFactory {
    boot_delay: Duration,
    always_fail: bool,
    failing_boots: Arc<AtomicUsize>,
    spawned: Arc<AtomicUsize>,
}

impl StubSandboxFactory {
    /// Creates a factory whose handles boot instantly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every handle's `Ready` by `delay`.
    #[must_use]
    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    /// Makes the next `count` handles fail to boot.
    #[must_use]
    pub fn with_failing_boots(self, count: usize) -> Self {
        self.failing_boots.store(count, Ordering::SeqCst);
        self
    }

    /// Makes every handle fail to boot.
    #[must_use]
    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Number of handles spawned so far.
    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl SandboxFactory for StubSandboxFactory {
    fn spawn(
        &self,
        events: EventSender,
        batch: BatchConfig,
    ) -> Result<Box<dyn Sandbox>, SandboxErrorKind> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let fail_boot = self.always_fail
            || self
                .failing_boots
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let pump_task = tokio::spawn(pump(frame_rx, events, batch));
        let serve_task = tokio::spawn(serve(request_rx, frame_tx, self.boot_delay, fail_boot));

        Ok(Box::new(StubSandbox {
            requests: request_tx,
            tasks: vec![serve_task, pump_task],
            destroyed: false,
        }))
    }
}

async fn serve(
    mut requests: mpsc::UnboundedReceiver<ExecuteRequest>,
    frames: mpsc::UnboundedSender<GuestFrame>,
    boot_delay: Duration,
    fail_boot: bool,
) {
    if !boot_delay.is_zero() {
        tokio::time::sleep(boot_delay).await;
    }
    if fail_boot {
        let _ = frames.send(GuestFrame::Error {
            task_id: None,
            kind: HandleErrorKind::EnvironmentError {
                message: "stub sandbox failed to boot".to_string(),
            },
        });
        return;
    }
    if frames.send(GuestFrame::Ready).is_err() {
        return;
    }

    while let Some(request) = requests.recv().await {
        if !run_request(request, &frames).await {
            break;
        }
    }
}

/// Runs one request. Returns false if the handle crashed.
async fn run_request(request: ExecuteRequest, frames: &mpsc::UnboundedSender<GuestFrame>) -> bool {
    let ExecuteRequest {
        task_id,
        code,
        options,
    } = request;

    let mut interpreter = Interpreter {
        task_id: task_id.clone(),
        frames,
        globals: options.context,
        inputs: options.inputs.into(),
    };

    for script in options.setup_code {
        interpreter.globals.extend(script.options.context);
        match interpreter.run(&script.code).await {
            Ok(_) => {}
            Err(Fault::Raise(message)) => {
                let _ = frames.send(GuestFrame::Error {
                    task_id: Some(task_id),
                    kind: HandleErrorKind::SetupError {
                        message: format!("Setup code error: {message}"),
                    },
                });
                return true;
            }
            Err(Fault::Crash(message)) => {
                let _ = frames.send(GuestFrame::Error {
                    task_id: Some(task_id),
                    kind: HandleErrorKind::EnvironmentError { message },
                });
                return false;
            }
        }
    }

    let outcome = match interpreter.run(&code).await {
        Ok(value) => Outcome::Success { value },
        Err(Fault::Raise(message)) => Outcome::Failure { message },
        Err(Fault::Crash(message)) => {
            let _ = frames.send(GuestFrame::Error {
                task_id: Some(task_id),
                kind: HandleErrorKind::EnvironmentError { message },
            });
            return false;
        }
    };
    let _ = frames.send(GuestFrame::End { task_id, outcome });
    true
}

enum Fault {
    Raise(String),
    Crash(String),
}

struct Interpreter<'a> {
    task_id: TaskId,
    frames: &'a mpsc::UnboundedSender<GuestFrame>,
    globals: Map<String, Value>,
    inputs: VecDeque<String>,
}

impl Interpreter<'_> {
    async fn run(&mut self, source: &str) -> Result<Value, Fault> {
        for (index, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            let rest = rest.trim();

            match command {
                "print" => {
                    let text = format!("{}\n", self.render(rest));
                    self.write(OutputStream::Stdout, text);
                }
                "eprint" => {
                    let text = format!("{}\n", self.render(rest));
                    self.write(OutputStream::Stderr, text);
                }
                "write" => {
                    let text = unescape(&self.render(rest));
                    self.write(OutputStream::Stdout, text);
                }
                "spin" => {
                    let (count, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    let count: usize = count.parse().map_err(|_| {
                        Fault::Raise(format!(
                            "ValueError: line {}: spin count must be an integer",
                            index + 1
                        ))
                    })?;
                    let text = unescape(text);
                    for _ in 0..count {
                        self.write(OutputStream::Stdout, text.clone());
                    }
                }
                "sleep" => {
                    let ms: u64 = rest.parse().map_err(|_| {
                        Fault::Raise(format!(
                            "ValueError: line {}: sleep takes milliseconds",
                            index + 1
                        ))
                    })?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                "input" => {
                    let value = self
                        .inputs
                        .pop_front()
                        .ok_or_else(|| Fault::Raise("EOFError: EOF when reading a line".to_string()))?;
                    self.globals.insert(rest.to_string(), Value::String(value));
                }
                "global" => {
                    let value = self.globals.get(rest).cloned().ok_or_else(|| {
                        Fault::Raise(format!("NameError: name '{rest}' is not defined"))
                    })?;
                    self.write(OutputStream::Stdout, format!("{value}\n"));
                }
                "set" => {
                    let (name, value) = rest.split_once(' ').unwrap_or((rest, "null"));
                    let value = parse_value(value.trim());
                    self.globals.insert(name.to_string(), value);
                }
                "return" => return Ok(self.evaluate(rest)),
                "raise" => return Err(Fault::Raise(rest.to_string())),
                "hang" => std::future::pending::<()>().await,
                "crash" => return Err(Fault::Crash("stub sandbox crashed".to_string())),
                other => {
                    return Err(Fault::Raise(format!(
                        "SyntaxError: line {}: unknown command '{other}'",
                        index + 1
                    )))
                }
            }
        }
        Ok(Value::Null)
    }

    fn write(&self, stream: OutputStream, text: String) {
        let _ = self.frames.send(GuestFrame::Output {
            task_id: self.task_id.clone(),
            stream,
            text,
        });
    }

    fn evaluate(&self, expr: &str) -> Value {
        match self.globals.get(expr) {
            Some(value) => value.clone(),
            None => parse_value(expr),
        }
    }

    fn render(&self, template: &str) -> String {
        let mut text = template.to_string();
        for (name, value) in &self.globals {
            let shown = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&format!("{{{name}}}"), &shown);
        }
        text
    }
}

fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn unescape(text: &str) -> String {
    text.replace("\\n", "\n").replace("\\t", "\t")
}
