//! Interpreter-process sandbox.
//!
//! Each handle is one child Python interpreter running an embedded bootstrap
//! program, in its own process group. The host writes [`ExecuteRequest`]s to
//! the child's stdin as JSON lines and reads [`GuestFrame`]s back from its
//! stdout; the child's stderr carries only bootstrap diagnostics and is
//! logged. Destroying a handle kills the whole process group, which is the
//! only reliable way to interrupt a runaway program.

use super::error::SandboxErrorKind;
use super::traits::{EventSender, Sandbox, SandboxFactory};
use crate::batcher::{pump, BatchConfig};
use crate::config::ProcessConfig;
use crate::protocol::{ExecuteRequest, GuestFrame, HandleErrorKind};
use crate::types::TaskId;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Program the interpreter runs before accepting requests.
pub const BOOTSTRAP: &str = include_str!("bootstrap.py");

/// Environment variable carrying the blocked module list (JSON array).
pub const BLOCKED_MODULES_ENV: &str = "SANDBOX_BLOCKED_MODULES";

/// One interpreter child process.
#[derive(Debug)]
pub struct ProcessSandbox {
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<ExecuteRequest>,
    tasks: Vec<JoinHandle<()>>,
    destroyed: bool,
}

impl ProcessSandbox {
    /// OS process id of the interpreter, which is also its process group id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Sandbox for ProcessSandbox {
    fn execute(&self, request: ExecuteRequest) -> Result<(), SandboxErrorKind> {
        if self.destroyed {
            return Err(SandboxErrorKind::AlreadyDestroyed);
        }
        self.requests
            .send(request)
            .map_err(|_| SandboxErrorKind::RequestFailed {
                reason: "interpreter process has exited".to_string(),
            })
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(pid) = self.pid {
            kill_group(pid);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::debug!(pid = ?self.pid, "ProcessSandbox destroyed");
    }

    fn is_alive(&self) -> bool {
        !self.destroyed
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Factory launching one interpreter per handle.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandboxFactory {
    config: ProcessConfig,
}

impl ProcessSandboxFactory {
    /// Creates a factory from process settings.
    #[must_use]
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    /// Returns the process settings.
    #[must_use]
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    fn command(&self) -> Result<Command, SandboxErrorKind> {
        let blocked = serde_json::to_string(&self.config.blocked_modules).map_err(|e| {
            SandboxErrorKind::InvalidConfiguration {
                field: "blocked_modules".to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut command = Command::new(&self.config.interpreter);
        command
            .args(["-u", "-c", BOOTSTRAP])
            .envs(&self.config.env)
            .env(BLOCKED_MODULES_ENV, blocked)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        #[cfg(all(unix, feature = "resource-limits"))]
        apply_limits(&mut command, &self.config);

        Ok(command)
    }
}

impl SandboxFactory for ProcessSandboxFactory {
    fn spawn(
        &self,
        events: EventSender,
        batch: BatchConfig,
    ) -> Result<Box<dyn Sandbox>, SandboxErrorKind> {
        let mut child = self.command()?.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxErrorKind::InterpreterNotFound {
                    interpreter: self.config.interpreter.clone(),
                }
            } else {
                SandboxErrorKind::SpawnFailed {
                    reason: e.to_string(),
                }
            }
        })?;

        let pid = child.id();
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(SandboxErrorKind::SpawnFailed {
                    reason: "interpreter pipes were not captured".to_string(),
                })
            }
        };

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let pump_task = tokio::spawn(pump(frame_rx, events, batch));
        let driver_task = tokio::spawn(drive(child, stdin, stdout, request_rx, frame_tx));
        let stderr_task = tokio::spawn(log_stderr(stderr, pid));

        tracing::debug!(?pid, interpreter = %self.config.interpreter, "interpreter spawned");

        Ok(Box::new(ProcessSandbox {
            pid,
            requests: request_tx,
            tasks: vec![driver_task, stderr_task, pump_task],
            destroyed: false,
        }))
    }

    fn is_available(&self) -> bool {
        let interpreter = Path::new(&self.config.interpreter);
        if self.config.interpreter.contains('/') {
            return interpreter.is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(interpreter).is_file()))
            .unwrap_or(false)
    }
}

/// Shuttles requests to the child and frames back until either side closes.
async fn drive(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut requests: mpsc::UnboundedReceiver<ExecuteRequest>,
    frames: mpsc::UnboundedSender<GuestFrame>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut current: Option<TaskId> = None;

    let failure = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    break None;
                };
                current = Some(request.task_id.clone());
                if let Err(e) = write_request(&mut stdin, &request).await {
                    break Some(format!("failed to send request to interpreter: {e}"));
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match serde_json::from_str::<GuestFrame>(&line) {
                    Ok(frame) if !answers(&frame, current.as_ref()) => {
                        tracing::debug!(task_id = ?current, "dropping frame for a request that is not in flight");
                    }
                    Ok(frame) => {
                        if frame.is_terminal() {
                            current = None;
                        }
                        if frames.send(frame).is_err() {
                            break None;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring malformed frame from interpreter");
                    }
                },
                Ok(None) => {
                    let status = child.wait().await;
                    break Some(match status {
                        Ok(status) => format!("interpreter exited unexpectedly ({status})"),
                        Err(e) => format!("interpreter exited unexpectedly: {e}"),
                    });
                }
                Err(e) => break Some(format!("failed to read from interpreter: {e}")),
            }
        }
    };

    if let Some(message) = failure {
        tracing::warn!(task_id = ?current, %message, "interpreter failed");
        let _ = frames.send(GuestFrame::Error {
            task_id: current,
            kind: HandleErrorKind::EnvironmentError { message },
        });
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Returns true if `frame` may be forwarded while `current` is in flight.
///
/// Once a request is concluded, later frames naming it are stale, whoever
/// wrote them.
fn answers(frame: &GuestFrame, current: Option<&TaskId>) -> bool {
    match frame {
        GuestFrame::Ready | GuestFrame::Error { task_id: None, .. } => true,
        GuestFrame::Output { task_id, .. }
        | GuestFrame::End { task_id, .. }
        | GuestFrame::Error {
            task_id: Some(task_id),
            ..
        } => current == Some(task_id),
    }
}

async fn write_request(stdin: &mut ChildStdin, request: &ExecuteRequest) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

async fn log_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(?pid, %line, "interpreter stderr");
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill interpreter process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

#[cfg(all(unix, feature = "resource-limits"))]
fn apply_limits(command: &mut Command, config: &ProcessConfig) {
    use rlimit::Resource;

    let memory = config.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024));
    let cpu = config.cpu_time_secs;
    if memory.is_none() && cpu.is_none() {
        return;
    }

    // SAFETY: runs in the forked child before exec and only calls setrlimit,
    // which is async-signal-safe and touches no shared state.
    unsafe {
        command.pre_exec(move || {
            if let Some(bytes) = memory {
                rlimit::setrlimit(Resource::AS, bytes, bytes)?;
            }
            if let Some(secs) = cpu {
                rlimit::setrlimit(Resource::CPU, secs, secs)?;
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Outcome, ProtocolMessage, RunOptions, SetupScript};
    use serde_json::json;
    use std::time::Duration;

    fn factory() -> ProcessSandboxFactory {
        ProcessSandboxFactory::new(ProcessConfig::default())
    }

    fn request(code: &str, options: RunOptions) -> ExecuteRequest {
        ExecuteRequest {
            task_id: TaskId::new(),
            code: code.to_string(),
            options,
        }
    }

    async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<ProtocolMessage>) -> Vec<ProtocolMessage> {
        let mut messages = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("interpreter answered in time")
                .expect("event channel open");
            let done = message.is_terminal();
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    fn stream_text(messages: &[ProtocolMessage], stderr: bool) -> String {
        messages
            .iter()
            .filter_map(|m| match (m, stderr) {
                (ProtocolMessage::Stdout { text, .. }, false) => Some(text.as_str()),
                (ProtocolMessage::Stderr { text, .. }, true) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    async fn booted() -> (Box<dyn Sandbox>, mpsc::UnboundedReceiver<ProtocolMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sandbox = factory().spawn(tx, BatchConfig::default()).unwrap();
        let ready = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(ready, Some(ProtocolMessage::Ready));
        (sandbox, rx)
    }

    #[test]
    fn missing_interpreter_is_unavailable() {
        let factory = ProcessSandboxFactory::new(
            ProcessConfig::new().with_interpreter("definitely-not-an-interpreter-xyz"),
        );
        assert!(!factory.is_available());
    }

    #[tokio::test]
    async fn missing_interpreter_fails_to_spawn() {
        let factory = ProcessSandboxFactory::new(
            ProcessConfig::new().with_interpreter("definitely-not-an-interpreter-xyz"),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = factory.spawn(tx, BatchConfig::default()).unwrap_err();
        assert!(matches!(err, SandboxErrorKind::InterpreterNotFound { .. }));
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn runs_program_and_returns_final_expression() {
        let (sandbox, mut rx) = booted().await;
        let req = request("print('hi')\nx = 40\nx + 2", RunOptions::new());
        let id = req.task_id.clone();
        sandbox.execute(req).unwrap();
        let messages = until_terminal(&mut rx).await;

        assert_eq!(stream_text(&messages, false), "hi\n");
        assert_eq!(
            messages.last(),
            Some(&ProtocolMessage::End {
                task_id: id,
                outcome: Outcome::Success { value: json!(42) },
            })
        );
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn inputs_context_and_setup_are_applied() {
        let (sandbox, mut rx) = booted().await;
        let options = RunOptions::new()
            .with_input("Ada")
            .with_global("greeting", json!("hello"))
            .with_setup(SetupScript::new("suffix = '!'"));
        sandbox
            .execute(request("name = input()\nprint(greeting, name + suffix)", options))
            .unwrap();
        let messages = until_terminal(&mut rx).await;
        assert_eq!(stream_text(&messages, false), "hello Ada!\n");
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn errors_mention_only_guest_frames() {
        let (sandbox, mut rx) = booted().await;
        sandbox
            .execute(request("def f():\n    raise ValueError('bad')\nf()", RunOptions::new()))
            .unwrap();
        let messages = until_terminal(&mut rx).await;
        let Some(ProtocolMessage::End {
            outcome: Outcome::Failure { message },
            ..
        }) = messages.last()
        else {
            panic!("expected failure, got {messages:?}");
        };
        assert!(message.contains("ValueError: bad"));
        assert!(message.contains("<exec>"));
        assert!(!message.contains("_run"));
    }

    async fn failure_of(code: &str) -> String {
        let (sandbox, mut rx) = booted().await;
        sandbox.execute(request(code, RunOptions::new())).unwrap();
        let messages = until_terminal(&mut rx).await;
        match messages.last() {
            Some(ProtocolMessage::End {
                outcome: Outcome::Failure { message },
                ..
            }) => message.clone(),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    async fn value_of(code: &str) -> serde_json::Value {
        let (sandbox, mut rx) = booted().await;
        sandbox.execute(request(code, RunOptions::new())).unwrap();
        let messages = until_terminal(&mut rx).await;
        match messages.last() {
            Some(ProtocolMessage::End {
                outcome: Outcome::Success { value },
                ..
            }) => value.clone(),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn blocked_modules_cannot_be_imported() {
        let message = failure_of("import subprocess").await;
        assert!(message.contains("ModuleNotFoundError"), "{message}");
        assert!(message.contains("subprocess"), "{message}");
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn blocked_modules_stay_blocked_through_exec() {
        let message = failure_of("exec('import subprocess')").await;
        assert!(message.contains("ModuleNotFoundError"), "{message}");
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn blocked_modules_stay_blocked_through_importlib() {
        let message = failure_of("import importlib\nimportlib.import_module('subprocess')").await;
        assert!(message.contains("ModuleNotFoundError"), "{message}");

        let message = failure_of("__import__('socket')").await;
        assert!(message.contains("ModuleNotFoundError"), "{message}");
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn blocked_submodules_are_refused_after_unpoisoning() {
        let message = failure_of(
            "import sys\ndel sys.modules['multiprocessing']\nimport multiprocessing.pool",
        )
        .await;
        assert!(message.contains("not available in the sandbox"), "{message}");
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn main_module_exposes_only_guest_globals() {
        let value = value_of(
            "import __main__\nmine = 1\nsorted(n for n in vars(__main__) if not n.startswith('__'))",
        )
        .await;
        assert_eq!(value, json!(["mine"]));

        let message = failure_of("import __main__\n__main__._real_import('subprocess')").await;
        assert!(message.contains("AttributeError"), "{message}");

        let message = failure_of("import __main__\n__main__._send({'type': 'ready'})").await;
        assert!(message.contains("AttributeError"), "{message}");
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn frames_written_after_a_forged_end_are_dropped() {
        let (sandbox, mut rx) = booted().await;
        let forge = "import sys\n\
            w = sys.stdout.write.__func__\n\
            cells = dict(zip(w.__code__.co_freevars, (c.cell_contents for c in w.__closure__)))\n\
            cells['send']({'type': 'end', 'task_id': cells['current'][0], \
            'outcome': {'status': 'success', 'value': 'forged'}})\n\
            print('after')\n\
            'real'";
        sandbox.execute(request(forge, RunOptions::new())).unwrap();
        let messages = until_terminal(&mut rx).await;
        assert!(matches!(
            messages.last(),
            Some(ProtocolMessage::End { outcome: Outcome::Success { value }, .. }) if value == "forged"
        ));

        let next = request("print('next')", RunOptions::new());
        let next_id = next.task_id.clone();
        sandbox.execute(next).unwrap();
        let messages = until_terminal(&mut rx).await;
        assert_eq!(stream_text(&messages, false), "next\n");
        assert!(messages.iter().all(|m| m.task_id() == Some(&next_id)));
    }

    #[test]
    fn only_frames_for_the_request_in_flight_are_forwarded() {
        let id = TaskId::new();
        let other = TaskId::new();
        let end = |task_id: &TaskId| GuestFrame::End {
            task_id: task_id.clone(),
            outcome: Outcome::Success { value: json!(null) },
        };
        let output = GuestFrame::Output {
            task_id: id.clone(),
            stream: crate::protocol::OutputStream::Stdout,
            text: "x".to_string(),
        };

        assert!(answers(&GuestFrame::Ready, None));
        assert!(answers(&end(&id), Some(&id)));
        assert!(answers(&output, Some(&id)));
        assert!(!answers(&end(&id), None));
        assert!(!answers(&end(&other), Some(&id)));
        assert!(!answers(&output, None));
        assert!(answers(
            &GuestFrame::Error {
                task_id: None,
                kind: HandleErrorKind::EnvironmentError {
                    message: "boot".to_string()
                },
            },
            None
        ));
        assert!(!answers(
            &GuestFrame::Error {
                task_id: Some(other),
                kind: HandleErrorKind::EnvironmentError {
                    message: "late".to_string()
                },
            },
            Some(&id)
        ));
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn stderr_writes_are_streamed() {
        let (sandbox, mut rx) = booted().await;
        sandbox
            .execute(request("import sys\nsys.stderr.write('warn\\n')", RunOptions::new()))
            .unwrap();
        let messages = until_terminal(&mut rx).await;
        assert_eq!(stream_text(&messages, true), "warn\n");
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn setup_errors_are_reported_separately() {
        let (sandbox, mut rx) = booted().await;
        let options = RunOptions::new().with_setup(SetupScript::new("1 / 0"));
        sandbox.execute(request("print('never')", options)).unwrap();
        let messages = until_terminal(&mut rx).await;
        assert!(matches!(
            messages.last(),
            Some(ProtocolMessage::Error { kind: HandleErrorKind::SetupError { message }, .. })
                if message.starts_with("Setup code error:") && message.contains("ZeroDivisionError")
        ));
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn interpreter_exit_is_an_environment_error() {
        let (sandbox, mut rx) = booted().await;
        sandbox.execute(request("import os\nos._exit(3)", RunOptions::new())).unwrap();
        let messages = until_terminal(&mut rx).await;
        assert!(matches!(
            messages.last(),
            Some(ProtocolMessage::Error {
                task_id: Some(_),
                kind: HandleErrorKind::EnvironmentError { .. }
            })
        ));
    }

    #[cfg(all(unix, feature = "resource-limits"))]
    #[tokio::test]
    #[ignore = "requires python3"]
    async fn cpu_budget_spans_every_program_of_an_interpreter() {
        let factory = ProcessSandboxFactory::new(ProcessConfig::new().with_cpu_time_secs(1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sandbox = factory.spawn(tx, BatchConfig::default()).unwrap();
        let ready = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert_eq!(ready, Some(ProtocolMessage::Ready));

        let burn = |secs: f64| {
            format!("import time\nwhile time.process_time() < {secs}:\n    pass\n'done'")
        };

        // well inside the budget on its own
        sandbox.execute(request(&burn(0.6), RunOptions::new())).unwrap();
        let messages = until_terminal(&mut rx).await;
        assert!(matches!(
            messages.last(),
            Some(ProtocolMessage::End { outcome: Outcome::Success { .. }, .. })
        ));

        // the second program inherits what the first one spent
        sandbox.execute(request(&burn(1.5), RunOptions::new())).unwrap();
        let messages = until_terminal(&mut rx).await;
        assert!(matches!(
            messages.last(),
            Some(ProtocolMessage::Error {
                task_id: Some(_),
                kind: HandleErrorKind::EnvironmentError { .. }
            })
        ));
    }

    #[tokio::test]
    #[ignore = "requires python3"]
    async fn destroy_interrupts_runaway_program() {
        let (mut sandbox, mut rx) = booted().await;
        sandbox.execute(request("while True:\n    pass", RunOptions::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        sandbox.destroy();
        assert!(!sandbox.is_alive());
        // the program never wrote anything, so the channel just closes
        let rest = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(matches!(rest, Ok(None) | Err(_)));
    }
}
