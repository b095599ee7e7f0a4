//! Consumers of flushed output.
//!
//! The pool calls [`OutputSink::append`] once per flushed batch, from inside
//! its actor, so a sink observes batches in protocol order. Dividers are
//! appended by callers between runs, never by the pool.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

/// Default number of lines a [`LineBuffer`] retains.
pub const DEFAULT_MAX_LINES: usize = 500;

/// What a chunk of appended text represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// Program standard output
    Stdout,
    /// Program standard error
    Stderr,
    /// Caller-side separator between runs
    Divider,
}

impl From<crate::protocol::OutputStream> for OutputKind {
    fn from(stream: crate::protocol::OutputStream) -> Self {
        match stream {
            crate::protocol::OutputStream::Stdout => Self::Stdout,
            crate::protocol::OutputStream::Stderr => Self::Stderr,
        }
    }
}

/// Receives flushed output batches.
pub trait OutputSink: Send + Sync + Debug {
    /// Appends one batch.
    fn append(&self, text: &str, kind: OutputKind);
}

/// A run of same-kind text within one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Stream the text came from
    pub kind: OutputKind,
    /// Text without the line terminator
    pub text: String,
}

/// One entry of a [`LineBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// A line of program output, possibly mixing streams
    Text(Vec<Segment>),
    /// Separator between runs
    Divider,
}

impl Line {
    /// Returns the line's text with stream boundaries erased.
    #[must_use]
    pub fn plain(&self) -> String {
        match self {
            Self::Text(segments) => segments.iter().map(|s| s.text.as_str()).collect(),
            Self::Divider => String::new(),
        }
    }
}

#[derive(Debug, Default)]
struct LineBufferState {
    lines: VecDeque<Line>,
    /// The last line has not seen its terminator yet
    open: bool,
}

/// Line-oriented history of output, capped at `max_lines`.
#[derive(Debug)]
pub struct LineBuffer {
    state: Mutex<LineBufferState>,
    max_lines: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl LineBuffer {
    /// Creates an empty buffer retaining at most `max_lines` lines.
    #[must_use]
    pub fn new(max_lines: usize) -> Self {
        Self {
            state: Mutex::new(LineBufferState::default()),
            max_lines: max_lines.max(1),
        }
    }

    /// Returns a snapshot of the retained lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<Line> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Returns retained output as text, one `\n`-terminated line per entry.
    /// Dividers render as `---`.
    #[must_use]
    pub fn text(&self) -> String {
        let state = self.lock();
        let mut out = String::new();
        for line in &state.lines {
            match line {
                Line::Divider => out.push_str("---"),
                Line::Text(_) => out.push_str(&line.plain()),
            }
            out.push('\n');
        }
        out
    }

    /// Drops all retained lines.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.lines.clear();
        state.open = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LineBufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trim(&self, state: &mut LineBufferState) {
        while state.lines.len() > self.max_lines {
            state.lines.pop_front();
        }
    }
}

impl OutputSink for LineBuffer {
    fn append(&self, text: &str, kind: OutputKind) {
        let mut state = self.lock();

        if kind == OutputKind::Divider {
            state.lines.push_back(Line::Divider);
            state.open = false;
            self.trim(&mut state);
            return;
        }

        let LineBufferState { lines, open } = &mut *state;
        for piece in text.split_inclusive('\n') {
            let (body, terminated) = match piece.strip_suffix('\n') {
                Some(body) => (body, true),
                None => (piece, false),
            };

            let segment = Segment {
                kind,
                text: body.to_string(),
            };
            match lines.back_mut() {
                Some(Line::Text(segments)) if *open => match segments.last_mut() {
                    Some(last) if last.kind == kind => last.text.push_str(body),
                    _ => segments.push(segment),
                },
                _ => lines.push_back(Line::Text(vec![segment])),
            }
            *open = !terminated;
        }
        self.trim(&mut state);
    }
}

/// Writes batches straight to the process's stdout and stderr.
#[derive(Debug, Clone)]
pub struct StdioSink {
    divider: String,
}

impl Default for StdioSink {
    fn default() -> Self {
        Self::new("----")
    }
}

impl StdioSink {
    /// Creates a sink printing `divider` on its own line between runs.
    #[must_use]
    pub fn new(divider: impl Into<String>) -> Self {
        Self {
            divider: divider.into(),
        }
    }
}

impl OutputSink for StdioSink {
    fn append(&self, text: &str, kind: OutputKind) {
        let result = match kind {
            OutputKind::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(text.as_bytes()).and_then(|()| out.flush())
            }
            OutputKind::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(text.as_bytes()).and_then(|()| err.flush())
            }
            OutputKind::Divider => {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{}", self.divider).and_then(|()| out.flush())
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, ?kind, "failed to write output batch");
        }
    }
}

/// Forwards every batch to a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<(String, OutputKind)>,
}

impl ChannelSink {
    /// Creates a sink together with the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, OutputKind)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl OutputSink for ChannelSink {
    fn append(&self, text: &str, kind: OutputKind) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.sender.send((text.to_string(), kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(kind: OutputKind, text: &str) -> Segment {
        Segment {
            kind,
            text: text.to_string(),
        }
    }

    #[test]
    fn batches_are_split_into_lines() {
        let buffer = LineBuffer::default();
        buffer.append("one\ntw", OutputKind::Stdout);
        buffer.append("o\nthree\n", OutputKind::Stdout);
        assert_eq!(buffer.text(), "one\ntwo\nthree\n");
        assert_eq!(buffer.lines().len(), 3);
    }

    #[test]
    fn mixed_streams_on_one_line_keep_segments() {
        let buffer = LineBuffer::default();
        buffer.append("a", OutputKind::Stdout);
        buffer.append("b", OutputKind::Stderr);
        buffer.append("c\n", OutputKind::Stdout);
        assert_eq!(
            buffer.lines(),
            vec![Line::Text(vec![
                seg(OutputKind::Stdout, "a"),
                seg(OutputKind::Stderr, "b"),
                seg(OutputKind::Stdout, "c"),
            ])]
        );
    }

    #[test]
    fn divider_closes_the_open_line() {
        let buffer = LineBuffer::default();
        buffer.append("partial", OutputKind::Stdout);
        buffer.append("", OutputKind::Divider);
        buffer.append("next\n", OutputKind::Stdout);
        assert_eq!(buffer.text(), "partial\n---\nnext\n");
    }

    #[test]
    fn history_is_capped_dropping_oldest() {
        let buffer = LineBuffer::new(3);
        for i in 0..5 {
            buffer.append(&format!("{i}\n"), OutputKind::Stdout);
        }
        assert_eq!(buffer.text(), "2\n3\n4\n");
        buffer.clear();
        assert!(buffer.lines().is_empty());
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.append("x", OutputKind::Stdout);
        sink.append("y", OutputKind::Stderr);
        assert_eq!(rx.recv().await, Some(("x".to_string(), OutputKind::Stdout)));
        assert_eq!(rx.recv().await, Some(("y".to_string(), OutputKind::Stderr)));
    }
}
