//! Output batching for sandbox handles.
//!
//! A guest may write a character at a time in a tight loop. Forwarding every
//! write as its own message would flood the pool actor's mailbox, while
//! holding output until the program exits would hide progress. The batcher
//! sits between the two:
//!
//! - writes are queued in arrival order, adjacent writes to the same stream
//!   sharing one segment;
//! - a write that arrives at least `flush_interval` after the previous flush
//!   flushes the queue immediately;
//! - otherwise a single deferred flush is scheduled `flush_interval` out;
//! - a flushed segment is cut into messages of at most `max_batch_units`
//!   characters;
//! - `End`/`Error` force a full flush first, so nothing is lost or delivered
//!   after completion.
//!
//! The queue keeps stdout/stderr interleaving exact up to
//! [`MAX_PENDING_SEGMENTS`] stream switches per flush. Past that, a write joins
//! the newest segment of its own stream, so a program alternating streams in
//! a tight loop still yields a bounded number of messages per flush.
//!
//! [`OutputBatcher`] is the pure policy; [`pump`] drives it from a frame
//! channel with a timer.

use crate::protocol::{GuestFrame, OutputStream, ProtocolMessage};
use crate::types::TaskId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Default minimum spacing between flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(4);

/// Default maximum characters per output message.
pub const DEFAULT_MAX_BATCH_UNITS: usize = 50;

/// Stream switches kept in exact order between two flushes.
pub const MAX_PENDING_SEGMENTS: usize = 64;

/// Flush policy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Minimum spacing between flushes
    pub flush_interval: Duration,
    /// Maximum characters per emitted message (at least 1)
    pub max_batch_units: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_units: DEFAULT_MAX_BATCH_UNITS,
        }
    }
}

/// Consecutive output of one stream.
#[derive(Debug)]
struct Segment {
    stream: OutputStream,
    text: String,
    units: usize,
}

impl Segment {
    fn new(stream: OutputStream) -> Self {
        Self {
            stream,
            text: String::new(),
            units: 0,
        }
    }

    fn push(&mut self, text: &str) {
        self.text.push_str(text);
        self.units += text.chars().count();
    }

    /// Splits the segment into chunks of at most `max` characters.
    fn into_chunks(self, max: usize) -> Vec<String> {
        let text = self.text;
        let max = max.max(1);
        let mut chunks = Vec::with_capacity(self.units.div_ceil(max));
        let mut start = 0;
        let mut count = 0;
        for (idx, _) in text.char_indices() {
            if count == max {
                chunks.push(text[start..idx].to_string());
                start = idx;
                count = 0;
            }
            count += 1;
        }
        if start < text.len() {
            chunks.push(text[start..].to_string());
        }
        chunks
    }
}

/// Time- and size-bounded coalescing of guest writes.
#[derive(Debug)]
pub struct OutputBatcher {
    config: BatchConfig,
    task_id: Option<TaskId>,
    segments: Vec<Segment>,
    last_flush: Option<Instant>,
    deadline: Option<Instant>,
}

impl OutputBatcher {
    /// Creates an empty batcher.
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            task_id: None,
            segments: Vec::new(),
            last_flush: None,
            deadline: None,
        }
    }

    /// When the pending deferred flush is due, if one is scheduled.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Characters currently buffered across both streams.
    #[must_use]
    pub fn pending_units(&self) -> usize {
        self.segments.iter().map(|s| s.units).sum()
    }

    /// Accepts one write and returns whatever must be emitted now.
    pub fn push(
        &mut self,
        task_id: TaskId,
        stream: OutputStream,
        text: &str,
        now: Instant,
    ) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        if text.is_empty() {
            return out;
        }

        if self.task_id.as_ref() != Some(&task_id) {
            self.flush_all(&mut out);
            self.task_id = Some(task_id);
        }

        self.segment_for(stream).push(text);

        let due = self
            .last_flush
            .map_or(true, |last| now.duration_since(last) >= self.config.flush_interval);
        if due {
            self.flush_all(&mut out);
            self.last_flush = Some(now);
            self.deadline = None;
        } else if self.deadline.is_none() {
            self.deadline = Some(now + self.config.flush_interval);
        }
        out
    }

    /// Runs the deferred flush.
    pub fn on_deadline(&mut self, now: Instant) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        self.deadline = None;
        self.flush_all(&mut out);
        self.last_flush = Some(now);
        out
    }

    /// Flushes everything regardless of timing.
    pub fn drain(&mut self) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        self.deadline = None;
        self.flush_all(&mut out);
        out
    }

    /// Picks the segment a write to `stream` is appended to.
    fn segment_for(&mut self, stream: OutputStream) -> &mut Segment {
        let reuse = match self.segments.last() {
            Some(last) if last.stream == stream => Some(self.segments.len() - 1),
            _ if self.segments.len() >= MAX_PENDING_SEGMENTS => {
                self.segments.iter().rposition(|s| s.stream == stream)
            }
            _ => None,
        };
        let idx = match reuse {
            Some(idx) => idx,
            None => {
                self.segments.push(Segment::new(stream));
                self.segments.len() - 1
            }
        };
        &mut self.segments[idx]
    }

    fn flush_all(&mut self, out: &mut Vec<ProtocolMessage>) {
        let segments = std::mem::take(&mut self.segments);
        let Some(task_id) = self.task_id.clone() else {
            return;
        };
        let max = self.config.max_batch_units;
        for segment in segments {
            let stream = segment.stream;
            for chunk in segment.into_chunks(max) {
                out.push(ProtocolMessage::output(stream, task_id.clone(), chunk));
            }
        }
    }
}

/// Drives an [`OutputBatcher`] from a guest frame channel.
///
/// Runs until `frames` closes or `events` has no receiver. Output still
/// buffered when `frames` closes is flushed before returning.
pub async fn pump(
    mut frames: mpsc::UnboundedReceiver<GuestFrame>,
    events: mpsc::UnboundedSender<ProtocolMessage>,
    config: BatchConfig,
) {
    let mut batcher = OutputBatcher::new(config);

    loop {
        let next = match batcher.deadline() {
            Some(deadline) => {
                tokio::select! {
                    frame = frames.recv() => frame,
                    () = tokio::time::sleep_until(deadline) => {
                        if !forward(&events, batcher.on_deadline(Instant::now())) {
                            return;
                        }
                        continue;
                    }
                }
            }
            None => frames.recv().await,
        };

        let Some(frame) = next else {
            forward(&events, batcher.drain());
            return;
        };

        let messages = match frame {
            GuestFrame::Ready => vec![ProtocolMessage::Ready],
            GuestFrame::Output {
                task_id,
                stream,
                text,
            } => batcher.push(task_id, stream, &text, Instant::now()),
            GuestFrame::End { task_id, outcome } => {
                let mut messages = batcher.drain();
                messages.push(ProtocolMessage::End { task_id, outcome });
                messages
            }
            GuestFrame::Error { task_id, kind } => {
                let mut messages = batcher.drain();
                messages.push(ProtocolMessage::Error { task_id, kind });
                messages
            }
        };

        if !forward(&events, messages) {
            return;
        }
    }
}

fn forward(events: &mpsc::UnboundedSender<ProtocolMessage>, messages: Vec<ProtocolMessage>) -> bool {
    messages.into_iter().all(|message| events.send(message).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandleErrorKind, Outcome};
    use serde_json::Value;

    fn config(interval_ms: u64, max: usize) -> BatchConfig {
        BatchConfig {
            flush_interval: Duration::from_millis(interval_ms),
            max_batch_units: max,
        }
    }

    fn texts(messages: &[ProtocolMessage]) -> Vec<(OutputStream, String)> {
        messages
            .iter()
            .filter_map(|m| match m {
                ProtocolMessage::Stdout { text, .. } => Some((OutputStream::Stdout, text.clone())),
                ProtocolMessage::Stderr { text, .. } => Some((OutputStream::Stderr, text.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_write_flushes_immediately() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let id = TaskId::new();
        let out = batcher.push(id.clone(), OutputStream::Stdout, "hi", Instant::now());
        assert_eq!(
            out,
            vec![ProtocolMessage::Stdout {
                task_id: id,
                text: "hi".to_string()
            }]
        );
        assert!(batcher.deadline().is_none());
    }

    #[test]
    fn writes_inside_interval_are_deferred() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let id = TaskId::new();
        let t0 = Instant::now();
        batcher.push(id.clone(), OutputStream::Stdout, "a", t0);
        let out = batcher.push(id.clone(), OutputStream::Stdout, "b", t0 + Duration::from_millis(1));
        assert!(out.is_empty());
        assert_eq!(batcher.deadline(), Some(t0 + Duration::from_millis(5)));

        // a second deferred write does not move the deadline
        batcher.push(id, OutputStream::Stdout, "c", t0 + Duration::from_millis(2));
        assert_eq!(batcher.deadline(), Some(t0 + Duration::from_millis(5)));

        let out = batcher.on_deadline(t0 + Duration::from_millis(5));
        assert_eq!(texts(&out), vec![(OutputStream::Stdout, "bc".to_string())]);
        assert!(batcher.deadline().is_none());
        assert_eq!(batcher.pending_units(), 0);
    }

    #[test]
    fn write_after_interval_flushes_without_timer() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let id = TaskId::new();
        let t0 = Instant::now();
        batcher.push(id.clone(), OutputStream::Stdout, "a", t0);
        batcher.push(id.clone(), OutputStream::Stdout, "b", t0 + Duration::from_millis(1));
        let out = batcher.push(id, OutputStream::Stdout, "c", t0 + Duration::from_millis(6));
        assert_eq!(texts(&out), vec![(OutputStream::Stdout, "bc".to_string())]);
        assert!(batcher.deadline().is_none());
    }

    #[test]
    fn stream_switch_preserves_write_order() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let id = TaskId::new();
        let t0 = Instant::now();
        let mut out = batcher.push(id.clone(), OutputStream::Stdout, "a", t0);
        out.extend(batcher.push(id.clone(), OutputStream::Stderr, "b", t0 + Duration::from_millis(1)));
        out.extend(batcher.push(id, OutputStream::Stdout, "c", t0 + Duration::from_millis(2)));
        out.extend(batcher.drain());
        assert_eq!(
            texts(&out),
            vec![
                (OutputStream::Stdout, "a".to_string()),
                (OutputStream::Stderr, "b".to_string()),
                (OutputStream::Stdout, "c".to_string()),
            ]
        );
    }

    #[test]
    fn large_buffers_are_cut_into_bounded_chunks() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let id = TaskId::new();
        let t0 = Instant::now();
        let mut out = Vec::new();
        for _ in 0..10_000 {
            out.extend(batcher.push(id.clone(), OutputStream::Stdout, "x", t0));
        }
        // only the very first write went out immediately
        assert_eq!(out.len(), 1);
        let deferred = batcher.on_deadline(t0 + Duration::from_millis(4));
        assert_eq!(deferred.len(), 200);
        let chunks = texts(&deferred);
        assert!(chunks.iter().all(|(_, t)| t.chars().count() <= 50));
        let total: usize = chunks.iter().map(|(_, t)| t.len()).sum();
        assert_eq!(total + 1, 10_000);
    }

    #[test]
    fn chunking_respects_multibyte_characters() {
        let mut segment = Segment::new(OutputStream::Stdout);
        segment.push("héllo wörld");
        assert_eq!(segment.into_chunks(3), vec!["hél", "lo ", "wör", "ld"]);
    }

    #[test]
    fn interleaved_writes_inside_interval_keep_order() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let id = TaskId::new();
        let t0 = Instant::now();
        let mut out = batcher.push(id.clone(), OutputStream::Stdout, "start\n", t0);
        for (stream, text) in [
            (OutputStream::Stdout, "a"),
            (OutputStream::Stdout, "\n"),
            (OutputStream::Stderr, "b\n"),
            (OutputStream::Stdout, "c\n"),
            (OutputStream::Stderr, "d\n"),
        ] {
            out.extend(batcher.push(id.clone(), stream, text, t0));
        }
        assert_eq!(out.len(), 1);

        out.extend(batcher.on_deadline(t0 + Duration::from_millis(4)));
        assert_eq!(
            texts(&out),
            vec![
                (OutputStream::Stdout, "start\n".to_string()),
                (OutputStream::Stdout, "a\n".to_string()),
                (OutputStream::Stderr, "b\n".to_string()),
                (OutputStream::Stdout, "c\n".to_string()),
                (OutputStream::Stderr, "d\n".to_string()),
            ]
        );
    }

    #[test]
    fn alternating_streams_yield_bounded_messages() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let id = TaskId::new();
        let t0 = Instant::now();
        let mut immediate = Vec::new();
        for i in 0..10_000 {
            let (stream, text) = if i % 2 == 0 {
                (OutputStream::Stdout, "o")
            } else {
                (OutputStream::Stderr, "e")
            };
            immediate.extend(batcher.push(id.clone(), stream, text, t0));
        }
        assert_eq!(immediate.len(), 1);
        assert_eq!(batcher.deadline(), Some(t0 + Duration::from_millis(4)));

        let deferred = batcher.on_deadline(t0 + Duration::from_millis(4));
        assert!(deferred.len() <= MAX_PENDING_SEGMENTS + 10_000 / 50 + 2);
        let chunks = texts(&deferred);
        assert!(chunks.iter().all(|(_, t)| t.chars().count() <= 50));

        // nothing lost and each stream keeps only its own writes
        let stdout: usize = chunks
            .iter()
            .filter(|(s, t)| *s == OutputStream::Stdout && t.chars().all(|c| c == 'o'))
            .map(|(_, t)| t.len())
            .sum();
        let stderr: usize = chunks
            .iter()
            .filter(|(s, t)| *s == OutputStream::Stderr && t.chars().all(|c| c == 'e'))
            .map(|(_, t)| t.len())
            .sum();
        assert_eq!(stdout + 1, 5_000);
        assert_eq!(stderr, 5_000);

        // the next write inside the interval waits for the timer again
        let out = batcher.push(id, OutputStream::Stdout, "x", t0 + Duration::from_millis(5));
        assert!(out.is_empty());
        assert_eq!(batcher.deadline(), Some(t0 + Duration::from_millis(9)));
    }

    #[test]
    fn new_task_drains_previous_task_output() {
        let mut batcher = OutputBatcher::new(config(4, 50));
        let first = TaskId::new();
        let second = TaskId::new();
        let t0 = Instant::now();
        batcher.push(first.clone(), OutputStream::Stdout, "a", t0);
        batcher.push(first.clone(), OutputStream::Stdout, "b", t0);
        let out = batcher.push(second.clone(), OutputStream::Stdout, "c", t0);
        assert_eq!(out[0].task_id(), Some(&first));
        assert_eq!(out.last().and_then(ProtocolMessage::task_id), Some(&second));
    }

    #[tokio::test(start_paused = true)]
    async fn pump_flushes_before_terminal_messages() {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(pump(frame_rx, event_tx, config(4, 2)));

        let id = TaskId::new();
        frame_tx.send(GuestFrame::Ready).unwrap();
        for text in ["a", "b", "c", "d", "e"] {
            frame_tx
                .send(GuestFrame::Output {
                    task_id: id.clone(),
                    stream: OutputStream::Stdout,
                    text: text.to_string(),
                })
                .unwrap();
        }
        frame_tx
            .send(GuestFrame::End {
                task_id: id.clone(),
                outcome: Outcome::Success { value: Value::Null },
            })
            .unwrap();
        drop(frame_tx);
        handle.await.unwrap();

        let mut received = Vec::new();
        while let Ok(message) = event_rx.try_recv() {
            received.push(message);
        }
        assert_eq!(received.first(), Some(&ProtocolMessage::Ready));
        assert!(received.last().is_some_and(ProtocolMessage::is_terminal));
        let joined: String = texts(&received).into_iter().map(|(_, t)| t).collect();
        assert_eq!(joined, "abcde");
        assert!(texts(&received).iter().all(|(_, t)| t.chars().count() <= 2));
    }

    #[tokio::test(start_paused = true)]
    async fn pump_deferred_flush_fires_on_timer() {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(frame_rx, event_tx, config(10, 50)));

        let id = TaskId::new();
        for text in ["a", "b"] {
            frame_tx
                .send(GuestFrame::Output {
                    task_id: id.clone(),
                    stream: OutputStream::Stdout,
                    text: text.to_string(),
                })
                .unwrap();
        }

        let first = event_rx.recv().await.unwrap();
        assert_eq!(
            first,
            ProtocolMessage::Stdout {
                task_id: id.clone(),
                text: "a".to_string()
            }
        );
        let started = Instant::now();
        let second = event_rx.recv().await.unwrap();
        assert_eq!(
            second,
            ProtocolMessage::Stdout {
                task_id: id.clone(),
                text: "b".to_string()
            }
        );
        assert!(started.elapsed() <= Duration::from_millis(10));

        frame_tx
            .send(GuestFrame::Error {
                task_id: Some(id),
                kind: HandleErrorKind::SetupError {
                    message: "nope".to_string(),
                },
            })
            .unwrap();
        assert!(event_rx.recv().await.unwrap().is_terminal());
    }
}
