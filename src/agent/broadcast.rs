//! Output fan-out for a single session
//!
//! Keeps a bounded backlog of recent output for late joiners and forwards
//! every new chunk to all subscribed viewers in production order. Owned by
//! the session actor, so it is never mutated concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::SessionStatus;

/// Identifier of a subscribed viewer
pub type ViewerId = Uuid;

/// Event delivered to a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Raw output chunk (backlog replay or live)
    Output(Arc<[u8]>),
    /// The classified status changed
    Status(SessionStatus),
    /// The process exited; the session stays inspectable
    Exited { code: Option<i32> },
    /// The session was destroyed; no further events follow
    Closed,
}

/// Non-owning handle to a viewer connection.
///
/// The transport owns the receiving side and the connection lifecycle; the
/// session only holds the sender.
#[derive(Debug, Clone)]
pub struct Viewer {
    id: ViewerId,
    tx: mpsc::UnboundedSender<ViewerEvent>,
}

impl Viewer {
    /// Create a viewer and the receiver its transport reads from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ViewerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ViewerId {
        self.id
    }

    /// Returns false once the receiving side is gone
    fn send(&self, event: ViewerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Bounded sequence of recent output chunks, oldest evicted first
#[derive(Debug)]
pub struct Backlog {
    chunks: VecDeque<Arc<[u8]>>,
    capacity: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: Arc<[u8]>) {
        if self.chunks.len() == self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<[u8]>> {
        self.chunks.iter()
    }

    /// Decoded tail of the backlog, at most `max_chars` characters
    pub fn tail_text(&self, max_chars: usize) -> String {
        // A char is at most 4 bytes, so this many bytes always covers the window
        let wanted = max_chars.saturating_mul(4);
        let mut taken = 0;
        let mut start = self.chunks.len();
        while start > 0 && taken < wanted {
            start -= 1;
            taken += self.chunks[start].len();
        }

        let mut bytes = Vec::with_capacity(taken);
        for chunk in self.chunks.range(start..) {
            bytes.extend_from_slice(chunk);
        }
        let text = String::from_utf8_lossy(&bytes);
        let skip = text.chars().count().saturating_sub(max_chars);
        text.chars().skip(skip).collect()
    }
}

/// Bytes produced within a sliding time window
#[derive(Debug)]
pub struct OutputMeter {
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
}

impl OutputMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant, bytes: usize) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) >= self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, bytes));
    }

    /// Total bytes recorded within the window ending at `now`
    pub fn total(&self, now: Instant) -> usize {
        self.samples
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) < self.window)
            .map(|(_, bytes)| bytes)
            .sum()
    }
}

/// Ordered single-producer fan-out with replay
#[derive(Debug)]
pub struct OutputBroadcaster {
    backlog: Backlog,
    meter: OutputMeter,
    viewers: Vec<Viewer>,
    last_output: Option<Instant>,
    /// Exit code once the process has exited
    exit: Option<Option<i32>>,
}

impl OutputBroadcaster {
    pub fn new(backlog_chunks: usize, recent_window: Duration) -> Self {
        Self {
            backlog: Backlog::new(backlog_chunks),
            meter: OutputMeter::new(recent_window),
            viewers: Vec::new(),
            last_output: None,
            exit: None,
        }
    }

    /// Attach a viewer, replaying the backlog to it first. After an exit the
    /// replay ends with the exit marker.
    ///
    /// Re-subscribing an already attached viewer only replays the backlog.
    pub fn subscribe(&mut self, viewer: Viewer) -> bool {
        self.viewers.retain(|v| v.id != viewer.id);

        for chunk in self.backlog.iter() {
            if !viewer.send(ViewerEvent::Output(Arc::clone(chunk))) {
                return false;
            }
        }
        if let Some(code) = self.exit {
            if !viewer.send(ViewerEvent::Exited { code }) {
                return false;
            }
        }
        self.viewers.push(viewer);
        true
    }

    /// Detach a viewer. Unknown ids are ignored.
    pub fn unsubscribe(&mut self, viewer_id: ViewerId) -> bool {
        let before = self.viewers.len();
        self.viewers.retain(|v| v.id != viewer_id);
        self.viewers.len() != before
    }

    /// Record and forward one output chunk
    pub fn broadcast(&mut self, chunk: Vec<u8>, now: Instant) {
        let size = chunk.len();
        let chunk: Arc<[u8]> = chunk.into();

        self.backlog.push(Arc::clone(&chunk));
        self.meter.record(now, size);
        self.last_output = Some(now);

        // Closed receivers mean the transport dropped the viewer
        self.viewers
            .retain(|viewer| viewer.send(ViewerEvent::Output(Arc::clone(&chunk))));
    }

    /// Forward a non-output event to every viewer
    pub fn notify(&mut self, event: ViewerEvent) {
        self.viewers.retain(|viewer| viewer.send(event.clone()));
    }

    /// Record the process exit and tell every viewer about it
    pub fn finish(&mut self, code: Option<i32>) {
        self.exit = Some(code);
        self.notify(ViewerEvent::Exited { code });
    }

    /// Tell every viewer the session is gone and drop them all
    pub fn close_all(&mut self) {
        for viewer in self.viewers.drain(..) {
            let _ = viewer.send(ViewerEvent::Closed);
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn last_output(&self) -> Option<Instant> {
        self.last_output
    }

    pub fn recent_output_size(&self, now: Instant) -> usize {
        self.meter.total(now)
    }
}
