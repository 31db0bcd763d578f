//! Watch stream: ack, then task events until a terminal event, peer close
//! or cancellation.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::DaemonClient;
use crate::error::{ClientError, Result};
use crate::protocol::{Request, RequestType, Response};
use crate::task::TaskEvent;
use crate::transport::Connection;

pub const DEFAULT_EVENT_CAPACITY: usize = 32;

/// Lifecycle of a watch. `Opening` and `Acked` belong to the open exchange
/// and show up in logs; a [`WatchStream`] is only handed out once acked, so
/// its [`WatchStream::phase`] reports `Streaming` or `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Opening,
    Acked,
    Streaming,
    Closed,
}

impl WatchPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WatchPhase::Opening,
            1 => WatchPhase::Acked,
            2 => WatchPhase::Streaming,
            _ => WatchPhase::Closed,
        }
    }
}

#[derive(Debug)]
struct Shared {
    phase: AtomicU8,
    dropped: AtomicU64,
}

impl Shared {
    fn set_phase(&self, phase: WatchPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Producer side of a watch. Non-terminal events never block the reader:
/// when the queue is full the newest event is dropped and counted. Terminal
/// events wait for room so the end of a task is never lost.
#[derive(Debug)]
pub struct EventSink {
    task_id: String,
    tx: mpsc::Sender<TaskEvent>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl EventSink {
    /// Returns `false` once the consumer is gone or the watch was cancelled.
    pub async fn deliver(&self, event: TaskEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if event.kind.is_terminal() {
            return tokio::select! {
                _ = self.cancel.cancelled() => false,
                sent = self.tx.send(event) => sent.is_ok(),
            };
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    task_id = %self.task_id,
                    event = event.kind.as_str(),
                    dropped,
                    "event queue full, dropping newest event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark the stream closed and fire the cancellation handle.
    pub fn close(&self) {
        self.shared.set_phase(WatchPhase::Closed);
        self.cancel.cancel();
    }
}

/// Consumer side of a watch.
#[derive(Debug)]
pub struct WatchStream {
    task_id: String,
    events: mpsc::Receiver<TaskEvent>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

/// Create a connected sink/stream pair already in the streaming phase.
pub fn channel(
    task_id: impl Into<String>,
    capacity: usize,
    cancel: CancellationToken,
) -> (EventSink, WatchStream) {
    let task_id = task_id.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        phase: AtomicU8::new(WatchPhase::Streaming as u8),
        dropped: AtomicU64::new(0),
    });
    let sink = EventSink {
        task_id: task_id.clone(),
        tx,
        cancel: cancel.clone(),
        shared: shared.clone(),
    };
    let stream = WatchStream {
        task_id,
        events: rx,
        cancel,
        shared,
    };
    (sink, stream)
}

impl WatchStream {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next event in arrival order; `None` once the stream has closed and
    /// every queued event was consumed.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.events.recv().await
    }

    /// Stop the watch. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `Streaming` until the pump stops, then `Closed`.
    pub fn phase(&self) -> WatchPhase {
        WatchPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl DaemonClient {
    pub async fn watch(&self, task_id: &str) -> Result<WatchStream> {
        self.watch_with(task_id, DEFAULT_EVENT_CAPACITY, CancellationToken::new())
            .await
    }

    /// Open a watch on `task_id`. Cancelling `cancel` aborts the open or,
    /// later, tears down the connection and ends the stream.
    pub async fn watch_with(
        &self,
        task_id: &str,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<WatchStream> {
        let id = task_id.trim();
        if id.is_empty() {
            return Err(ClientError::InvalidRequest("task id is required"));
        }
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let ack_timeout = self.request_timeout();
        let open = async {
            let mut conn = self.connect(self.options().max_stream_line_bytes).await?;
            debug!(daemon = %self.name(), task_id = %id, phase = ?WatchPhase::Opening, "watch requested");
            conn.send(&Request::with_task(RequestType::ToolWatch, id))
                .await?;
            let ack = conn.read_line_within(ack_timeout).await?;
            Ok::<_, ClientError>((conn, ack))
        };
        let (conn, ack) = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            opened = open => opened?,
        };

        let ack = match ack {
            Some(line) if !line.trim().is_empty() => line,
            _ => {
                conn.close().await;
                return Err(ClientError::NoResponse);
            }
        };
        let response: Response =
            serde_json::from_str(ack.trim()).map_err(|source| ClientError::Decode {
                context: "stream ack",
                source,
            })?;
        if !response.success {
            conn.close().await;
            return Err(ClientError::daemon(&response.error, "stream rejected"));
        }
        debug!(daemon = %self.name(), task_id = %id, phase = ?WatchPhase::Acked, "watch acknowledged");

        let (sink, stream) = channel(id, capacity, cancel);
        tokio::spawn(pump(conn, sink));
        Ok(stream)
    }
}

async fn pump(mut conn: Connection, sink: EventSink) {
    loop {
        let line = tokio::select! {
            _ = sink.cancel.cancelled() => {
                debug!(task_id = %sink.task_id, "watch cancelled");
                break;
            }
            line = conn.read_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let event = match TaskEvent::parse_line(trimmed) {
                    Ok(event) => event,
                    Err(err) => {
                        debug!(task_id = %sink.task_id, error = %err, "skipping malformed stream line");
                        continue;
                    }
                };
                let terminal = event.kind.is_terminal();
                if !sink.deliver(event).await {
                    break;
                }
                if terminal {
                    debug!(task_id = %sink.task_id, "terminal event received");
                    break;
                }
            }
            Ok(None) => {
                debug!(task_id = %sink.task_id, "watch stream closed by daemon");
                break;
            }
            Err(ClientError::LineTooLong { limit }) => {
                warn!(task_id = %sink.task_id, limit, "skipping oversized stream line");
            }
            Err(err) => {
                debug!(task_id = %sink.task_id, error = %err, "watch stream read failed");
                break;
            }
        }
    }
    sink.close();
    conn.close().await;
}
