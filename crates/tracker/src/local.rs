use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetd_client::watch::{channel, EventSink};
use fleetd_client::{ClientError, TaskEvent, WatchStream};

use crate::backend::TaskWatcher;
use crate::types::DEFAULT_EVENT_CAPACITY;

#[derive(Debug, Default)]
struct Subscriptions {
    sinks: HashMap<String, Vec<EventSink>>,
    rejections: HashMap<String, String>,
}

impl Subscriptions {
    /// Drop sinks whose stream was cancelled or dropped, and task ids left
    /// without any.
    fn prune_cancelled(&mut self) {
        self.sinks.retain(|task_id, sinks| {
            let before = sinks.len();
            sinks.retain(|sink| !sink.cancellation_token().is_cancelled());
            if sinks.len() < before {
                debug!(task_id = %task_id, pruned = before - sinks.len(), "cancelled subscribers pruned");
            }
            !sinks.is_empty()
        });
    }
}

/// In-process watcher: events are published directly instead of read from
/// a daemon connection. Used when tasks run in the same process, and by
/// tests.
#[derive(Debug, Clone)]
pub struct LocalWatcher {
    inner: Arc<Mutex<Subscriptions>>,
    capacity: usize,
}

impl Default for LocalWatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl LocalWatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Subscriptions::default())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscriptions> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `event` to every live subscriber of `task_id`. Terminal
    /// events close the subscriptions. Returns how many subscribers took it.
    pub async fn publish(&self, task_id: &str, event: TaskEvent) -> usize {
        let sinks = self.lock().sinks.remove(task_id).unwrap_or_default();
        let terminal = event.kind.is_terminal();
        let mut delivered = 0;
        let mut live = Vec::with_capacity(sinks.len());
        for sink in sinks {
            if sink.deliver(event.clone()).await {
                delivered += 1;
                if !terminal {
                    live.push(sink);
                    continue;
                }
            }
            sink.close();
        }
        if !live.is_empty() {
            self.lock()
                .sinks
                .entry(task_id.to_string())
                .or_default()
                .extend(live);
        }
        debug!(task_id, event = event.kind.as_str(), delivered, "local event published");
        delivered
    }

    /// Close every subscription of `task_id` without a terminal event.
    pub fn close(&self, task_id: &str) {
        if let Some(sinks) = self.lock().sinks.remove(task_id) {
            for sink in sinks {
                sink.close();
            }
        }
    }

    /// Make the next watch of `task_id` fail with a daemon error.
    pub fn reject(&self, task_id: &str, message: impl Into<String>) {
        self.lock()
            .rejections
            .insert(task_id.to_string(), message.into());
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.lock()
            .sinks
            .get(task_id)
            .map(|sinks| sinks.iter().filter(|s| !s.cancellation_token().is_cancelled()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TaskWatcher for LocalWatcher {
    async fn watch(
        &self,
        task_id: &str,
        cancel: CancellationToken,
    ) -> Result<WatchStream, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let mut subs = self.lock();
        if let Some(message) = subs.rejections.remove(task_id) {
            return Err(ClientError::Daemon { message });
        }
        subs.prune_cancelled();
        let (sink, stream) = channel(task_id, self.capacity, cancel);
        subs.sinks.entry(task_id.to_string()).or_default().push(sink);
        Ok(stream)
    }
}
