use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetd_client::{ClientError, ClientOptions, DaemonClient, DaemonRegistry, WatchStream};

use crate::backend::TaskWatcher;
use crate::types::{TrackerConfig, DEFAULT_EVENT_CAPACITY};

/// Opens watches against one named daemon from the registry.
///
/// The registry lookup happens per watch, so a daemon disabled after the
/// watcher was built is refused on the next open.
#[derive(Debug, Clone)]
pub struct DaemonWatcher {
    registry: DaemonRegistry,
    daemon: String,
    options: ClientOptions,
    capacity: usize,
}

impl DaemonWatcher {
    pub fn new(registry: DaemonRegistry, daemon: impl Into<String>) -> Self {
        Self {
            registry,
            daemon: daemon.into(),
            options: ClientOptions::default(),
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn from_config(registry: DaemonRegistry, config: &TrackerConfig) -> Self {
        Self {
            capacity: config.event_capacity,
            ..Self::new(registry, config.daemon.clone())
        }
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn daemon(&self) -> &str {
        &self.daemon
    }
}

#[async_trait]
impl TaskWatcher for DaemonWatcher {
    async fn watch(
        &self,
        task_id: &str,
        cancel: CancellationToken,
    ) -> Result<WatchStream, ClientError> {
        let client =
            DaemonClient::from_registry(&self.registry, &self.daemon)?.with_options(self.options);
        debug!(daemon = %self.daemon, task_id, "opening watch");
        client.watch_with(task_id, self.capacity, cancel).await
    }
}
