use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fleetd_client::{ClientError, WatchStream};

/// Source of watch streams for the reconciler.
///
/// Implementations open a stream for `task_id` bound to `cancel`: cancelling
/// the token must end the stream and release whatever it holds.
#[async_trait]
pub trait TaskWatcher: Send + Sync {
    async fn watch(
        &self,
        task_id: &str,
        cancel: CancellationToken,
    ) -> Result<WatchStream, ClientError>;
}
