//! fleetd client library
//!
//! Talks to fleetd process-supervisor daemons over newline-delimited JSON:
//! registry loading, transport with optional token handshake, the async
//! task API, watch streams and agent location across the fleet.

pub mod client;
pub mod error;
pub mod locator;
pub mod protocol;
pub mod registry;
pub mod task;
pub mod transport;
pub mod watch;

pub use client::{ClientOptions, DaemonClient, DeleteScope, SubmitRequest};
pub use error::{ClientError, Result};
pub use locator::{LocateError, Locator};
pub use protocol::{ProcessInfo, TaskMetrics};
pub use registry::{DaemonConfig, DaemonRegistry, RegistryError, LOCAL_DAEMON};
pub use task::{
    is_terminal_status, sort_recent_first, AsyncTask, AsyncTaskProgress, TaskEvent,
    TaskEventKind, TaskFilter,
};
pub use watch::{EventSink, WatchPhase, WatchStream};
