pub mod backend;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod labels;
pub mod local;
pub mod metadata;
pub mod reconciler;
pub mod state;
pub mod types;

pub use backend::TaskWatcher;
#[cfg(feature = "daemon")]
pub use daemon::DaemonWatcher;
pub use labels::{is_fallback_label, prettify_identifier, LabelCatalog, LabelPriority};
pub use local::LocalWatcher;
pub use metadata::{parse_task_metadata, submission_metadata, MetadataParser, SubmissionLabels, TaskMetadata};
pub use reconciler::Reconciler;
pub use state::CallState;
pub use types::*;
