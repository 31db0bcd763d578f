//! Domain model for async tasks and the decoder from wire form.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{ClientError, Result};
use crate::protocol::{WireEvent, WireProgress, WireTask};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_DELETED: &str = "deleted";

/// Statuses after which a task no longer changes.
pub fn is_terminal_status(status: &str) -> bool {
    let status = status.trim();
    ["completed", "complete", "failed", "deleted"]
        .iter()
        .any(|s| status.eq_ignore_ascii_case(s))
}

/// A background task held by a daemon.
///
/// `created_at`/`updated_at` use the Unix epoch (`DateTime::default()`) as
/// the zero value when the daemon sent no timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsyncTask {
    pub id: String,
    pub tool_name: String,
    pub args: String,
    pub working_dir: String,
    pub session_id: String,
    pub call_id: String,
    pub origin: String,
    pub client_id: String,
    pub mode: String,
    pub agent_name: String,
    pub command_name: String,
    pub command_args: String,
    pub status: String,
    pub result: String,
    pub metadata: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Vec<AsyncTaskProgress>,
}

impl AsyncTask {
    pub fn is_terminal(&self) -> bool {
        is_terminal_status(&self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsyncTaskProgress {
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub metadata: String,
    pub status: String,
}

impl AsyncTaskProgress {
    /// Render as a single display line: `"<status> — <text>"`, whichever of
    /// the two is present, or the timestamp when both are blank.
    pub fn display_line(&self) -> Option<String> {
        let text = self.text.trim();
        let status = self.status.trim();
        match (status.is_empty(), text.is_empty()) {
            (false, false) => Some(format!("{status} — {text}")),
            (true, false) => Some(text.to_string()),
            (false, true) => Some(status.to_string()),
            (true, true) if !is_zero(&self.timestamp) => Some(
                self.timestamp
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            (true, true) => None,
        }
    }
}

pub(crate) fn is_zero(ts: &DateTime<Utc>) -> bool {
    *ts == DateTime::<Utc>::default()
}

/// RFC3339 with nanosecond precision; the zero value encodes as `""`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    if is_zero(ts) {
        return String::new();
    }
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC3339 timestamp; blank input yields the zero value.
pub fn parse_timestamp(value: &str, field: &'static str) -> Result<DateTime<Utc>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(DateTime::<Utc>::default());
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| ClientError::Timestamp { field, source })
}

impl TryFrom<WireTask> for AsyncTask {
    type Error = ClientError;

    fn try_from(raw: WireTask) -> Result<Self> {
        let created_at = parse_timestamp(&raw.created_at, "created_at")?;
        let updated_at = parse_timestamp(&raw.updated_at, "updated_at")?;
        let completed_at = if raw.completed_at.trim().is_empty() {
            None
        } else {
            Some(parse_timestamp(&raw.completed_at, "completed_at")?)
        };
        Ok(AsyncTask {
            id: raw.id.trim().to_string(),
            tool_name: raw.tool_name.trim().to_string(),
            args: raw.args,
            working_dir: raw.working_dir.trim().to_string(),
            session_id: raw.session_id.trim().to_string(),
            call_id: raw.call_id.trim().to_string(),
            origin: raw.origin.trim().to_string(),
            client_id: raw.client_id.trim().to_string(),
            mode: raw.mode.trim().to_string(),
            agent_name: raw.agent_name.trim().to_string(),
            command_name: raw.command_name.trim().to_string(),
            command_args: raw.command_args.trim().to_string(),
            status: raw.status.trim().to_string(),
            result: raw.result,
            metadata: raw.metadata,
            error: raw.error,
            created_at,
            updated_at,
            completed_at,
            progress: raw.progress.into_iter().map(AsyncTaskProgress::from).collect(),
        })
    }
}

/// Progress timestamps are advisory: an unparseable one becomes the zero value.
impl From<WireProgress> for AsyncTaskProgress {
    fn from(raw: WireProgress) -> Self {
        AsyncTaskProgress {
            timestamp: parse_timestamp(&raw.timestamp, "timestamp").unwrap_or_default(),
            text: raw.text.trim().to_string(),
            metadata: raw.metadata.trim().to_string(),
            status: raw.status.trim().to_string(),
        }
    }
}

impl From<&AsyncTaskProgress> for WireProgress {
    fn from(progress: &AsyncTaskProgress) -> Self {
        WireProgress {
            timestamp: format_timestamp(&progress.timestamp),
            text: progress.text.clone(),
            metadata: progress.metadata.clone(),
            status: progress.status.clone(),
        }
    }
}

impl From<&AsyncTask> for WireTask {
    fn from(task: &AsyncTask) -> Self {
        WireTask {
            id: task.id.clone(),
            tool_name: task.tool_name.clone(),
            args: task.args.clone(),
            working_dir: task.working_dir.clone(),
            session_id: task.session_id.clone(),
            call_id: task.call_id.clone(),
            mode: task.mode.clone(),
            agent_name: task.agent_name.clone(),
            command_name: task.command_name.clone(),
            command_args: task.command_args.clone(),
            origin: task.origin.clone(),
            client_id: task.client_id.clone(),
            status: task.status.clone(),
            result: task.result.clone(),
            metadata: task.metadata.clone(),
            error: task.error.clone(),
            created_at: format_timestamp(&task.created_at),
            updated_at: format_timestamp(&task.updated_at),
            completed_at: task
                .completed_at
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_default(),
            progress: task.progress.iter().map(WireProgress::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEventKind {
    Snapshot,
    Progress,
    Completed,
    Failed,
    Deleted,
    /// Unrecognised type, handled like `Progress`.
    Other(String),
}

impl TaskEventKind {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "snapshot" => TaskEventKind::Snapshot,
            "progress" => TaskEventKind::Progress,
            "completed" => TaskEventKind::Completed,
            "failed" => TaskEventKind::Failed,
            "deleted" => TaskEventKind::Deleted,
            _ => TaskEventKind::Other(trimmed.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEventKind::Completed | TaskEventKind::Failed | TaskEventKind::Deleted
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskEventKind::Snapshot => "snapshot",
            TaskEventKind::Progress => "progress",
            TaskEventKind::Completed => "completed",
            TaskEventKind::Failed => "failed",
            TaskEventKind::Deleted => "deleted",
            TaskEventKind::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub task: Option<AsyncTask>,
    pub progress: Option<AsyncTaskProgress>,
    pub error: String,
}

impl TaskEvent {
    pub fn new(kind: TaskEventKind) -> Self {
        Self {
            kind,
            task: None,
            progress: None,
            error: String::new(),
        }
    }

    pub fn with_task(mut self, task: AsyncTask) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_progress(mut self, progress: AsyncTaskProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// Decode one stream line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let wire: WireEvent = serde_json::from_str(line).map_err(|source| ClientError::Decode {
            context: "task event",
            source,
        })?;
        TaskEvent::try_from(wire)
    }
}

impl TryFrom<WireEvent> for TaskEvent {
    type Error = ClientError;

    fn try_from(raw: WireEvent) -> Result<Self> {
        Ok(TaskEvent {
            kind: TaskEventKind::parse(&raw.kind),
            task: raw.task.map(AsyncTask::try_from).transpose()?,
            progress: raw.progress.map(AsyncTaskProgress::from),
            error: raw.error.trim().to_string(),
        })
    }
}

impl From<&TaskEvent> for WireEvent {
    fn from(event: &TaskEvent) -> Self {
        WireEvent {
            kind: event.kind.as_str().to_string(),
            task: event.task.as_ref().map(WireTask::from),
            progress: event.progress.as_ref().map(WireProgress::from),
            error: event.error.clone(),
        }
    }
}

/// Client-side selection over a task listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub origin: Option<String>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &AsyncTask) -> bool {
        fn eq_ci(want: &Option<String>, have: &str) -> bool {
            want.as_deref()
                .map(|w| w.trim().eq_ignore_ascii_case(have.trim()))
                .unwrap_or(true)
        }
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map(|w| w.trim() == have.trim()).unwrap_or(true)
        }
        eq_ci(&self.status, &task.status)
            && eq_ci(&self.origin, &task.origin)
            && eq(&self.session_id, &task.session_id)
            && eq(&self.client_id, &task.client_id)
    }

    pub fn apply(&self, tasks: Vec<AsyncTask>) -> Vec<AsyncTask> {
        tasks.into_iter().filter(|t| self.matches(t)).collect()
    }
}

/// Most recently updated first; equal timestamps ordered by id.
pub fn sort_recent_first(tasks: &mut [AsyncTask]) {
    tasks.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_task() -> AsyncTask {
        let created = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        AsyncTask {
            id: "task-1".into(),
            tool_name: "sleep".into(),
            args: r#"{"seconds":1}"#.into(),
            status: STATUS_COMPLETED.into(),
            result: "done".into(),
            created_at: created,
            updated_at: created + chrono::Duration::nanoseconds(1),
            completed_at: Some(created + chrono::Duration::nanoseconds(7)),
            progress: vec![AsyncTaskProgress {
                timestamp: created,
                text: "halfway".into(),
                status: "running".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn wire_round_trip_keeps_nanoseconds() {
        let task = sample_task();
        let wire = WireTask::from(&task);
        assert!(wire.created_at.ends_with(".123456789Z"));
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireTask = serde_json::from_str(&json).unwrap();
        let decoded = AsyncTask::try_from(back).unwrap();
        assert_eq!(decoded, task);
        assert!(decoded.completed_at.is_some());
    }

    #[test]
    fn non_terminal_task_has_no_completion() {
        let mut task = sample_task();
        task.status = STATUS_RUNNING.into();
        task.completed_at = None;
        let decoded = AsyncTask::try_from(WireTask::from(&task)).unwrap();
        assert!(decoded.completed_at.is_none());
        assert!(!decoded.is_terminal());
    }

    #[test]
    fn blank_timestamps_decode_to_zero() {
        let wire = WireTask {
            id: " t ".into(),
            status: "pending".into(),
            ..Default::default()
        };
        let task = AsyncTask::try_from(wire).unwrap();
        assert_eq!(task.id, "t");
        assert_eq!(task.created_at, DateTime::<Utc>::default());
        assert_eq!(format_timestamp(&task.created_at), "");
    }

    #[test]
    fn invalid_created_at_is_rejected() {
        let wire = WireTask {
            created_at: "yesterday".into(),
            ..Default::default()
        };
        match AsyncTask::try_from(wire) {
            Err(ClientError::Timestamp { field, .. }) => assert_eq!(field, "created_at"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_progress_timestamp_is_tolerated() {
        let progress = AsyncTaskProgress::from(WireProgress {
            timestamp: "garbage".into(),
            text: " step ".into(),
            ..Default::default()
        });
        assert_eq!(progress.timestamp, DateTime::<Utc>::default());
        assert_eq!(progress.text, "step");
    }

    #[test]
    fn event_kinds() {
        assert_eq!(TaskEventKind::parse(""), TaskEventKind::Snapshot);
        assert_eq!(TaskEventKind::parse("Completed"), TaskEventKind::Completed);
        assert_eq!(
            TaskEventKind::parse("heartbeat"),
            TaskEventKind::Other("heartbeat".into())
        );
        assert!(TaskEventKind::Deleted.is_terminal());
        assert!(!TaskEventKind::Progress.is_terminal());
    }

    #[test]
    fn parse_line_decodes_progress_event() {
        let event = TaskEvent::parse_line(
            r#"{"type":"progress","progress":{"timestamp":"2024-05-01T10:00:00.000000001Z","text":"50%","status":"running"}}"#,
        )
        .unwrap();
        assert_eq!(event.kind, TaskEventKind::Progress);
        let progress = event.progress.unwrap();
        assert_eq!(progress.display_line().as_deref(), Some("running — 50%"));
        assert_eq!(progress.timestamp.timestamp_subsec_nanos(), 1);
    }

    #[test]
    fn display_line_variants() {
        let mut p = AsyncTaskProgress::default();
        assert_eq!(p.display_line(), None);
        p.timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(
            p.display_line().as_deref(),
            Some("2023-11-14T22:13:20Z")
        );
        p.status = "queued".into();
        assert_eq!(p.display_line().as_deref(), Some("queued"));
        p.status.clear();
        p.text = "hello".into();
        assert_eq!(p.display_line().as_deref(), Some("hello"));
    }

    #[test]
    fn filter_and_sort() {
        let t = |id: &str, secs: i64, status: &str, origin: &str| AsyncTask {
            id: id.into(),
            status: status.into(),
            origin: origin.into(),
            updated_at: Utc.timestamp_opt(secs, 0).unwrap(),
            ..Default::default()
        };
        let mut tasks = vec![
            t("b", 10, "running", "tui"),
            t("a", 10, "Running", "cli"),
            t("c", 20, "completed", "tui"),
        ];
        sort_recent_first(&mut tasks);
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);

        let filter = TaskFilter {
            status: Some("RUNNING".into()),
            origin: Some("TUI".into()),
            ..Default::default()
        };
        let kept = filter.apply(tasks);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "b");
    }

    #[test]
    fn terminal_statuses() {
        assert!(is_terminal_status("complete"));
        assert!(is_terminal_status(" FAILED "));
        assert!(!is_terminal_status("pending"));
    }
}
