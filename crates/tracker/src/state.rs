use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use fleetd_client::{AsyncTask, AsyncTaskProgress, TaskEvent, TaskEventKind};

use crate::labels::{LabelCatalog, LabelPriority};
use crate::metadata::{normalize_lines, MetadataParser};
use crate::types::DEFAULT_LABEL;

#[derive(Debug, Default)]
struct CallInner {
    task_id: Option<String>,
    session_id: Option<String>,
    label: String,
    priority: LabelPriority,
    lines: VecDeque<String>,
    watching: bool,
    done: bool,
    cancel: Option<CancellationToken>,
    cleanup_scheduled: bool,
}

/// Reconciled state of one tool call.
///
/// All fields sit behind the call's own mutex; the owning map is never
/// locked while a call is mutated.
#[derive(Debug)]
pub struct CallState {
    call_id: String,
    capacity: usize,
    inner: Mutex<CallInner>,
}

impl CallState {
    pub fn new(call_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            call_id: call_id.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(CallInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn task_id(&self) -> Option<String> {
        self.lock().task_id.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    pub fn label_priority(&self) -> LabelPriority {
        self.lock().priority
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    pub fn is_watching(&self) -> bool {
        self.lock().watching
    }

    /// Eligible for eviction: finished and no watcher running.
    pub fn is_disposable(&self) -> bool {
        let inner = self.lock();
        inner.done && !inner.watching
    }

    /// First non-blank id wins; later ones are ignored.
    pub fn set_task_id(&self, task_id: &str) -> bool {
        let trimmed = task_id.trim();
        if trimmed.is_empty() {
            return false;
        }
        let mut inner = self.lock();
        if inner.task_id.is_some() {
            return false;
        }
        inner.task_id = Some(trimmed.to_string());
        drop(inner);
        debug!(call_id = %self.call_id, task_id = %trimmed, "task id bound");
        true
    }

    pub fn set_session_id(&self, session_id: &str) {
        let trimmed = session_id.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.session_id.is_none() {
            inner.session_id = Some(trimmed.to_string());
        }
    }

    /// Apply a label candidate under the tier rules:
    /// a higher tier always wins; an equal tier only fills an empty label,
    /// except `External`, which may correct itself.
    pub fn update_label(&self, candidate: &str, priority: LabelPriority) -> bool {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            return false;
        }
        let mut inner = self.lock();
        let replace = priority > inner.priority
            || (priority == inner.priority
                && (inner.label.trim().is_empty()
                    || (priority == LabelPriority::External
                        && !inner.label.eq_ignore_ascii_case(trimmed))));
        if !replace {
            return false;
        }
        let previous = std::mem::replace(&mut inner.label, trimmed.to_string());
        let previous_priority = std::mem::replace(&mut inner.priority, priority);
        drop(inner);
        debug!(
            call_id = %self.call_id,
            previous = %previous,
            label = %trimmed,
            ?previous_priority,
            ?priority,
            "label updated"
        );
        true
    }

    /// Seed lines only if none are held yet.
    pub fn ensure_initial<S: AsRef<str>>(&self, lines: &[S]) {
        let normalized = normalize_lines(lines.iter().map(|l| l.as_ref()), self.capacity);
        if normalized.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.lines.is_empty() {
            inner.lines = normalized.into();
            debug!(call_id = %self.call_id, lines = inner.lines.len(), "initial progress seeded");
        }
    }

    /// Replace the buffer wholesale. Blank input leaves it untouched.
    pub fn replace_lines<S: AsRef<str>>(&self, lines: &[S]) {
        let normalized = normalize_lines(lines.iter().map(|l| l.as_ref()), self.capacity);
        if normalized.is_empty() {
            return;
        }
        let count = normalized.len();
        self.lock().lines = normalized.into();
        debug!(call_id = %self.call_id, lines = count, "progress snapshot adopted");
    }

    /// Append one line, skipping a repeat of the last line and dropping the
    /// oldest past capacity.
    pub fn append_line(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        let mut inner = self.lock();
        if inner.lines.back().map(String::as_str) == Some(trimmed) {
            drop(inner);
            debug!(call_id = %self.call_id, line = %trimmed, "duplicate line dropped");
            return false;
        }
        inner.lines.push_back(trimmed.to_string());
        while inner.lines.len() > self.capacity {
            inner.lines.pop_front();
        }
        let total = inner.lines.len();
        drop(inner);
        debug!(call_id = %self.call_id, line = %trimmed, total, "line appended");
        true
    }

    /// Claim the watcher slot. Returns the task id and a fresh token when a
    /// watcher should start: task id known, not done, none running.
    pub fn begin_watch(&self) -> Option<(String, CancellationToken)> {
        let mut inner = self.lock();
        if inner.done || inner.watching {
            return None;
        }
        let task_id = inner.task_id.clone()?;
        let token = CancellationToken::new();
        inner.cancel = Some(token.clone());
        inner.watching = true;
        Some((task_id, token))
    }

    /// Release the watcher slot. Returns `true` when the caller must
    /// schedule cleanup.
    pub fn finish_watch(&self) -> bool {
        let mut inner = self.lock();
        inner.watching = false;
        inner.cancel = None;
        claim_cleanup(&mut inner)
    }

    /// Terminal transition. Cancels the watcher token exactly once and
    /// returns `true` when the caller must schedule cleanup; repeated calls
    /// return `false`.
    pub fn mark_done(&self) -> bool {
        let mut inner = self.lock();
        let first = !inner.done;
        inner.done = true;
        let cancel = inner.cancel.take();
        let schedule = claim_cleanup(&mut inner);
        drop(inner);
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if first {
            debug!(call_id = %self.call_id, "call marked done");
        }
        schedule
    }

    /// Cancel a running watcher without finishing the call.
    pub fn cancel_watch(&self) {
        let cancel = self.lock().cancel.take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Label (or the default) and a copy of the lines.
    pub fn snapshot(&self) -> (String, Vec<String>) {
        let inner = self.lock();
        let label = if inner.label.trim().is_empty() {
            DEFAULT_LABEL.to_string()
        } else {
            inner.label.clone()
        };
        (label, inner.lines.iter().cloned().collect())
    }

    /// Fold one watch event into the state. Returns `true` for terminal
    /// events; marking the call done is left to the caller.
    pub fn apply_event(&self, event: &TaskEvent, catalog: &LabelCatalog) -> bool {
        match &event.kind {
            TaskEventKind::Snapshot => {
                if let Some(task) = &event.task {
                    self.update_from_task(task, catalog);
                    if !task.progress.is_empty() {
                        let lines: Vec<String> = task
                            .progress
                            .iter()
                            .filter_map(AsyncTaskProgress::display_line)
                            .collect();
                        self.replace_lines(&lines);
                    }
                }
                false
            }
            TaskEventKind::Progress | TaskEventKind::Other(_) => {
                if let Some(task) = &event.task {
                    self.update_from_task(task, catalog);
                }
                if let Some(line) = event.progress.as_ref().and_then(|p| p.display_line()) {
                    self.append_line(&line);
                }
                false
            }
            TaskEventKind::Completed => {
                if let Some(task) = &event.task {
                    self.update_from_task(task, catalog);
                    self.append_line(&task.result);
                }
                self.append_line("completed");
                true
            }
            TaskEventKind::Failed => {
                if let Some(task) = &event.task {
                    self.update_from_task(task, catalog);
                }
                let task_error = event.task.as_ref().map(|t| t.error.trim()).unwrap_or("");
                let message = [event.error.trim(), task_error]
                    .into_iter()
                    .find(|m| !m.is_empty())
                    .unwrap_or("failed");
                self.append_line(&format!("failed: {message}"));
                true
            }
            TaskEventKind::Deleted => {
                let message = event.error.trim();
                self.append_line(if message.is_empty() {
                    "task deleted"
                } else {
                    message
                });
                true
            }
        }
    }

    /// Refresh label context from a task: its command or tool name at the
    /// fallback tier, a label in its metadata at the metadata tier.
    pub fn update_from_task(&self, task: &AsyncTask, catalog: &LabelCatalog) {
        let name = [task.command_name.trim(), task.tool_name.trim()]
            .into_iter()
            .find(|n| !n.is_empty());
        if let Some(name) = name {
            self.update_label(&catalog.prettify_name(name), LabelPriority::Fallback);
        }
        if !task.metadata.trim().is_empty() {
            if let Some(label) = MetadataParser::new().label_from(&task.metadata) {
                self.update_label(&label, LabelPriority::Metadata);
            }
        }
    }
}

fn claim_cleanup(inner: &mut CallInner) -> bool {
    if inner.done && !inner.watching && !inner.cleanup_scheduled {
        inner.cleanup_scheduled = true;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_PROGRESS_LINES;

    fn state() -> CallState {
        CallState::new("call-1", MAX_PROGRESS_LINES)
    }

    #[test]
    fn keeps_last_ten_of_fifteen() {
        let s = state();
        for i in 0..15 {
            assert!(s.append_line(&format!("line {i}")));
        }
        let (_, lines) = s.snapshot();
        let expected: Vec<String> = (5..15).map(|i| format!("line {i}")).collect();
        assert_eq!(lines, expected);
    }

    #[test]
    fn suppresses_only_consecutive_duplicates() {
        let s = state();
        assert!(s.append_line("same"));
        assert!(!s.append_line(" same "));
        assert_eq!(s.snapshot().1, vec!["same"]);
        assert!(s.append_line("other"));
        assert!(s.append_line("same"));
        assert_eq!(s.snapshot().1, vec!["same", "other", "same"]);
    }

    #[test]
    fn label_tiers_are_monotonic() {
        let s = state();
        assert!(s.update_label("Run Tests", LabelPriority::Metadata));
        assert!(!s.update_label("Bash", LabelPriority::Fallback));
        assert!(!s.update_label("Other Metadata", LabelPriority::Metadata));
        assert_eq!(s.snapshot().0, "Run Tests");
        assert!(s.update_label("From Snapshot", LabelPriority::External));
        assert_eq!(s.label_priority(), LabelPriority::External);
    }

    #[test]
    fn external_label_may_correct_itself() {
        let s = state();
        assert!(s.update_label("Frist", LabelPriority::External));
        assert!(!s.update_label("FRIST", LabelPriority::External));
        assert!(s.update_label("First", LabelPriority::External));
        assert_eq!(s.snapshot().0, "First");
    }

    #[test]
    fn same_tier_fills_empty_only() {
        let s = state();
        assert_eq!(s.snapshot().0, DEFAULT_LABEL);
        assert!(s.update_label("Bash", LabelPriority::Fallback));
        assert!(!s.update_label("Shell", LabelPriority::Fallback));
        assert!(!s.update_label("   ", LabelPriority::External));
        assert_eq!(s.snapshot().0, "Bash");
    }

    #[test]
    fn first_task_id_wins() {
        let s = state();
        assert!(!s.set_task_id("  "));
        assert!(s.set_task_id("t-1"));
        assert!(!s.set_task_id("t-2"));
        assert_eq!(s.task_id().as_deref(), Some("t-1"));
    }

    #[test]
    fn terminal_transition_is_idempotent() {
        let s = state();
        s.set_task_id("t");
        let (_, token) = s.begin_watch().unwrap();
        assert!(s.begin_watch().is_none());

        assert!(!s.mark_done(), "watcher still running");
        assert!(token.is_cancelled());
        assert!(!s.mark_done());
        assert!(s.finish_watch(), "cleanup scheduled once watcher exits");
        assert!(!s.finish_watch());
        assert!(!s.mark_done());
        assert!(s.is_disposable());
    }

    #[test]
    fn done_without_watcher_schedules_immediately() {
        let s = state();
        assert!(s.mark_done());
        assert!(!s.mark_done());
        s.set_task_id("t");
        assert!(s.begin_watch().is_none());
    }

    #[test]
    fn watcher_needs_task_id() {
        let s = state();
        assert!(s.begin_watch().is_none());
        s.set_task_id("t");
        assert!(s.begin_watch().is_some());
    }

    #[test]
    fn initial_lines_do_not_override() {
        let s = state();
        s.ensure_initial(&["a", "b"]);
        s.ensure_initial(&["c"]);
        assert_eq!(s.snapshot().1, vec!["a", "b"]);
        s.replace_lines(&["x"]);
        assert_eq!(s.snapshot().1, vec!["x"]);
        s.replace_lines::<&str>(&[]);
        assert_eq!(s.snapshot().1, vec!["x"]);
    }

    #[test]
    fn events_fold_into_lines() {
        let catalog = LabelCatalog::new();
        let s = state();
        let progress = AsyncTaskProgress {
            text: "50%".into(),
            status: "running".into(),
            ..Default::default()
        };
        let task = AsyncTask {
            tool_name: "run_tests".into(),
            result: "all green".into(),
            ..Default::default()
        };
        assert!(!s.apply_event(
            &TaskEvent::new(TaskEventKind::Progress).with_progress(progress.clone()),
            &catalog
        ));
        assert!(!s.apply_event(
            &TaskEvent::new(TaskEventKind::Other("heartbeat".into())).with_progress(AsyncTaskProgress {
                text: "tick".into(),
                ..Default::default()
            }),
            &catalog
        ));
        assert!(s.apply_event(
            &TaskEvent::new(TaskEventKind::Completed).with_task(task),
            &catalog
        ));
        let (label, lines) = s.snapshot();
        assert_eq!(label, "Run Tests");
        assert_eq!(lines, vec!["running — 50%", "tick", "all green", "completed"]);
    }

    #[test]
    fn failure_message_precedence() {
        let catalog = LabelCatalog::new();
        let s = state();
        let task = AsyncTask {
            error: "exit 2".into(),
            ..Default::default()
        };
        s.apply_event(&TaskEvent::new(TaskEventKind::Failed).with_task(task.clone()), &catalog);
        s.apply_event(
            &TaskEvent::new(TaskEventKind::Failed)
                .with_task(task)
                .with_error("oom"),
            &catalog,
        );
        s.apply_event(&TaskEvent::new(TaskEventKind::Failed), &catalog);
        s.apply_event(&TaskEvent::new(TaskEventKind::Deleted), &catalog);
        assert_eq!(
            s.snapshot().1,
            vec!["failed: exit 2", "failed: oom", "failed: failed", "task deleted"]
        );
    }

    #[test]
    fn snapshot_event_adopts_progress_and_metadata_label() {
        let catalog = LabelCatalog::new();
        let s = state();
        s.append_line("stale");
        let task = AsyncTask {
            tool_name: "bash".into(),
            metadata: r#"{"progress_label":"Nightly Build"}"#.into(),
            progress: vec![
                AsyncTaskProgress {
                    text: "one".into(),
                    ..Default::default()
                },
                AsyncTaskProgress {
                    status: "two".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(!s.apply_event(&TaskEvent::new(TaskEventKind::Snapshot).with_task(task), &catalog));
        let (label, lines) = s.snapshot();
        assert_eq!(label, "Nightly Build");
        assert_eq!(lines, vec!["one", "two"]);
    }
}
