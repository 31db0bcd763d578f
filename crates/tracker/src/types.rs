use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use fleetd_client::LOCAL_DAEMON;

pub const MAX_PROGRESS_LINES: usize = 10;
pub const CLEANUP_DELAY: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_EVENT_CAPACITY: usize = 32;
pub const DEFAULT_LABEL: &str = "Async";
pub const ASYNC_TOOL_NAME: &str = "daemon_async";

/// A tool invocation as seen by the conversation layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub finished: bool,
}

/// The result attached to a [`ToolCall`]; `metadata` usually carries the
/// async task reference produced at submit time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub tool_call_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn of(call: &ToolCall, result: &ToolResult) -> Self {
        if result.is_error {
            CallStatus::Failed
        } else if call.finished {
            CallStatus::Completed
        } else {
            CallStatus::Running
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "Pending",
            CallStatus::Running => "Running",
            CallStatus::Completed => "Completed",
            CallStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only projection handed to renderers. Recomputed on every read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ViewModel {
    pub label: String,
    pub status: CallStatus,
    pub lines: Vec<String>,
    pub show_spinner: bool,
}

impl ViewModel {
    pub fn pending() -> Self {
        Self {
            label: DEFAULT_LABEL.to_string(),
            status: CallStatus::Pending,
            lines: Vec::new(),
            show_spinner: false,
        }
    }

    /// `"<label> - <status>"`
    pub fn summary(&self) -> String {
        format!("{} - {}", self.label, self.status)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    pub progress_capacity: usize,
    /// Delay between a call becoming disposable and its eviction.
    pub cleanup_delay: Duration,
    pub event_capacity: usize,
    /// Registry name of the daemon watches are opened against.
    pub daemon: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            progress_capacity: MAX_PROGRESS_LINES,
            cleanup_delay: CLEANUP_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            daemon: LOCAL_DAEMON.to_string(),
        }
    }
}

impl TrackerConfig {
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    pub fn with_daemon(mut self, daemon: impl Into<String>) -> Self {
        self.daemon = daemon.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_precedence() {
        let mut call = ToolCall::default();
        let mut result = ToolResult::default();
        assert_eq!(CallStatus::of(&call, &result), CallStatus::Running);
        call.finished = true;
        assert_eq!(CallStatus::of(&call, &result), CallStatus::Completed);
        result.is_error = true;
        assert_eq!(CallStatus::of(&call, &result), CallStatus::Failed);
    }

    #[test]
    fn pending_summary() {
        assert_eq!(ViewModel::pending().summary(), "Async - Pending");
    }
}
