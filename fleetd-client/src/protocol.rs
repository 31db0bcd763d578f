//! Wire messages exchanged with a daemon, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    List,
    ToolSubmit,
    ToolGet,
    ToolList,
    ToolDelete,
    ToolWatch,
    ToolMetrics,
    LifecycleEvent,
}

/// A request line. Empty string fields are left off the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_args: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_args: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lifecycle_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_data: Option<Value>,
}

impl Request {
    pub fn new(kind: RequestType) -> Self {
        Self {
            kind,
            agent_name: String::new(),
            command: String::new(),
            tool_name: String::new(),
            tool_args: String::new(),
            task_id: String::new(),
            working_dir: String::new(),
            session_id: String::new(),
            call_id: String::new(),
            mode: String::new(),
            command_args: String::new(),
            origin: String::new(),
            client_id: String::new(),
            lifecycle_type: String::new(),
            lifecycle_data: None,
        }
    }

    pub fn with_task(kind: RequestType, task_id: &str) -> Self {
        let mut req = Self::new(kind);
        req.task_id = task_id.to_string();
        req
    }

    /// Serialise as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).map_err(|source| ClientError::Decode {
            context: "request",
            source,
        })?;
        line.push('\n');
        Ok(line)
    }
}

/// Generic `{success, error?, ...payload}` envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ProcessInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<WireTask>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<WireTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TaskMetrics>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            ..Self::default()
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|source| ClientError::Decode {
            context: "response",
            source,
        })
    }

    /// Turn `success: false` into [`ClientError::Daemon`].
    pub fn into_result(self, fallback: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(ClientError::daemon(&self.error, fallback))
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self).map_err(|source| ClientError::Decode {
            context: "response",
            source,
        })?;
        line.push('\n');
        Ok(line)
    }
}

/// Task as carried on the wire. Timestamps stay as RFC3339 strings here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_args: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<WireProgress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireProgress {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// One line of a watch stream after the ack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<WireTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<WireProgress>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Entry of a daemon's process list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub restart_count: i64,
    /// Seconds.
    #[serde(default)]
    pub uptime: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    #[serde(default)]
    pub submitted: i64,
    #[serde(default)]
    pub in_flight: i64,
    #[serde(default)]
    pub completed: i64,
    #[serde(default)]
    pub failed: i64,
    #[serde(default)]
    pub queue_depth: i64,
    #[serde(default)]
    pub worker_count: i64,
}
