//! Request/response operations against one daemon's task store.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::protocol::{ProcessInfo, Request, RequestType, Response, TaskMetrics};
use crate::registry::{DaemonConfig, DaemonRegistry};
use crate::task::{AsyncTask, TaskFilter};
use crate::transport::{effective_timeout, Connection, Endpoint};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_TASK_LINE_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_STREAM_LINE_BYTES: usize = 64 * 1024 * 1024;
pub const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_ORIGIN: &str = "tui";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    /// Bounds connecting plus the auth handshake.
    pub connect_timeout: Duration,
    /// Line cap for process, metrics and lifecycle exchanges.
    pub max_line_bytes: usize,
    /// Line cap for task submit/get/list/delete replies, which carry tool
    /// output of arbitrary size.
    pub max_task_line_bytes: usize,
    pub max_stream_line_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_task_line_bytes: DEFAULT_MAX_TASK_LINE_BYTES,
            max_stream_line_bytes: DEFAULT_MAX_STREAM_LINE_BYTES,
        }
    }
}

/// Scope of a delete request. Exactly one key is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteScope {
    Task(String),
    Session(String),
    Call(String),
}

impl DeleteScope {
    fn key(&self) -> &str {
        match self {
            DeleteScope::Task(k) | DeleteScope::Session(k) | DeleteScope::Call(k) => k.trim(),
        }
    }

    fn to_request(&self) -> Request {
        let mut req = Request::new(RequestType::ToolDelete);
        let key = self.key().to_string();
        match self {
            DeleteScope::Task(_) => req.task_id = key,
            DeleteScope::Session(_) => req.session_id = key,
            DeleteScope::Call(_) => req.call_id = key,
        }
        req
    }
}

/// Parameters for `tool_submit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitRequest {
    pub tool_name: String,
    pub tool_args: String,
    pub working_dir: String,
    pub session_id: String,
    pub call_id: String,
    pub origin: String,
    pub client_id: String,
    pub mode: String,
    pub agent_name: String,
    pub command: String,
    pub command_args: String,
}

impl SubmitRequest {
    pub fn new(tool_name: impl Into<String>, tool_args: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_args: tool_args.into(),
            ..Self::default()
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn call(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = agent.into();
        self
    }

    pub fn command(mut self, command: impl Into<String>, args: impl Into<String>) -> Self {
        self.command = command.into();
        self.command_args = args.into();
        self
    }

    fn into_request(self) -> Result<Request> {
        let tool_name = self.tool_name.trim().to_string();
        if tool_name.is_empty() {
            return Err(ClientError::InvalidRequest("tool name is required"));
        }
        let session_id = self.session_id.trim().to_string();
        let mut origin = self.origin.trim().to_string();
        if origin.is_empty() {
            origin = DEFAULT_ORIGIN.to_string();
        }
        let mut client_id = self.client_id.trim().to_string();
        if client_id.is_empty() {
            client_id = session_id.clone();
        }
        let tool_args = if self.tool_args.trim().is_empty() {
            "{}".to_string()
        } else {
            self.tool_args
        };

        let mut req = Request::new(RequestType::ToolSubmit);
        req.tool_name = tool_name;
        req.tool_args = tool_args;
        req.working_dir = self.working_dir.trim().to_string();
        req.session_id = session_id;
        req.call_id = self.call_id.trim().to_string();
        req.origin = origin;
        req.client_id = client_id;
        req.mode = self.mode.trim().to_string();
        req.agent_name = self.agent_name.trim().to_string();
        req.command = self.command.trim().to_string();
        req.command_args = self.command_args;
        Ok(req)
    }
}

/// Client bound to one named daemon. Every call opens a fresh connection.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    name: String,
    endpoint: Endpoint,
    auth_token: String,
    options: ClientOptions,
    deadline: Option<Instant>,
}

impl DaemonClient {
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            endpoint: Endpoint::parse(&config.address)?,
            auth_token: config.auth_token.clone(),
            options: ClientOptions::default(),
            deadline: None,
        })
    }

    /// Look up `name` in the registry; disabled daemons are refused.
    pub fn from_registry(registry: &DaemonRegistry, name: &str) -> Result<Self> {
        let config = registry
            .get(name)
            .ok_or_else(|| ClientError::UnknownDaemon(name.to_string()))?;
        if !config.enabled {
            return Err(ClientError::DaemonDisabled(name.to_string()));
        }
        Self::new(config)
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Bound every subsequent call by an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        effective_timeout(self.deadline, self.options.request_timeout)
    }

    pub(crate) async fn connect(&self, max_line: usize) -> Result<Connection> {
        let connect_timeout =
            effective_timeout(self.deadline, self.options.connect_timeout).min(self.options.connect_timeout);
        Connection::open(&self.endpoint, &self.auth_token, connect_timeout, max_line).await
    }

    async fn request(&self, request: &Request) -> Result<Response> {
        self.request_within(request, self.options.max_line_bytes).await
    }

    async fn task_request(&self, request: &Request) -> Result<Response> {
        self.request_within(request, self.options.max_task_line_bytes)
            .await
    }

    async fn request_within(&self, request: &Request, max_line: usize) -> Result<Response> {
        let mut conn = self.connect(max_line).await?;
        let response = conn.round_trip(request, self.request_timeout()).await;
        conn.close().await;
        response
    }

    /// Processes supervised by this daemon.
    pub async fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
        let resp = self
            .request(&Request::new(RequestType::List))
            .await?
            .into_result("unknown error")?;
        Ok(resp.processes)
    }

    pub async fn submit(&self, submit: SubmitRequest) -> Result<AsyncTask> {
        let request = submit.into_request()?;
        let resp = self
            .task_request(&request)
            .await?
            .into_result("unknown error")?;
        let wire = resp.task.ok_or(ClientError::MissingPayload("task"))?;
        let task = AsyncTask::try_from(wire)?;
        info!(daemon = %self.name, task_id = %task.id, tool = %task.tool_name, status = %task.status, "async task submitted");
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<AsyncTask> {
        let id = task_id.trim();
        if id.is_empty() {
            return Err(ClientError::InvalidRequest("task id is required"));
        }
        let resp = self
            .task_request(&Request::with_task(RequestType::ToolGet, id))
            .await?
            .into_result("task not found")?;
        let wire = resp.task.ok_or(ClientError::MissingPayload("task"))?;
        AsyncTask::try_from(wire)
    }

    pub async fn list(&self) -> Result<Vec<AsyncTask>> {
        let resp = self
            .task_request(&Request::new(RequestType::ToolList))
            .await?
            .into_result("unknown error")?;
        resp.tasks.into_iter().map(AsyncTask::try_from).collect()
    }

    pub async fn list_filtered(&self, filter: &TaskFilter) -> Result<Vec<AsyncTask>> {
        Ok(filter.apply(self.list().await?))
    }

    /// Delete by one scope. A blank key is a no-op.
    pub async fn delete(&self, scope: DeleteScope) -> Result<()> {
        if scope.key().is_empty() {
            return Ok(());
        }
        self.task_request(&scope.to_request())
            .await?
            .into_result("unknown error")?;
        debug!(daemon = %self.name, ?scope, "async tasks deleted");
        Ok(())
    }

    pub async fn metrics(&self) -> Result<TaskMetrics> {
        let resp = self
            .request(&Request::new(RequestType::ToolMetrics))
            .await?
            .into_result("failed to fetch metrics")?;
        resp.metrics.ok_or(ClientError::MissingPayload("metrics"))
    }

    /// Notify an agent of a lifecycle change. Best effort: errors are logged
    /// and dropped, and the whole exchange is capped at two seconds.
    pub async fn send_lifecycle_event(&self, agent_name: &str, kind: &str, data: Value) {
        let mut request = Request::new(RequestType::LifecycleEvent);
        request.agent_name = agent_name.trim().to_string();
        request.lifecycle_type = kind.trim().to_string();
        request.lifecycle_data = Some(data);

        let budget = self.request_timeout().min(LIFECYCLE_TIMEOUT);
        let client = self.clone().with_deadline(Instant::now() + budget);
        match tokio::time::timeout(budget, client.request(&request)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                debug!(daemon = %self.name, agent = %agent_name, error = %err, "lifecycle event dropped")
            }
            Err(_) => debug!(daemon = %self.name, agent = %agent_name, "lifecycle event timed out"),
        }
    }
}
