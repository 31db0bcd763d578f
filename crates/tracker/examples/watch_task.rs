//! Submit a tool to the local daemon and render its reconciled progress
//! until it finishes.
//!
//! cargo run -p fleetd-tracker --example watch_task -- <tool> [args-json]

use std::time::Duration;

use anyhow::{Context, Result};
use fleetd_client::{DaemonClient, DaemonRegistry, SubmitRequest};
use fleetd_tracker::{
    submission_metadata, CallStatus, LabelCatalog, Reconciler, SubmissionLabels, ToolCall,
    ToolResult, TrackerConfig,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let tool = args.next().context("usage: watch_task <tool> [args-json]")?;
    let tool_args = args.next().unwrap_or_else(|| "{}".to_string());

    let registry = DaemonRegistry::load().context("loading daemon registry")?;
    let config = TrackerConfig::default();
    let client = DaemonClient::from_registry(&registry, &config.daemon)
        .with_context(|| format!("resolving daemon '{}'", config.daemon))?;

    let call_id = "example-call";
    let task = client
        .submit(
            SubmitRequest::new(tool.clone(), tool_args.clone())
                .session("example-session")
                .call(call_id),
        )
        .await
        .context("submitting task")?;

    let catalog = LabelCatalog::new();
    let metadata = submission_metadata(
        &task,
        &SubmissionLabels {
            tool: tool.clone(),
            ..Default::default()
        },
        &catalog,
    );
    let reconciler = Reconciler::for_daemon(registry, catalog, config);

    let mut call = ToolCall {
        id: call_id.to_string(),
        name: tool,
        input: tool_args,
        session_id: "example-session".to_string(),
        ..Default::default()
    };
    let mut result = ToolResult {
        tool_call_id: call_id.to_string(),
        metadata: metadata.to_string(),
        ..Default::default()
    };

    let mut last_line: Option<String> = None;
    loop {
        let view = reconciler.view_model(&call, &result);
        let start = last_line
            .as_ref()
            .and_then(|last| view.lines.iter().rposition(|line| line == last))
            .map_or(0, |i| i + 1);
        for line in &view.lines[start..] {
            println!("  {line}");
        }
        if let Some(line) = view.lines.last() {
            last_line = Some(line.clone());
        }
        if view.status != CallStatus::Running {
            println!("{}", view.summary());
            break;
        }

        let state = reconciler.state(call_id).context("call state evicted")?;
        if state.is_done() {
            let task = client.get(&task.id).await.context("fetching final task")?;
            call.finished = true;
            result.is_error = task.status.eq_ignore_ascii_case("failed");
            result.content = task.result;
            continue;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    reconciler.shutdown();
    Ok(())
}
