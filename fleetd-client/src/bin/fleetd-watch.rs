//! fleetd-watch
//!
//! Small operator tool: locate an agent, list tasks, or follow one task.
//!
//!   fleetd-watch locate <agent>
//!   fleetd-watch tasks [daemon]
//!   fleetd-watch watch <task-id> [daemon]

use anyhow::{bail, Context, Result};
use fleetd_client::{
    sort_recent_first, DaemonClient, DaemonRegistry, Locator, TaskEventKind, LOCAL_DAEMON,
};
use std::env;
use std::io;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: fleetd-watch <locate <agent> | tasks [daemon] | watch <task-id> [daemon]>";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let registry = DaemonRegistry::load().context("loading daemon registry")?;

    match args.first().map(String::as_str) {
        Some("locate") => {
            let agent = args.get(1).context(USAGE)?;
            let daemon = Locator::new(registry)
                .locate(agent)
                .await
                .with_context(|| format!("locating agent {agent}"))?;
            println!("{daemon}");
        }
        Some("tasks") => {
            let daemon = args.get(1).map(String::as_str);
            let client = client_for(&registry, daemon)?;
            let mut tasks = client.list().await.context("listing tasks")?;
            sort_recent_first(&mut tasks);
            for task in tasks {
                println!("{}\t{}\t{}", task.id, task.status, task.tool_name);
            }
        }
        Some("watch") => {
            let task_id = args.get(1).context(USAGE)?;
            let client = client_for(&registry, args.get(2).map(String::as_str))?;
            let mut stream = client
                .watch(task_id)
                .await
                .with_context(|| format!("watching task {task_id}"))?;
            info!(task_id = %task_id, daemon = %client.name(), "watching");
            while let Some(event) = stream.recv().await {
                if let Some(line) = event.progress.as_ref().and_then(|p| p.display_line()) {
                    println!("{line}");
                }
                match &event.kind {
                    TaskEventKind::Completed => {
                        let result = event.task.as_ref().map(|t| t.result.trim()).unwrap_or("");
                        if !result.is_empty() {
                            println!("{result}");
                        }
                        println!("completed");
                    }
                    TaskEventKind::Failed => {
                        let task_error = event.task.as_ref().map(|t| t.error.trim()).unwrap_or("");
                        let message = [event.error.as_str(), task_error]
                            .into_iter()
                            .find(|m| !m.is_empty())
                            .unwrap_or("failed");
                        println!("failed: {message}");
                    }
                    TaskEventKind::Deleted => {
                        let message = if event.error.is_empty() {
                            "task deleted"
                        } else {
                            event.error.as_str()
                        };
                        println!("{message}");
                    }
                    _ => {}
                }
            }
            if stream.dropped_events() > 0 {
                info!(dropped = stream.dropped_events(), "some progress events were dropped");
            }
        }
        _ => bail!(USAGE),
    }
    Ok(())
}

fn client_for(registry: &DaemonRegistry, daemon: Option<&str>) -> Result<DaemonClient> {
    let name = daemon.unwrap_or(LOCAL_DAEMON);
    DaemonClient::from_registry(registry, name).with_context(|| format!("daemon {name}"))
}
