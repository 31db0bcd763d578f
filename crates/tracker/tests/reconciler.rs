use std::sync::Arc;
use std::time::Duration;

use fleetd_client::{AsyncTask, AsyncTaskProgress, TaskEvent, TaskEventKind};
use fleetd_tracker::{
    CallStatus, LabelCatalog, LabelPriority, LocalWatcher, Reconciler, ToolCall, ToolResult,
    TrackerConfig,
};
use serde_json::json;

fn reconciler(watcher: &LocalWatcher, cleanup: Duration) -> Reconciler {
    Reconciler::with_parts(
        Arc::new(watcher.clone()),
        LabelCatalog::new(),
        TrackerConfig::default().with_cleanup_delay(cleanup),
    )
}

fn submitted(call_id: &str, task_id: &str) -> (ToolCall, ToolResult) {
    let call = ToolCall {
        id: call_id.to_string(),
        name: "run_tests".to_string(),
        session_id: "sess-1".to_string(),
        ..Default::default()
    };
    let result = ToolResult {
        tool_call_id: call_id.to_string(),
        name: "run_tests".to_string(),
        metadata: json!({"async_task": {"id": task_id, "status": "pending"}}).to_string(),
        ..Default::default()
    };
    (call, result)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn progress(text: &str) -> TaskEvent {
    TaskEvent::new(TaskEventKind::Progress).with_progress(AsyncTaskProgress {
        text: text.to_string(),
        ..Default::default()
    })
}

#[tokio::test]
async fn call_without_id_is_pending() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let view = r.view_model(&ToolCall::default(), &ToolResult::default());
    assert_eq!(view.label, "Async");
    assert_eq!(view.status, CallStatus::Pending);
    assert!(r.is_empty());
}

#[tokio::test]
async fn completed_flow_reaches_final_lines() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (call, result) = submitted("call-1", "task-1");

    let view = r.view_model(&call, &result);
    assert_eq!(view.label, "Run Tests");
    assert_eq!(view.status, CallStatus::Running);
    assert!(view.show_spinner);
    eventually(|| watcher.subscriber_count("task-1") == 1).await;

    watcher.publish("task-1", progress("step 1")).await;
    watcher.publish("task-1", progress("step 1")).await;
    watcher.publish("task-1", progress("step 2")).await;
    let done = AsyncTask {
        id: "task-1".into(),
        status: "completed".into(),
        result: "42 passed".into(),
        ..Default::default()
    };
    watcher
        .publish("task-1", TaskEvent::new(TaskEventKind::Completed).with_task(done))
        .await;

    let state = r.state("call-1").unwrap();
    eventually(|| state.is_disposable()).await;
    assert_eq!(
        r.view_model(&call, &result).lines,
        vec!["step 1", "step 2", "42 passed", "completed"]
    );
    assert_eq!(watcher.subscriber_count("task-1"), 0);
}

#[tokio::test]
async fn failed_and_deleted_events_end_the_watch() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));

    let (call, result) = submitted("call-f", "task-f");
    r.view_model(&call, &result);
    eventually(|| watcher.subscriber_count("task-f") == 1).await;
    watcher
        .publish("task-f", TaskEvent::new(TaskEventKind::Failed).with_error("exit status 1"))
        .await;

    let (call_d, result_d) = submitted("call-d", "task-d");
    r.view_model(&call_d, &result_d);
    eventually(|| watcher.subscriber_count("task-d") == 1).await;
    watcher
        .publish("task-d", TaskEvent::new(TaskEventKind::Deleted))
        .await;

    let failed = r.state("call-f").unwrap();
    let deleted = r.state("call-d").unwrap();
    eventually(|| failed.is_disposable() && deleted.is_disposable()).await;
    assert_eq!(failed.snapshot().1, vec!["failed: exit status 1"]);
    assert_eq!(deleted.snapshot().1, vec!["task deleted"]);
}

#[tokio::test]
async fn open_failure_becomes_a_progress_line() {
    let watcher = LocalWatcher::default();
    watcher.reject("task-x", "no such task");
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (call, result) = submitted("call-x", "task-x");

    r.view_model(&call, &result);
    let state = r.state("call-x").unwrap();
    eventually(|| !state.is_watching() && !state.snapshot().1.is_empty()).await;
    assert_eq!(
        state.snapshot().1,
        vec!["error opening async stream: no such task"]
    );
    assert!(!state.is_done());
}

#[tokio::test]
async fn finished_calls_are_evicted_after_the_delay() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_millis(200));
    let (call, result) = submitted("call-c", "task-c");

    r.view_model(&call, &result);
    eventually(|| watcher.subscriber_count("task-c") == 1).await;
    watcher
        .publish("task-c", TaskEvent::new(TaskEventKind::Completed))
        .await;

    let state = r.state("call-c").unwrap();
    eventually(|| state.is_disposable()).await;
    assert_eq!(r.len(), 1, "final state stays readable until the delay passes");
    eventually(|| r.is_empty()).await;
}

#[tokio::test]
async fn finished_call_never_starts_a_watcher() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (mut call, result) = submitted("call-n", "task-n");
    call.finished = true;

    let view = r.view_model(&call, &result);
    assert_eq!(view.status, CallStatus::Completed);
    assert!(!view.show_spinner);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(watcher.subscriber_count("task-n"), 0);
    assert!(r.state("call-n").unwrap().is_done());
}

#[tokio::test]
async fn cancel_session_stops_its_watchers_only() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (call_a, result_a) = submitted("call-a", "task-a");
    let (mut call_b, result_b) = submitted("call-b", "task-b");
    call_b.session_id = "sess-2".into();

    r.view_model(&call_a, &result_a);
    r.view_model(&call_b, &result_b);
    eventually(|| watcher.subscriber_count("task-a") == 1 && watcher.subscriber_count("task-b") == 1)
        .await;

    assert_eq!(r.cancel_session("sess-1"), 1);
    eventually(|| watcher.subscriber_count("task-a") == 0).await;
    assert_eq!(watcher.subscriber_count("task-b"), 1);
    assert!(r.state("call-a").unwrap().is_done());
    assert!(!r.state("call-b").unwrap().is_done());

    r.shutdown();
    eventually(|| watcher.subscriber_count("task-b") == 0).await;
}

#[tokio::test]
async fn external_snapshot_overrides_metadata_label() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (call, mut result) = submitted("call-s", "task-s");
    result.metadata = json!({
        "async_task": {"id": "task-s"},
        "async_context": {"label": "Nightly Build"}
    })
    .to_string();

    assert_eq!(r.view_model(&call, &result).label, "Nightly Build");
    r.update_snapshot("call-s", "Release Build", &["packaging".to_string()], false);
    let view = r.view_model(&call, &result);
    assert_eq!(view.label, "Release Build");
    assert_eq!(view.lines, vec!["packaging"]);
    assert_eq!(
        r.state("call-s").unwrap().label_priority(),
        LabelPriority::External
    );
}

#[tokio::test]
async fn definition_label_replaces_generic_async_name() {
    let watcher = LocalWatcher::default();
    let r = Reconciler::with_parts(
        Arc::new(watcher.clone()),
        LabelCatalog::new().with("daemon_async", "Background Job"),
        TrackerConfig::default(),
    );
    let call = ToolCall {
        id: "call-g".into(),
        name: "daemon_async".into(),
        ..Default::default()
    };
    let view = r.view_model(&call, &ToolResult::default());
    assert_eq!(view.label, "Background Job");
}

#[tokio::test]
async fn initial_progress_comes_from_result_metadata() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (call, mut result) = submitted("call-p", "task-p");
    result.metadata = json!({
        "async_task": {"id": "task-p"},
        "progress": [{"status": "queued", "text": "waiting for worker"}]
    })
    .to_string();

    let view = r.view_model(&call, &result);
    assert_eq!(view.lines, vec!["queued — waiting for worker"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_renders_share_one_state_and_watcher() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (call, result) = submitted("call-m", "task-m");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let (r, call, result) = (r.clone(), call.clone(), result.clone());
            tokio::spawn(async move { r.view_model(&call, &result) })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().label, "Run Tests");
    }

    assert_eq!(r.len(), 1);
    eventually(|| watcher.subscriber_count("task-m") == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(watcher.subscriber_count("task-m"), 1);
}

#[test]
fn built_outside_a_runtime_uses_the_callers_runtime() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    let (call, result) = submitted("call-rt", "task-rt");

    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        r.view_model(&call, &result);
        eventually(|| watcher.subscriber_count("task-rt") == 1).await;
    });
    assert!(r.state("call-rt").unwrap().is_watching());
}

#[test]
fn explicit_runtime_serves_renders_from_plain_threads() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let watcher = LocalWatcher::default();
    let r = Reconciler::with_runtime(
        Arc::new(watcher.clone()),
        LabelCatalog::new(),
        TrackerConfig::default(),
        runtime.handle().clone(),
    );
    let (call, result) = submitted("call-h", "task-h");

    std::thread::spawn({
        let r = r.clone();
        move || r.view_model(&call, &result)
    })
    .join()
    .unwrap();
    runtime.block_on(eventually(|| watcher.subscriber_count("task-h") == 1));
}

#[test]
fn missing_runtime_is_reported_and_cleanup_still_happens() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::ZERO);

    let (call, result) = submitted("call-none", "task-none");
    let view = r.view_model(&call, &result);
    assert_eq!(view.lines, vec!["async progress unavailable: no tokio runtime"]);
    let state = r.state("call-none").unwrap();
    assert!(!state.is_watching());

    let (mut done, done_result) = submitted("call-done", "task-done");
    done.finished = true;
    r.view_model(&done, &done_result);
    assert!(r.state("call-done").is_some());

    r.view_model(&call, &result);
    assert!(r.state("call-done").is_none());
    assert!(r.state("call-none").is_some());
}

#[tokio::test]
async fn no_watcher_starts_after_shutdown() {
    let watcher = LocalWatcher::default();
    let r = reconciler(&watcher, Duration::from_secs(60));
    r.shutdown();

    let (call, result) = submitted("call-late", "task-late");
    r.view_model(&call, &result);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(watcher.subscriber_count("task-late"), 0);
    assert!(!r.state("call-late").unwrap().is_watching());
}
