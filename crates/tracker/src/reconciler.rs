//! Per-call reconciliation of tool results, watch events and external
//! snapshots into a renderable view model.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::TaskWatcher;
use crate::labels::{LabelCatalog, LabelPriority};
use crate::metadata::MetadataParser;
use crate::state::CallState;
use crate::types::{CallStatus, ToolCall, ToolResult, TrackerConfig, ViewModel};

const NO_RUNTIME_LINE: &str = "async progress unavailable: no tokio runtime";

struct Shared {
    states: RwLock<HashMap<String, Arc<CallState>>>,
    watcher: Arc<dyn TaskWatcher>,
    catalog: LabelCatalog,
    config: TrackerConfig,
    runtime: Option<Handle>,
    closed: AtomicBool,
    /// Evictions due without a runtime to sleep on; swept on access.
    deferred: Mutex<Vec<Deferred>>,
}

struct Deferred {
    due: Instant,
    call_id: String,
    target: Weak<CallState>,
}

/// Owns every [`CallState`] of one client session.
///
/// Cheap to clone; clones share the same map. The map lock is only taken to
/// look up, create or evict a state; everything else goes through the
/// state's own lock.
#[derive(Clone)]
pub struct Reconciler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("calls", &self.len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Reconciler {
    pub fn new(watcher: Arc<dyn TaskWatcher>) -> Self {
        Self::with_parts(watcher, LabelCatalog::default(), TrackerConfig::default())
    }

    /// Watchers and cleanup sweeps are spawned on the runtime current at
    /// construction, or else on the one current when they are needed.
    pub fn with_parts(
        watcher: Arc<dyn TaskWatcher>,
        catalog: LabelCatalog,
        config: TrackerConfig,
    ) -> Self {
        Self::build(watcher, catalog, config, Handle::try_current().ok())
    }

    /// Reconciler watching tasks on the daemon named in `config`.
    #[cfg(feature = "daemon")]
    pub fn for_daemon(
        registry: fleetd_client::DaemonRegistry,
        catalog: LabelCatalog,
        config: TrackerConfig,
    ) -> Self {
        let watcher = crate::daemon::DaemonWatcher::from_config(registry, &config);
        Self::with_parts(Arc::new(watcher), catalog, config)
    }

    /// Like [`Reconciler::with_parts`], spawning on `runtime` regardless of
    /// where the reconciler is used from.
    pub fn with_runtime(
        watcher: Arc<dyn TaskWatcher>,
        catalog: LabelCatalog,
        config: TrackerConfig,
        runtime: Handle,
    ) -> Self {
        Self::build(watcher, catalog, config, Some(runtime))
    }

    fn build(
        watcher: Arc<dyn TaskWatcher>,
        catalog: LabelCatalog,
        config: TrackerConfig,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                states: RwLock::new(HashMap::new()),
                watcher,
                catalog,
                config,
                runtime,
                closed: AtomicBool::new(false),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    /// Project a call into its view model, folding in whatever the call and
    /// its result carry and starting a watcher when a task id is known.
    pub fn view_model(&self, call: &ToolCall, result: &ToolResult) -> ViewModel {
        let Some(state) = self.ensure_state(call, result) else {
            return ViewModel::pending();
        };
        let (label, lines) = state.snapshot();
        let label = self.shared.catalog.prefer_definition_label(&label, call, result);
        let status = CallStatus::of(call, result);
        debug!(
            call_id = %state.call_id(),
            label = %label,
            status = %status,
            lines = lines.len(),
            "view model"
        );
        ViewModel {
            label,
            status,
            lines,
            show_spinner: !call.finished && !result.is_error,
        }
    }

    /// Out-of-band update: the label is applied at the external tier and
    /// non-empty `lines` replace the buffer.
    pub fn update_snapshot(&self, call_id: &str, label: &str, lines: &[String], finished: bool) {
        let Some(state) = self.get_or_create(call_id) else {
            return;
        };
        state.update_label(label, LabelPriority::External);
        state.replace_lines(lines);
        if finished && state.mark_done() {
            self.schedule_cleanup(&state);
        }
    }

    /// Finish every call of `session_id`, stopping their watchers. Returns
    /// how many calls were affected.
    pub fn cancel_session(&self, session_id: &str) -> usize {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return 0;
        }
        let matching: Vec<Arc<CallState>> = self
            .read_states()
            .values()
            .filter(|state| state.session_id().as_deref() == Some(session_id))
            .cloned()
            .collect();
        for state in &matching {
            if state.mark_done() {
                self.schedule_cleanup(state);
            }
        }
        info!(session_id, calls = matching.len(), "session cancelled");
        matching.len()
    }

    /// Stop every watcher; no new watcher starts afterwards.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let states: Vec<Arc<CallState>> = self.read_states().values().cloned().collect();
        for state in &states {
            state.cancel_watch();
        }
        info!(calls = states.len(), "reconciler shut down");
    }

    pub fn len(&self) -> usize {
        self.read_states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_states().is_empty()
    }

    pub fn state(&self, call_id: &str) -> Option<Arc<CallState>> {
        self.read_states().get(call_id.trim()).cloned()
    }

    fn read_states(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CallState>>> {
        self.shared
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_states(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<CallState>>> {
        self.shared
            .states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The configured runtime, else the one the caller runs on.
    fn runtime(&self) -> Option<Handle> {
        self.shared
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    fn ensure_state(&self, call: &ToolCall, result: &ToolResult) -> Option<Arc<CallState>> {
        self.sweep_deferred();
        let call_id = [call.id.trim(), result.tool_call_id.trim()]
            .into_iter()
            .find(|id| !id.is_empty())?;
        let state = self.get_or_create(call_id)?;
        self.process_call_result(&state, call, result);
        Some(state)
    }

    fn get_or_create(&self, call_id: &str) -> Option<Arc<CallState>> {
        let id = call_id.trim();
        if id.is_empty() {
            return None;
        }
        if let Some(state) = self.read_states().get(id) {
            return Some(state.clone());
        }

        let mut states = self.write_states();
        let state = states
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(call_id = %id, "call state created");
                Arc::new(CallState::new(id, self.shared.config.progress_capacity))
            })
            .clone();
        Some(state)
    }

    fn process_call_result(&self, state: &Arc<CallState>, call: &ToolCall, result: &ToolResult) {
        let mut parser = MetadataParser::new();

        let task_id = [&result.metadata, &call.input, &call.reason]
            .into_iter()
            .find_map(|raw| parser.task_id_from(raw));
        if let Some(task_id) = &task_id {
            state.set_task_id(task_id);
        }
        state.set_session_id(&call.session_id);

        let labelled = [&result.metadata, &call.input]
            .into_iter()
            .find_map(|raw| parser.label_from(raw));
        match labelled {
            Some(label) => {
                state.update_label(&label, LabelPriority::Metadata);
            }
            None => {
                let name = [result.name.trim(), call.name.trim()]
                    .into_iter()
                    .find(|name| !name.is_empty());
                if let Some(name) = name {
                    state.update_label(&self.shared.catalog.prettify_name(name), LabelPriority::Fallback);
                }
            }
        }

        let lines = parser.progress_from(&result.metadata);
        if !lines.is_empty() {
            state.ensure_initial(&lines);
        }

        if (call.finished || result.is_error) && state.mark_done() {
            self.schedule_cleanup(state);
        }
        self.maybe_start_watcher(state);
    }

    fn maybe_start_watcher(&self, state: &Arc<CallState>) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        let Some((task_id, cancel)) = state.begin_watch() else {
            return;
        };
        // Shutdown may have swept the states between the check above and
        // the claim; release the slot instead of starting a late watcher.
        if self.shared.closed.load(Ordering::Acquire) {
            state.cancel_watch();
            if state.finish_watch() {
                self.schedule_cleanup(state);
            }
            return;
        }
        let Some(runtime) = self.runtime() else {
            warn!(call_id = %state.call_id(), task_id = %task_id, "no tokio runtime, watcher not started");
            state.append_line(NO_RUNTIME_LINE);
            if state.finish_watch() {
                self.schedule_cleanup(state);
            }
            return;
        };
        info!(call_id = %state.call_id(), task_id = %task_id, "watcher started");
        runtime.spawn(self.clone().run_watcher(state.clone(), task_id, cancel));
    }

    async fn run_watcher(self, state: Arc<CallState>, task_id: String, cancel: CancellationToken) {
        match self.shared.watcher.watch(&task_id, cancel.clone()).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    biased;
                    event = stream.recv() => {
                        let Some(event) = event else { break };
                        if state.apply_event(&event, &self.shared.catalog) {
                            if state.mark_done() {
                                self.schedule_cleanup(&state);
                            }
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            },
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                warn!(call_id = %state.call_id(), task_id = %task_id, error = %err, "failed to open watch");
                state.append_line(&format!("error opening async stream: {err}"));
            }
        }
        info!(call_id = %state.call_id(), task_id = %task_id, "watcher finished");
        if state.finish_watch() {
            self.schedule_cleanup(&state);
        }
    }

    /// Evict `state` once the cleanup delay has passed, if it is still
    /// disposable and still the entry for its call id.
    fn schedule_cleanup(&self, state: &Arc<CallState>) {
        let Some(runtime) = self.runtime() else {
            warn!(call_id = %state.call_id(), "no tokio runtime, cleanup deferred to next access");
            self.shared
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Deferred {
                    due: Instant::now() + self.shared.config.cleanup_delay,
                    call_id: state.call_id().to_string(),
                    target: Arc::downgrade(state),
                });
            return;
        };
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let target = Arc::downgrade(state);
        let call_id = state.call_id().to_string();
        let delay = self.shared.config.cleanup_delay;
        debug!(call_id = %call_id, ?delay, "cleanup scheduled");
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut states = shared.states.write().unwrap_or_else(PoisonError::into_inner);
            evict_if_current(&mut states, &call_id, &target);
        });
    }

    /// Run deferred evictions whose delay has passed.
    fn sweep_deferred(&self) {
        let due: Vec<Deferred> = {
            let mut deferred = self
                .shared
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if deferred.is_empty() {
                return;
            }
            let now = Instant::now();
            let (due, pending): (Vec<Deferred>, Vec<Deferred>) = std::mem::take(&mut *deferred)
                .into_iter()
                .partition(|d| d.due <= now);
            *deferred = pending;
            due
        };
        if due.is_empty() {
            return;
        }
        let mut states = self.write_states();
        for entry in &due {
            evict_if_current(&mut states, &entry.call_id, &entry.target);
        }
    }
}

/// Remove `call_id` if it still maps to `target` and is disposable.
fn evict_if_current(
    states: &mut HashMap<String, Arc<CallState>>,
    call_id: &str,
    target: &Weak<CallState>,
) {
    let evict = states.get(call_id).is_some_and(|current| {
        target.upgrade().is_some_and(|t| Arc::ptr_eq(current, &t)) && current.is_disposable()
    });
    if evict {
        states.remove(call_id);
        debug!(call_id, "call state evicted");
    }
}
