//! Extraction of task id, label and progress lines from loosely shaped JSON
//! metadata attached to tool calls and results.
//!
//! Each field is resolved by an ordered chain of extractors: direct keys on
//! the object, keys on a known nested object, then a nested JSON document
//! stored as a string, recursively. Every extractor accepts any input shape
//! and yields nothing on a mismatch.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use fleetd_client::AsyncTask;

use crate::labels::LabelCatalog;
use crate::types::MAX_PROGRESS_LINES;

pub type Object = Map<String, Value>;

/// Bound on re-encoded nesting.
const MAX_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy)]
enum Step {
    Direct(&'static [&'static str]),
    Nested {
        key: &'static str,
        fields: &'static [&'static str],
    },
    Reencoded(&'static str),
}

const TASK_ID_CHAIN: &[Step] = &[
    Step::Direct(&["async_task_id", "task_id", "id"]),
    Step::Nested {
        key: "async_task",
        fields: &["id"],
    },
    Step::Nested {
        key: "task",
        fields: &["id"],
    },
    Step::Reencoded("async_task_metadata"),
    Step::Reencoded("metadata"),
];

const LABEL_CHAIN: &[Step] = &[
    Step::Direct(&[
        "progress_label",
        "async_task_label",
        "label",
        "command_label",
        "title",
        "name",
    ]),
    Step::Nested {
        key: "async_task",
        fields: &["label", "command_label", "title", "name"],
    },
    Step::Nested {
        key: "async_context",
        fields: &["label", "title", "name"],
    },
    Step::Reencoded("async_task_metadata"),
];

/// Everything recoverable from one metadata blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskMetadata {
    pub task_id: Option<String>,
    pub label: Option<String>,
    pub progress: Vec<String>,
}

pub fn parse_task_metadata(raw: &str) -> TaskMetadata {
    let mut parser = MetadataParser::new();
    match parser.parse(raw) {
        Some(data) => TaskMetadata {
            task_id: parser.task_id(&data),
            label: parser.label(&data),
            progress: parser.progress_lines(&data),
        },
        None => TaskMetadata::default(),
    }
}

/// Object either borrowed from the caller or shared from the cache.
enum Nested<'a> {
    Borrowed(&'a Object),
    Cached(Arc<Object>),
}

impl Deref for Nested<'_> {
    type Target = Object;

    fn deref(&self) -> &Object {
        match self {
            Nested::Borrowed(obj) => obj,
            Nested::Cached(obj) => obj,
        }
    }
}

/// Parser with a per-instance cache: identical raw strings are decoded once.
#[derive(Debug, Default)]
pub struct MetadataParser {
    cache: HashMap<String, Option<Arc<Object>>>,
}

impl MetadataParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `raw` as a JSON object. Blank, invalid or non-object input
    /// yields `None`; failures are cached too.
    pub fn parse(&mut self, raw: &str) -> Option<Arc<Object>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Some(cached) = self.cache.get(trimmed) {
            return cached.clone();
        }
        let parsed = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(obj)) => Some(Arc::new(obj)),
            _ => None,
        };
        self.cache.insert(trimmed.to_string(), parsed.clone());
        parsed
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn task_id(&mut self, data: &Object) -> Option<String> {
        self.run_chain(TASK_ID_CHAIN, data, 0)
    }

    pub fn label(&mut self, data: &Object) -> Option<String> {
        self.run_chain(LABEL_CHAIN, data, 0)
    }

    pub fn progress_lines(&mut self, data: &Object) -> Vec<String> {
        normalize_lines(self.collect_lines(data, 0), MAX_PROGRESS_LINES)
    }

    pub fn task_id_from(&mut self, raw: &str) -> Option<String> {
        let data = self.parse(raw)?;
        self.task_id(&data)
    }

    pub fn label_from(&mut self, raw: &str) -> Option<String> {
        let data = self.parse(raw)?;
        self.label(&data)
    }

    pub fn progress_from(&mut self, raw: &str) -> Vec<String> {
        match self.parse(raw) {
            Some(data) => self.progress_lines(&data),
            None => Vec::new(),
        }
    }

    fn run_chain(&mut self, chain: &[Step], data: &Object, depth: usize) -> Option<String> {
        if depth > MAX_DEPTH {
            return None;
        }
        for step in chain {
            let found = match *step {
                Step::Direct(keys) => string_field(data, keys),
                Step::Nested { key, fields } => self
                    .nested_object(data, key)
                    .and_then(|nested| string_field(&nested, fields)),
                Step::Reencoded(key) => match lookup_insensitive(data, key) {
                    Some(Value::String(raw)) => self
                        .parse(raw)
                        .and_then(|nested| self.run_chain(chain, &nested, depth + 1)),
                    _ => None,
                },
            };
            if found.is_some() {
                return found;
            }
        }
        None
    }

    fn nested_object<'a>(&mut self, data: &'a Object, key: &str) -> Option<Nested<'a>> {
        match lookup_insensitive(data, key)? {
            Value::Object(obj) if !obj.is_empty() => Some(Nested::Borrowed(obj)),
            Value::String(raw) => self.parse(raw).map(Nested::Cached),
            _ => None,
        }
    }

    fn collect_lines(&mut self, data: &Object, depth: usize) -> Vec<String> {
        if depth > MAX_DEPTH {
            return Vec::new();
        }
        let mut lines = match lookup_insensitive(data, "progress") {
            Some(value) => self.progress_value(value, depth),
            None => Vec::new(),
        };
        if let Some(Value::String(raw)) = lookup_insensitive(data, "async_task_metadata") {
            if let Some(nested) = self.parse(raw) {
                lines.extend(self.collect_lines(&nested, depth + 1));
            }
        }
        lines
    }

    fn progress_value(&mut self, value: &Value, depth: usize) -> Vec<String> {
        match value {
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_object().and_then(format_progress_map))
                .collect(),
            Value::Object(obj) => format_progress_map(obj).into_iter().collect(),
            Value::String(raw) => match self.parse(raw) {
                Some(nested) => self.collect_lines(&nested, depth + 1),
                None => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        Vec::new()
                    } else {
                        vec![trimmed.to_string()]
                    }
                }
            },
            _ => Vec::new(),
        }
    }
}

/// Exact key first, then a case-insensitive match.
pub fn lookup_insensitive<'a>(data: &'a Object, key: &str) -> Option<&'a Value> {
    if let Some(value) = data.get(key) {
        return Some(value);
    }
    let wanted = key.trim().to_lowercase();
    data.iter()
        .find(|(k, _)| k.trim().to_lowercase() == wanted)
        .map(|(_, v)| v)
}

/// Scalar rendered as trimmed text. Arrays, objects and null have none.
pub fn string_from_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn string_field(data: &Object, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| lookup_insensitive(data, key))
        .find_map(string_from_value)
}

fn format_progress_map(entry: &Object) -> Option<String> {
    let text = string_field(entry, &["text", "message"]);
    let status = string_field(entry, &["status"]);
    match (status, text) {
        (Some(status), Some(text)) => Some(format!("{status} — {text}")),
        (None, Some(text)) => Some(text),
        (Some(status), None) => Some(status),
        (None, None) => None,
    }
}

/// Trim, drop blanks and keep the last `cap` lines.
pub fn normalize_lines<I, S>(lines: I, cap: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = lines
        .into_iter()
        .filter_map(|line| {
            let trimmed = line.as_ref().trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect();
    if out.len() > cap {
        out.drain(..out.len() - cap);
    }
    out
}

/// Labels known at submit time, used to build the result metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmissionLabels {
    pub tool: String,
    pub command: String,
    pub command_label: String,
    pub progress_label: String,
    pub agent: String,
}

/// Metadata blob attached to the tool result of a submitted task, shaped so
/// that [`MetadataParser`] later recovers the task id and label from it.
pub fn submission_metadata(
    task: &AsyncTask,
    labels: &SubmissionLabels,
    catalog: &LabelCatalog,
) -> Value {
    let mut meta = json!({
        "async_task": {
            "id": task.id,
            "status": task.status,
            "tool": task.tool_name,
            "session_id": task.session_id,
            "call_id": task.call_id,
        }
    });

    let mut context = Object::new();
    let command = labels.command.trim();
    let agent = labels.agent.trim();
    let label = [
        labels.command_label.trim(),
        labels.progress_label.trim(),
        command,
        labels.tool.trim(),
    ]
    .into_iter()
    .find(|s| !s.is_empty());
    if let Some(label) = label {
        context.insert("label".into(), Value::String(catalog.prettify_name(label)));
    }
    if !command.is_empty() {
        context.insert("title".into(), Value::String(catalog.prettify_name(command)));
    }
    if !agent.is_empty() {
        context.insert("name".into(), Value::String(agent.to_string()));
        context.insert("subtitle".into(), Value::String(agent.to_string()));
    }
    if !context.is_empty() {
        if let Some(obj) = meta.as_object_mut() {
            obj.insert("async_context".into(), Value::Object(context.clone()));
            obj.insert("context".into(), Value::Object(context));
        }
    }
    meta
}
