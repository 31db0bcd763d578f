//! Label tiers, prettifying and the tool definition catalog.

use std::collections::HashMap;

use crate::types::{ToolCall, ToolResult, ASYNC_TOOL_NAME, DEFAULT_LABEL};

/// Where a label came from. Higher tiers win.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LabelPriority {
    #[default]
    None,
    /// Derived from a tool or command name.
    Fallback,
    /// Extracted from structured metadata.
    Metadata,
    /// Pushed through the snapshot API.
    External,
}

/// `"run_tests"` -> `"Run Tests"`.
pub fn prettify_identifier(name: &str) -> String {
    name.replace('_', " ")
        .split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Names that only say "this is async": `async`, `async_*`, the async tool.
pub fn is_generic_async_name(name: &str) -> bool {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    lowered == ASYNC_TOOL_NAME || lowered == "async" || lowered.starts_with("async_")
}

/// Display labels registered for known tool names. Lookups ignore case.
#[derive(Clone, Debug, Default)]
pub struct LabelCatalog {
    labels: HashMap<String, String>,
}

impl LabelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, label: &str) -> Self {
        self.insert(name, label);
        self
    }

    pub fn insert(&mut self, name: &str, label: &str) {
        let key = name.trim().to_lowercase();
        let label = label.trim();
        if !key.is_empty() && !label.is_empty() {
            self.labels.insert(key, label.to_string());
        }
    }

    pub fn definition_label(&self, name: &str) -> Option<&str> {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return None;
        }
        self.labels.get(&key).map(String::as_str)
    }

    /// Registered label if any, else the prettified identifier.
    pub fn prettify_name(&self, name: &str) -> String {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        match self.definition_label(trimmed) {
            Some(label) => label.to_string(),
            None => prettify_identifier(trimmed),
        }
    }

    /// Prefer a registered definition label over a generic fallback one.
    pub fn prefer_definition_label(
        &self,
        current: &str,
        call: &ToolCall,
        result: &ToolResult,
    ) -> String {
        let current = current.trim();
        let desired = self
            .definition_label(&result.name)
            .or_else(|| self.definition_label(&call.name));
        match desired {
            Some(desired) if current.is_empty() || is_fallback_label(current, call, result) => {
                desired.to_string()
            }
            _ if current.is_empty() => DEFAULT_LABEL.to_string(),
            _ => current.to_string(),
        }
    }
}

/// Whether `candidate` is just the generic label for this call.
pub fn is_fallback_label(candidate: &str, call: &ToolCall, result: &ToolResult) -> bool {
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(DEFAULT_LABEL) {
        return true;
    }
    [call.name.trim(), result.name.trim()]
        .into_iter()
        .filter(|name| is_generic_async_name(name))
        .map(prettify_identifier)
        .any(|fallback| !fallback.is_empty() && fallback.eq_ignore_ascii_case(trimmed))
}
