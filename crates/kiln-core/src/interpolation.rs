//! `${{ expr }}` expansion for commands and action parameters.

use crate::event::TriggerEvent;
use crate::ids::RunId;
use indexmap::IndexMap;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Expands placeholders against the values visible to one job.
///
/// Supported expressions: `env.NAME`, `event.kind`, `event.branch`,
/// `event.sha`, `job.name` and `run.id`. Anything else expands to the empty
/// string.
pub struct Interpolator<'a> {
    vars: &'a IndexMap<String, String>,
    event: &'a TriggerEvent,
    job: &'a str,
    run_id: RunId,
}

impl<'a> Interpolator<'a> {
    pub fn new(
        vars: &'a IndexMap<String, String>,
        event: &'a TriggerEvent,
        job: &'a str,
        run_id: RunId,
    ) -> Self {
        Self {
            vars,
            event,
            job,
            run_id,
        }
    }

    pub fn expand(&self, input: &str) -> String {
        if !input.contains("${{") {
            return input.to_string();
        }
        PLACEHOLDER
            .replace_all(input, |caps: &Captures<'_>| self.resolve(&caps[1]))
            .into_owned()
    }

    /// Expand every string inside a JSON value.
    pub fn expand_value(&self, value: &serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(self.expand(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.expand_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.expand_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve(&self, expr: &str) -> String {
        let (scope, key) = match expr.split_once('.') {
            Some(parts) => parts,
            None => return String::new(),
        };
        match (scope, key) {
            ("env", name) => self
                .vars
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
                .unwrap_or_default(),
            ("event", "kind") => self.event.kind_name().to_string(),
            ("event", "branch") => self.event.branch().unwrap_or_default().to_string(),
            ("event", "base_branch") => self.event.filter_branch().unwrap_or_default().to_string(),
            ("event", "sha") => self.event.sha().unwrap_or_default().to_string(),
            ("job", "name") => self.job.to_string(),
            ("run", "id") => self.run_id.to_string(),
            _ => String::new(),
        }
    }
}
