//! Reusable action handlers.
//!
//! Steps declared with `uses: identifier@version` are dispatched to an
//! [`ActionHandler`] registered under the identifier.

mod checkout;
mod rust_toolchain;

pub use checkout::CheckoutAction;
pub use rust_toolchain::RustToolchainAction;

use crate::cache::ToolchainCache;
use crate::runner::{ProcessOutcome, StepContext};
use crate::shell::ShellRunner;
use async_trait::async_trait;
use indexmap::IndexMap;
use kiln_core::Result;
use kiln_core::pipeline::ActionRef;
use kiln_core::ports::{ActionCatalog, RunContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A single action invocation.
pub struct ActionCall<'a> {
    pub action: &'a ActionRef,
    /// Parameters with placeholders already expanded.
    pub with: &'a IndexMap<String, serde_json::Value>,
    pub step: &'a StepContext,
    pub run: &'a RunContext,
}

impl ActionCall<'_> {
    /// A scalar parameter as a string.
    pub fn param_str(&self, key: &str) -> Option<String> {
        match self.with.get(key)? {
            serde_json::Value::String(s) if s.is_empty() => None,
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// A list parameter, given either as a sequence or a comma/space
    /// separated string.
    pub fn param_list(&self, key: &str) -> Vec<String> {
        match self.with.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            Some(serde_json::Value::String(s)) => s
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Result of an action: the processes it ran plus variables exported to the
/// job's later steps.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub process: ProcessOutcome,
    pub exports: IndexMap<String, String>,
}

impl ActionOutcome {
    pub fn new(process: ProcessOutcome) -> Self {
        Self {
            process,
            exports: IndexMap::new(),
        }
    }

    pub fn with_export(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.exports.insert(key.into(), value.into());
        self
    }
}

/// Trait for native action handlers.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Identifier this handler is registered under (e.g. `actions/checkout`).
    fn name(&self) -> &str;

    /// Whether this handler can run the given reference.
    fn supports(&self, action: &ActionRef) -> bool {
        action.name == self.name()
    }

    async fn execute(&self, call: &ActionCall<'_>, cancel: &CancellationToken) -> Result<ActionOutcome>;
}

/// Handlers keyed by action identifier.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `actions/checkout` and
    /// `dtolnay/rust-toolchain` handlers.
    pub fn with_builtins(shell: Arc<ShellRunner>, cache: ToolchainCache) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CheckoutAction::new(Arc::clone(&shell))));
        registry.register(Arc::new(RustToolchainAction::new(shell, cache)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, action: &ActionRef) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&action.name)
            .filter(|handler| handler.supports(action))
            .cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ActionCatalog for ActionRegistry {
    fn resolves(&self, action: &ActionRef) -> bool {
        self.get(action).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::event::TriggerEvent;
    use std::time::Duration;

    #[test]
    fn test_builtins_resolve() {
        let registry = ActionRegistry::with_builtins(Arc::new(ShellRunner::default()), ToolchainCache::new());
        assert_eq!(registry.names(), vec!["actions/checkout", "dtolnay/rust-toolchain"]);

        let checkout = ActionRef::parse("actions/checkout@v4").unwrap();
        let toolchain = ActionRef::parse("dtolnay/rust-toolchain@stable").unwrap();
        let unknown = ActionRef::parse("actions/cache@v4").unwrap();
        assert!(registry.resolves(&checkout));
        assert!(registry.resolves(&toolchain));
        assert!(!registry.resolves(&unknown));
    }

    #[test]
    fn test_params() {
        let mut with = IndexMap::new();
        with.insert("components".to_string(), serde_json::json!("clippy, rustfmt"));
        with.insert("targets".to_string(), serde_json::json!(["wasm32-unknown-unknown"]));
        with.insert("fetch-depth".to_string(), serde_json::json!(0));
        with.insert("ref".to_string(), serde_json::json!(""));

        let action = ActionRef::parse("dtolnay/rust-toolchain@stable").unwrap();
        let step = StepContext::new("check", 0, std::env::temp_dir(), Duration::from_secs(5));
        let run = RunContext::new(TriggerEvent::push("main"));
        let call = ActionCall {
            action: &action,
            with: &with,
            step: &step,
            run: &run,
        };

        assert_eq!(call.param_list("components"), vec!["clippy", "rustfmt"]);
        assert_eq!(call.param_list("targets"), vec!["wasm32-unknown-unknown"]);
        assert_eq!(call.param_list("missing"), Vec::<String>::new());
        assert_eq!(call.param_str("fetch-depth").as_deref(), Some("0"));
        assert_eq!(call.param_str("ref"), None);
    }
}
