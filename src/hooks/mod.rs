use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{HooksConfig, default_true};
use crate::dispatch::Dispatcher;

pub mod file_save;
pub mod summarize;

pub use file_save::FileSaveHook;
pub use summarize::SummarizationHook;

/// Declarative hook wiring: which transformer, when it fires, and in what
/// order. Lower `priority` fires earlier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub hook_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub conditions: HookConditions,
    #[serde(default)]
    pub hook_config: Value,
}

fn default_priority() -> i32 {
    100
}

/// Predicates over the just-produced result. All present conditions must
/// hold (logical AND) for the hook to fire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_length: Option<LengthCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LengthCondition {
    pub operator: String,
    pub threshold: usize,
}

impl HookConditions {
    pub fn matches(&self, tool_name: &str, output_length: usize) -> bool {
        if let Some(names) = &self.tool_names
            && !names.iter().any(|n| n == tool_name)
        {
            return false;
        }
        if let Some(length) = &self.output_length {
            let ok = match length.operator.as_str() {
                ">" => output_length > length.threshold,
                ">=" => output_length >= length.threshold,
                "<" => output_length < length.threshold,
                "<=" => output_length <= length.threshold,
                "==" => output_length == length.threshold,
                "!=" => output_length != length.threshold,
                other => {
                    warn!("hook condition: unknown operator '{}'", other);
                    false
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// Context handed to a hook: the call it is post-processing plus a
/// dispatcher handle for re-entrant sub-calls. Re-entrancy is safe as
/// long as a hook never recurses on the same tool+arguments it is
/// post-processing.
pub struct HookContext<'a> {
    pub tool_name: &'a str,
    pub arguments: &'a Value,
    pub dispatcher: &'a Dispatcher,
}

/// Post-processing transformer applied to a tool's output. A hook must
/// not mutate its input; it returns a new output. Failures are non-fatal:
/// the manager logs and propagates the untransformed output.
#[async_trait]
pub trait OutputHook: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, output: &Value, ctx: &HookContext<'_>) -> Result<Value>;
}

struct HookEntry {
    config: HookConfig,
    hook: Arc<dyn OutputHook>,
}

/// Evaluates enabled hooks in ascending priority, threading each matched
/// hook's transformation into the next.
pub struct HookManager {
    entries: Vec<HookEntry>,
    enabled: AtomicBool,
    /// Per-tool override of the global toggle: `false` exempts a tool
    /// from the chain entirely, `true` opts it back in while hooks are
    /// globally off.
    tool_overrides: HashMap<String, bool>,
}

impl HookManager {
    /// A manager with no hooks; `apply` is the identity.
    pub fn disabled() -> Self {
        Self {
            entries: Vec::new(),
            enabled: AtomicBool::new(false),
            tool_overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: &HooksConfig) -> Result<Self> {
        let mut tool_overrides = config.tool_overrides.clone();
        let mut entries = Vec::with_capacity(config.hooks.len());
        for hook_config in &config.hooks {
            let hook: Arc<dyn OutputHook> = match hook_config.hook_type.as_str() {
                "SummarizationHook" => {
                    let hook = SummarizationHook::from_value(&hook_config.hook_config)?;
                    // The summarizer itself must never be post-processed,
                    // or the chain would recurse on its own sub-calls.
                    tool_overrides
                        .entry(hook.summarizer_tool().to_string())
                        .or_insert(false);
                    Arc::new(hook)
                }
                "FileSaveHook" => Arc::new(FileSaveHook::from_value(&hook_config.hook_config)?),
                other => {
                    warn!("skipping hook '{}' with unknown type '{}'", hook_config.name, other);
                    continue;
                }
            };
            entries.push(HookEntry {
                config: hook_config.clone(),
                hook,
            });
        }
        entries.sort_by_key(|entry| entry.config.priority);

        Ok(Self {
            entries,
            enabled: AtomicBool::new(config.enabled),
            tool_overrides,
        })
    }

    /// Add a custom hook, keeping the chain sorted by priority. Embedders
    /// use this to register transformers beyond the built-in types.
    pub fn register_hook(&mut self, config: HookConfig, hook: Arc<dyn OutputHook>) {
        self.entries.push(HookEntry { config, hook });
        self.entries.sort_by_key(|entry| entry.config.priority);
    }

    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn applies_to(&self, tool_name: &str) -> bool {
        match self.tool_overrides.get(tool_name) {
            Some(flag) => *flag,
            None => self.is_enabled(),
        }
    }

    /// Run the chain over `output`. Each hook whose conditions match the
    /// current (possibly already transformed) output replaces it; a hook
    /// failure leaves the output as it was.
    pub async fn apply(
        &self,
        dispatcher: &Dispatcher,
        tool_name: &str,
        arguments: &Value,
        output: Value,
    ) -> Value {
        if self.entries.is_empty() || !self.applies_to(tool_name) {
            return output;
        }

        let ctx = HookContext {
            tool_name,
            arguments,
            dispatcher,
        };
        let mut current = output;
        for entry in &self.entries {
            if !entry.config.enabled {
                continue;
            }
            let length = output_text(&current).len();
            if !entry.config.conditions.matches(tool_name, length) {
                continue;
            }
            debug!("applying hook '{}' to '{}' output", entry.config.name, tool_name);
            match entry.hook.apply(&current, &ctx).await {
                Ok(transformed) => current = transformed,
                Err(e) => {
                    warn!(
                        "hook '{}' failed on '{}' output; passing through unchanged: {}",
                        entry.config.name, tool_name, e
                    );
                }
            }
        }
        current
    }
}

/// The textual form of a result, used for size conditions and
/// transformation: the string itself for string results, the serialized
/// JSON for structured ones.
pub fn output_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
