use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DispatchError, DispatchResult};
use crate::utils::canonical::{canonical_json, sha256_hex};

/// Immutable description of a tool: name, factory type, free-text
/// description (used by the finder), and a JSON-schema-like parameter
/// object with `properties`, `required`, and `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameter")]
    pub parameter: Value,
    /// Overrides the factory/instance caching default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_seconds: Option<u64>,
    /// Declared cache version. Bumping it invalidates every cached result
    /// for this tool without an explicit purge; when unset the spec hash
    /// serves as the version, so schema edits invalidate implicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_max_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_parameter() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolSpec {
    /// Minimal spec for tests and programmatic registration.
    pub fn new(name: impl Into<String>, tool_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool_type: tool_type.into(),
            description: String::new(),
            parameter: default_parameter(),
            cacheable: None,
            cache_ttl_seconds: None,
            cache_version: None,
            batch_max_concurrency: None,
            timeout_seconds: None,
            category: None,
            tags: Vec::new(),
        }
    }

    /// Stable hash over the canonical spec JSON. Doubles as the implicit
    /// cache version and as the change detector for incremental rebuilds.
    pub fn spec_hash(&self) -> String {
        let serialized = serde_json::to_value(self).unwrap_or(Value::Null);
        sha256_hex(&canonical_json(&serialized))
    }

    /// The cache version tag for this tool: the declared `cache_version`
    /// if present, else the spec hash.
    pub fn cache_version_tag(&self) -> String {
        self.cache_version
            .clone()
            .unwrap_or_else(|| self.spec_hash())
    }

    pub fn effective_timeout(&self, instance_default: Duration) -> Duration {
        self.timeout_seconds
            .map_or(instance_default, Duration::from_secs)
    }

    /// Registration-time invariant checks. Violations are rejected here so
    /// the dispatcher never has to interpret a malformed spec.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.name.is_empty() || self.name.len() > 256 || self.name.chars().any(char::is_control)
        {
            return Err(DispatchError::Protocol(format!(
                "invalid tool name (len={}, has_control_chars={})",
                self.name.len(),
                self.name.chars().any(char::is_control)
            )));
        }
        if self.tool_type.is_empty() {
            return Err(DispatchError::Protocol(format!(
                "tool '{}' has an empty type",
                self.name
            )));
        }
        if self.batch_max_concurrency == Some(0) {
            return Err(DispatchError::Protocol(format!(
                "tool '{}': batch_max_concurrency must be a positive integer",
                self.name
            )));
        }
        // parameter.required must be a subset of parameter.properties
        let properties = self.parameter.get("properties").and_then(Value::as_object);
        if let Some(required) = self.parameter.get("required").and_then(Value::as_array) {
            for entry in required {
                let Some(field) = entry.as_str() else {
                    return Err(DispatchError::Protocol(format!(
                        "tool '{}': parameter.required entries must be strings",
                        self.name
                    )));
                };
                if !properties.is_some_and(|props| props.contains_key(field)) {
                    return Err(DispatchError::Protocol(format!(
                        "tool '{}': required field '{}' is not declared in parameter.properties",
                        self.name, field
                    )));
                }
            }
        }
        Ok(())
    }
}
