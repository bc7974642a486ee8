use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Maximum length of an upstream error message carried inside a
/// `ToolRuntime` error. Longer messages are truncated so a misbehaving
/// tool cannot flood logs or RPC responses.
const MAX_RUNTIME_MESSAGE_CHARS: usize = 2000;

/// Structured argument-validation failure.
///
/// Carries enough context for the caller to fix the call without reading
/// the tool's schema: the offending field, what was expected, what was
/// received, and actionable hints.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub expected: String,
    pub got: String,
    pub next_steps: Vec<String>,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
        next_steps: Vec<String>,
    ) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
            got: got.into(),
            next_steps,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "field '{}': expected {}, got {}",
            self.field, self.expected, self.got
        )
    }
}

/// Typed error hierarchy for the dispatch runtime.
///
/// Use at module boundaries (dispatcher, registry, cache, RPC). Internal
/// leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Validation failed: {0}")]
    Validation(ValidationError),

    #[error("Tool '{name}' not found")]
    ToolNotFound { name: String },

    #[error("Tool '{tool}' failed to initialize: {message}")]
    ToolInit { tool: String, message: String },

    #[error("Tool '{tool}' failed: {message}")]
    ToolRuntime {
        tool: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Tool '{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `DispatchError`.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    pub fn tool_runtime(tool: impl Into<String>, message: impl std::fmt::Display) -> Self {
        let mut message = message.to_string();
        if message.len() > MAX_RUNTIME_MESSAGE_CHARS {
            let mut cut = MAX_RUNTIME_MESSAGE_CHARS;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
            message.push_str("... (truncated)");
        }
        DispatchError::ToolRuntime {
            tool: tool.into(),
            status: None,
            message,
        }
    }

    /// Stable error-kind tag used in structured error records and RPC
    /// `error.data.type` fields.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "ValidationError",
            DispatchError::ToolNotFound { .. } => "ToolNotFound",
            DispatchError::ToolInit { .. } => "ToolInitError",
            DispatchError::ToolRuntime { .. } => "ToolRuntimeError",
            DispatchError::Timeout { .. } => "TimeoutError",
            DispatchError::Cache(_) => "CacheError",
            DispatchError::Protocol(_) => "ProtocolError",
            DispatchError::Internal(_) => "InternalError",
        }
    }

    /// Actionable hints matching the error kind. Embedded in error records
    /// so upstream messages are self-explanatory.
    pub fn next_steps(&self) -> Vec<String> {
        match self {
            DispatchError::Validation(err) => {
                if err.next_steps.is_empty() {
                    vec!["Check the tool's parameter schema via tools/list".to_string()]
                } else {
                    err.next_steps.clone()
                }
            }
            DispatchError::ToolNotFound { name } => vec![
                format!("Verify the tool name '{}' (names are case-sensitive)", name),
                "List available tools via tools/list or tools/find".to_string(),
            ],
            DispatchError::ToolInit { .. } => vec![
                "Check that the tool's factory type is registered".to_string(),
                "Check required credentials/configuration for this tool".to_string(),
            ],
            DispatchError::ToolRuntime { .. } => vec![
                "Retry the call; the upstream service may be transiently unavailable".to_string(),
            ],
            DispatchError::Timeout { seconds, .. } => vec![format!(
                "The tool exceeded its {}s budget; retry or raise timeout_seconds in its spec",
                seconds
            )],
            DispatchError::Cache(_) | DispatchError::Internal(_) => vec![],
            DispatchError::Protocol(_) => {
                vec!["Send a valid JSON-RPC 2.0 request object".to_string()]
            }
        }
    }

    /// Kind-specific detail payload for the `error_details.details` field.
    pub fn details(&self) -> Value {
        match self {
            DispatchError::Validation(err) => json!({
                "field": err.field,
                "expected": err.expected,
                "got": err.got,
            }),
            DispatchError::ToolRuntime { status, message, .. } => json!({
                "status": status,
                "message": message,
            }),
            DispatchError::Timeout { seconds, .. } => json!({ "timeout_seconds": seconds }),
            _ => Value::Null,
        }
    }

    /// Uniform error record returned to in-process callers. The RPC surface
    /// carries the same `error_details` object as JSON-RPC `error.data`.
    pub fn to_record(&self) -> Value {
        json!({
            "error": self.to_string(),
            "error_details": {
                "type": self.kind(),
                "next_steps": self.next_steps(),
                "details": self.details(),
            },
        })
    }
}

impl From<ValidationError> for DispatchError {
    fn from(err: ValidationError) -> Self {
        DispatchError::Validation(err)
    }
}

/// True if `value` is a dispatcher error record (the shape produced by
/// [`DispatchError::to_record`]). Used to keep error records out of the
/// cache and the hook chain.
pub fn is_error_record(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| obj.contains_key("error") && obj.contains_key("error_details"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_not_found_display() {
        let err = DispatchError::ToolNotFound {
            name: "missing".into(),
        };
        assert_eq!(err.to_string(), "Tool 'missing' not found");
        assert_eq!(err.kind(), "ToolNotFound");
    }

    #[test]
    fn validation_record_shape() {
        let err = DispatchError::Validation(ValidationError::new(
            "value",
            "integer",
            "string",
            vec!["Pass an integer".into()],
        ));
        let record = err.to_record();
        assert_eq!(record["error_details"]["type"], "ValidationError");
        assert_eq!(record["error_details"]["details"]["field"], "value");
        assert!(is_error_record(&record));
    }

    #[test]
    fn runtime_message_truncated() {
        let err = DispatchError::tool_runtime("big", "x".repeat(5000));
        if let DispatchError::ToolRuntime { message, .. } = &err {
            assert!(message.len() < 2100);
            assert!(message.ends_with("(truncated)"));
        } else {
            panic!("expected ToolRuntime");
        }
    }

    #[test]
    fn internal_from_anyhow() {
        let err: DispatchError = anyhow::anyhow!("something broke").into();
        assert!(matches!(err, DispatchError::Internal(_)));
        assert_eq!(err.kind(), "InternalError");
    }

    #[test]
    fn plain_result_is_not_error_record() {
        assert!(!is_error_record(&json!({"result": 1})));
        assert!(!is_error_record(&json!("error")));
    }
}
