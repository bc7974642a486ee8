use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::DispatchResult;

pub mod spec;

pub use spec::ToolSpec;

/// Callback invoked with progressive output chunks from streaming-capable
/// tools.
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Capability metadata intrinsic to a tool instance.
///
/// The source runtime inspected a callable's signature to decide which
/// extra parameters to forward; here every tool declares its capabilities
/// once and the dispatcher populates only the [`ExecutionContext`] fields
/// the tool asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCapabilities {
    /// Tool emits progressive output through a stream callback.
    pub streaming: bool,
    /// Tool wants to know the dispatcher's caching decision (e.g. to
    /// short-circuit internal lookups on cache hits).
    pub cache_aware: bool,
    /// Tool wants to know whether arguments were already validated.
    pub validation_aware: bool,
}

/// Context passed to every tool execution.
///
/// Policy flags are `Some` only when the tool declared the matching
/// capability; tools that declared nothing see an all-`None` context and
/// work unchanged.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub use_cache: Option<bool>,
    pub validate: Option<bool>,
    pub stream: Option<StreamCallback>,
    /// Free-form metadata from the originating surface (e.g. RPC request id).
    pub metadata: HashMap<String, Value>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("use_cache", &self.use_cache)
            .field("validate", &self.validate)
            .field("stream", &self.stream.as_ref().map(|_| "<callback>"))
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A named operation with a declared parameter schema and an execute
/// contract. Instances own their network clients and internal state; they
/// are created lazily by the registry and live for the runtime's lifetime.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, arguments: Value, ctx: &ExecutionContext) -> anyhow::Result<Value>;

    /// Whether this tool's results can be cached when the spec does not
    /// say otherwise. Only read-only tools should return true.
    fn cacheable(&self) -> bool {
        false
    }

    /// Per-tool execution timeout when the spec does not declare one.
    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    fn capabilities(&self) -> ToolCapabilities {
        ToolCapabilities::default()
    }
}

/// Creates tool instances from specs. One factory is registered per spec
/// `type`; the registry calls it on the first request for each tool name.
pub trait ToolFactory: Send + Sync {
    fn create(&self, spec: &ToolSpec) -> DispatchResult<Arc<dyn Tool>>;

    /// Caching default for tools of this type, used when a spec leaves
    /// `cacheable` unset and the instance has not been created yet.
    fn default_cacheable(&self) -> bool {
        false
    }
}

/// Blanket factory for closures, so embedders can register
/// `|spec| Ok(Arc::new(MyTool::new(spec)?))` directly.
impl<F> ToolFactory for F
where
    F: Fn(&ToolSpec) -> DispatchResult<Arc<dyn Tool>> + Send + Sync,
{
    fn create(&self, spec: &ToolSpec) -> DispatchResult<Arc<dyn Tool>> {
        self(spec)
    }
}

#[cfg(test)]
mod tests;
