use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::{self, Flight, ResultCacheManager, singleflight};
use crate::errors::{DispatchError, DispatchResult, is_error_record};
use crate::hooks::HookManager;
use crate::registry::ToolRegistry;
use crate::tools::{ExecutionContext, StreamCallback, ToolSpec};
use crate::utils::canonical::{canonical_json, canonicalize_arguments};
use crate::validation::{Coercion, validate_arguments};

/// A single tool invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    /// Batch-only: opt out of intra-batch deduplication for this call.
    /// Two identical calls coalesce only when both leave this unset/true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup: Option<bool>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            dedup: None,
        }
    }

    fn dedup_enabled(&self) -> bool {
        self.dedup.unwrap_or(true)
    }
}

/// One element of a batch result sequence. The first message is the
/// synthetic `assistant` envelope carrying the ordered call descriptor;
/// each following `tool` message carries one JSON-encoded
/// `{call_id, name, content}` record in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Per-call execution policy.
#[derive(Clone)]
pub struct RunOptions {
    pub use_cache: bool,
    pub validate: bool,
    pub coercion: Coercion,
    pub stream: Option<StreamCallback>,
}

impl RunOptions {
    /// Cache on, validation on, strict typing — the default for
    /// in-process callers.
    pub fn standard() -> Self {
        Self {
            use_cache: true,
            validate: true,
            coercion: Coercion::Strict,
            stream: None,
        }
    }

    /// RPC-surface policy: arguments arrive as strings or JSON, so scalar
    /// coercion is allowed.
    pub fn rpc() -> Self {
        Self {
            coercion: Coercion::Lenient,
            ..Self::standard()
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("use_cache", &self.use_cache)
            .field("validate", &self.validate)
            .field("coercion", &self.coercion)
            .field("stream", &self.stream.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// The central component running a call end-to-end: spec resolution,
/// validation, cache lookup, singleflight-gated execution, cache store,
/// and the hook chain. Re-entrant: hooks call back into the dispatcher
/// for their own sub-calls.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    cache: Arc<ResultCacheManager>,
    hooks: Arc<HookManager>,
    /// Per-tool batch semaphores, created on first use from the spec's
    /// `batch_max_concurrency`. Calls for the same tool share one.
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        cache: Arc<ResultCacheManager>,
        hooks: Arc<HookManager>,
    ) -> Self {
        Self {
            registry,
            cache,
            hooks,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCacheManager> {
        &self.cache
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    /// Run a single call, returning either the (hook-transformed) result
    /// or a uniform error record. This surface never fails: malformed
    /// input and tool failures both come back as structured records.
    pub async fn run_one(&self, call: &FunctionCall, opts: &RunOptions) -> Value {
        match self.try_run_one(call, opts).await {
            Ok(value) => value,
            Err(err) => {
                warn!("call to '{}' failed: {}", call.name, err);
                err.to_record()
            }
        }
    }

    /// Typed variant used by the RPC surface, which maps error kinds onto
    /// JSON-RPC codes instead of embedding records.
    pub async fn try_run_one(&self, call: &FunctionCall, opts: &RunOptions) -> DispatchResult<Value> {
        let spec = self.registry.get_spec(&call.name)?;

        let arguments = if opts.validate {
            validate_arguments(&spec, &call.arguments, opts.coercion)?
        } else {
            call.arguments.clone()
        };

        let cacheable =
            opts.use_cache && self.cache.enabled() && self.registry.default_cacheable(&spec);
        if !cacheable {
            let value = self.invoke(&spec, arguments.clone(), opts).await?;
            return Ok(self.hooks.apply(self, &spec.name, &arguments, value).await);
        }

        let version = spec.cache_version_tag();
        let digest = cache::argument_digest(&arguments);
        let flight_key = ResultCacheManager::flight_key(&spec.name, &version, &digest);

        loop {
            if let Some(hit) = self.cache.get(&spec.name, &version, &digest) {
                debug!("cache hit for tool '{}'", spec.name);
                return Ok(self.hooks.apply(self, &spec.name, &arguments, hit).await);
            }

            match self.cache.flights().join(&flight_key) {
                Flight::Leader(guard) => {
                    return match self.invoke(&spec, arguments.clone(), opts).await {
                        Ok(value) => {
                            // Store before publishing so followers joining
                            // after retirement find the entry in the cache.
                            self.cache.set(
                                &spec.name,
                                &version,
                                &digest,
                                &value,
                                spec.cache_ttl_seconds,
                            );
                            guard.publish(value.clone());
                            Ok(self.hooks.apply(self, &spec.name, &arguments, value).await)
                        }
                        Err(err) => {
                            // Failures are delivered to every waiter but
                            // never cached.
                            guard.publish(err.to_record());
                            Err(err)
                        }
                    };
                }
                Flight::Follower(rx) => {
                    if let Some(value) = singleflight::wait(rx).await {
                        if is_error_record(&value) {
                            return Ok(value);
                        }
                        return Ok(self.hooks.apply(self, &spec.name, &arguments, value).await);
                    }
                    // Leader vanished without publishing; retry, possibly
                    // becoming the new leader.
                }
            }
        }
    }

    /// Execute a batch with bounded parallelism. Identical calls (same
    /// name and canonical arguments, both with dedup enabled) coalesce to
    /// a single execution even when caching is off; every position still
    /// receives a response, in submission order.
    pub async fn run_batch(
        self: &Arc<Self>,
        calls: &[FunctionCall],
        opts: &RunOptions,
        max_workers: usize,
    ) -> Vec<Message> {
        let call_ids: Vec<String> = calls.iter().map(|_| call_id()).collect();
        let descriptor: Vec<Value> = calls
            .iter()
            .zip(&call_ids)
            .map(|(call, id)| {
                json!({
                    "call_id": id,
                    "name": call.name,
                    "arguments": call.arguments,
                })
            })
            .collect();

        let mut messages = Vec::with_capacity(calls.len() + 1);
        messages.push(Message {
            role: "assistant".to_string(),
            content: serde_json::to_string(&descriptor).unwrap_or_default(),
        });

        // Coalesce duplicates: one execution per distinct canonical
        // argument set, shared by every position that opted in.
        let mut group_of = vec![0usize; calls.len()];
        let mut group_calls: Vec<FunctionCall> = Vec::new();
        let mut seen: HashMap<(String, String), usize> = HashMap::new();
        for (index, call) in calls.iter().enumerate() {
            if call.dedup_enabled() {
                let key = (
                    call.name.clone(),
                    canonical_json(&canonicalize_arguments(&call.arguments)),
                );
                if let Some(&group) = seen.get(&key) {
                    group_of[index] = group;
                    continue;
                }
                seen.insert(key, group_calls.len());
            }
            group_of[index] = group_calls.len();
            group_calls.push(call.clone());
        }
        if group_calls.len() < calls.len() {
            debug!(
                "batch: coalesced {} calls into {} executions",
                calls.len(),
                group_calls.len()
            );
        }

        let global = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut handles = Vec::with_capacity(group_calls.len());
        for call in group_calls {
            let this = Arc::clone(self);
            let opts = opts.clone();
            let global = Arc::clone(&global);
            handles.push(tokio::spawn(async move {
                let _worker = global.acquire_owned().await.ok();
                let _slot = match this.tool_semaphore(&call.name) {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                this.run_one(&call, &opts).await
            }));
        }

        let mut group_results = Vec::with_capacity(handles.len());
        for handle in handles {
            group_results.push(handle.await.unwrap_or_else(|e| {
                error!("batch worker failed: {}", e);
                DispatchError::Internal(anyhow::anyhow!("batch worker failed: {}", e)).to_record()
            }));
        }

        for (index, call) in calls.iter().enumerate() {
            let content = json!({
                "call_id": call_ids[index],
                "name": call.name,
                "content": group_results[group_of[index]],
            });
            messages.push(Message {
                role: "tool".to_string(),
                content: content.to_string(),
            });
        }
        messages
    }

    /// The shared per-tool batch semaphore, sized by the spec's
    /// `batch_max_concurrency`. `None` when the tool is unbounded.
    fn tool_semaphore(&self, name: &str) -> Option<Arc<Semaphore>> {
        let spec = self.registry.get_spec(name).ok()?;
        let capacity = spec.batch_max_concurrency? as usize;
        let mut semaphores = self
            .semaphores
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Some(Arc::clone(
            semaphores
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(capacity))),
        ))
    }

    /// Resolve the instance and execute it inside a spawned task so that
    /// timeouts are enforced and panics become structured errors instead
    /// of taking down the runtime.
    async fn invoke(
        &self,
        spec: &Arc<ToolSpec>,
        arguments: Value,
        opts: &RunOptions,
    ) -> DispatchResult<Value> {
        let tool = self.registry.get_instance(&spec.name)?;
        let capabilities = tool.capabilities();
        let ctx = ExecutionContext {
            use_cache: capabilities.cache_aware.then_some(opts.use_cache),
            validate: capabilities.validation_aware.then_some(opts.validate),
            stream: if capabilities.streaming {
                opts.stream.clone()
            } else {
                None
            },
            metadata: HashMap::new(),
        };
        let timeout = spec.effective_timeout(tool.execution_timeout());
        let timeout_secs = timeout.as_secs();
        let name = spec.name.clone();

        let handle = tokio::task::spawn(async move {
            tokio::time::timeout(timeout, tool.execute(arguments, &ctx)).await
        });

        match handle.await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(match err.downcast::<DispatchError>() {
                Ok(dispatch_err) => dispatch_err,
                Err(other) => DispatchError::tool_runtime(&name, other),
            }),
            Ok(Err(_elapsed)) => {
                warn!("tool '{}' timed out after {}s", name, timeout_secs);
                Err(DispatchError::Timeout {
                    tool: name,
                    seconds: timeout_secs,
                })
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    // Extract the panic message so callers can avoid
                    // repeating the call. into_panic() consumes the error.
                    let payload = join_err.into_panic();
                    let message = payload
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| payload.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown cause");
                    error!("tool '{}' panicked: {}", name, message);
                    Err(DispatchError::tool_runtime(
                        &name,
                        format!("crashed: {}", message),
                    ))
                } else {
                    Err(DispatchError::Internal(anyhow::anyhow!(
                        "tool '{}' was cancelled",
                        name
                    )))
                }
            }
        }
    }
}

fn call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}
