use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

pub mod client;
pub mod server;

pub use client::{EngineClient, EngineProxy};
pub use server::EngineServer;

/// Sampling controls forwarded to an inference engine. Absent fields keep
/// the engine's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A hosted inference engine. Implementations wrap a concrete model
/// runtime; the server keeps at most one instance per engine key, shared
/// by every client.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn metadata(&self) -> Value;

    /// Whether the engine enforces schema-constrained output natively.
    /// When false and a caller requests JSON with a schema, the server
    /// logs a warning and relies on prompt-side guidance alone.
    fn supports_structured_output(&self) -> bool {
        false
    }

    /// Generate one completion per prompt, aligned with the input order.
    async fn generate(
        &self,
        prompts: &[String],
        sampling: &SamplingParams,
        return_json: bool,
        json_schema: Option<&Value>,
    ) -> anyhow::Result<Vec<Option<String>>>;
}

/// A remote text-generation model as seen by in-process consumers (the
/// finder's LLM strategy, summarizer backends). [`EngineProxy`] is the
/// shipped implementation; tests substitute in-memory fakes.
#[async_trait]
pub trait RemoteModel: Send + Sync {
    async fn generate(
        &self,
        prompts: &[String],
        sampling: &SamplingParams,
        return_json: bool,
        json_schema: Option<&Value>,
    ) -> anyhow::Result<Vec<Option<String>>>;
}

/// Environment variable naming the accelerators visible to this process.
const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Best-effort count of visible accelerators. `None` when nothing
/// declares the device set; an explicit empty or `-1` list means zero.
fn detect_visible_gpu_count() -> Option<usize> {
    let raw = std::env::var(VISIBLE_DEVICES_ENV).ok()?;
    let devices: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect();
    if devices.is_empty() || devices == ["-1"] {
        return Some(0);
    }
    Some(devices.len())
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Coerce launch parameters into safe values before they participate in
/// an engine key or engine construction. Invalid `max_model_len` and
/// `tensor_parallel_size` entries are dropped with a warning rather than
/// poisoning the key; a parallelism request below 1 defaults to 1, and
/// one above the visible accelerator count is clamped down to it.
pub fn normalize_launch_params(launch_params: &Value) -> Map<String, Value> {
    let Some(map) = launch_params.as_object() else {
        if !launch_params.is_null() {
            warn!("ignoring non-object launch parameters: {}", launch_params);
        }
        return Map::new();
    };
    let mut normalized = map.clone();

    if let Some(value) = map.get("max_model_len") {
        match coerce_integer(value).filter(|len| *len > 0) {
            Some(len) => {
                normalized.insert("max_model_len".to_string(), json!(len));
            }
            None => {
                warn!("ignoring invalid max_model_len={}", value);
                normalized.remove("max_model_len");
            }
        }
    }

    if let Some(value) = map.get("tensor_parallel_size") {
        match coerce_integer(value) {
            None => {
                warn!("invalid tensor_parallel_size={}; removing setting", value);
                normalized.remove("tensor_parallel_size");
            }
            Some(requested) => {
                let mut requested = if requested < 1 {
                    warn!("tensor_parallel_size must be >=1; defaulting to 1");
                    1
                } else {
                    requested as usize
                };
                match detect_visible_gpu_count() {
                    Some(0) => warn!(
                        "no accelerators visible for tensor_parallel_size={}; engines cannot start on this host",
                        requested
                    ),
                    Some(gpu_count) if requested > gpu_count => {
                        info!(
                            "requested tensor_parallel_size={} but only {} accelerator(s) visible; using {}",
                            requested, gpu_count, gpu_count
                        );
                        requested = gpu_count;
                    }
                    _ => {}
                }
                normalized.insert("tensor_parallel_size".to_string(), json!(requested));
            }
        }
    }

    normalized
}

/// Derive the stable key identifying a hosted engine: the explicit id
/// when given, else the model name joined with its normalized launch
/// parameters in sorted-key order.
pub fn make_engine_key(
    engine_id: Option<&str>,
    model_name: &str,
    launch_params: Option<&Value>,
) -> String {
    if let Some(id) = engine_id
        && !id.is_empty()
    {
        return id.to_string();
    }
    let mut parts = vec![model_name.to_string()];
    if let Some(params) = launch_params {
        let normalized = normalize_launch_params(params);
        let sorted: BTreeMap<&String, &Value> = normalized.iter().collect();
        for (key, value) in sorted {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parts.push(format!("{}={}", key, rendered));
        }
    }
    parts.join("|")
}

/// Validate generated entries when JSON output was requested: entries
/// that fail to parse are returned as absent, matching the generate
/// contract.
pub(crate) fn enforce_json_outputs(results: Vec<Option<String>>) -> Vec<Option<String>> {
    results
        .into_iter()
        .map(|entry| {
            entry.filter(|text| serde_json::from_str::<Value>(text).is_ok())
        })
        .collect()
}
