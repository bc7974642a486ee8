use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hooks::HookConfig;

/// Environment variables recognized by the runtime. These names are the
/// authoritative configuration surface; a config file is optional.
pub const ENV_CACHE_ENABLED: &str = "TOOLUNIVERSE_CACHE_ENABLED";
pub const ENV_CACHE_PERSIST: &str = "TOOLUNIVERSE_CACHE_PERSIST";
pub const ENV_CACHE_PATH: &str = "TOOLUNIVERSE_CACHE_PATH";
pub const ENV_CACHE_MEMORY_SIZE: &str = "TOOLUNIVERSE_CACHE_MEMORY_SIZE";
pub const ENV_CACHE_DEFAULT_TTL: &str = "TOOLUNIVERSE_CACHE_DEFAULT_TTL";
pub const ENV_ENGINE_ADDR: &str = "TOOLUNIVERSE_ENGINE_ADDR";
pub const ENV_ENGINE_AUTHKEY: &str = "TOOLUNIVERSE_ENGINE_AUTHKEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Persistent cache file. Defaults to `~/.tooluniverse/cache.sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
    #[serde(default)]
    pub default_ttl_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persist: true,
            path: None,
            memory_size: default_memory_size(),
            default_ttl_seconds: None,
        }
    }
}

impl CacheConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tooluniverse")
                .join("cache.sqlite")
        })
    }

    /// Sidecar file recording per-tool spec hashes, next to the cache file.
    /// Incremental SDK rebuilds consult it to touch only changed tools.
    pub fn spec_hash_path(&self) -> PathBuf {
        self.resolved_path().with_file_name("spec_hashes.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HooksConfig {
    /// Hooks are opt-in: embedders enable them explicitly.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
    /// Per-tool overrides of the global toggle: `false` exempts a tool
    /// from the whole chain, `true` opts it back in.
    #[serde(default)]
    pub tool_overrides: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Remote inference server address, `host:port`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub authkey: Option<String>,
    /// Key of the hosted engine to attach to (see `make_engine_key`).
    #[serde(default)]
    pub engine_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Defaults overridden by the recognized environment variables.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = bool_env(ENV_CACHE_ENABLED) {
            self.cache.enabled = v;
        }
        if let Some(v) = bool_env(ENV_CACHE_PERSIST) {
            self.cache.persist = v;
        }
        if let Ok(v) = std::env::var(ENV_CACHE_PATH)
            && !v.is_empty()
        {
            self.cache.path = Some(PathBuf::from(v));
        }
        if let Some(v) = int_env(ENV_CACHE_MEMORY_SIZE) {
            self.cache.memory_size = v as usize;
        }
        if let Some(v) = int_env(ENV_CACHE_DEFAULT_TTL) {
            self.cache.default_ttl_seconds = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_ENGINE_ADDR)
            && !v.is_empty()
        {
            self.engine.address = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_ENGINE_AUTHKEY)
            && !v.is_empty()
        {
            self.engine.authkey = Some(v);
        }
    }
}

pub(crate) fn default_true() -> bool {
    true
}

fn default_memory_size() -> usize {
    128
}

fn bool_env(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        "" => None,
        other => {
            warn!("ignoring unrecognized boolean {}={}", name, other);
            None
        }
    }
}

fn int_env(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            if !raw.trim().is_empty() {
                warn!("ignoring non-numeric {}={}", name, raw);
            }
            None
        }
    }
}
