use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::ResultCacheManager;
use crate::config::Config;
use crate::dispatch::{Dispatcher, FunctionCall, Message, RunOptions};
use crate::engine::EngineClient;
use crate::finder::{SearchMethod, ToolFinder, ToolMatch};
use crate::hooks::HookManager;
use crate::registry::ToolRegistry;
use crate::tools::{Tool, ToolSpec};

/// The assembled runtime: one registry, one cache engine, one hook chain,
/// one dispatcher, one finder. Embedders own a `Runtime` value; nothing
/// lives in module-level globals except the optional convenience default.
pub struct Runtime {
    config: Config,
    registry: Arc<ToolRegistry>,
    cache: Arc<ResultCacheManager>,
    hooks: Arc<HookManager>,
    dispatcher: Arc<Dispatcher>,
    finder: Arc<ToolFinder>,
}

impl Runtime {
    /// Assemble from configuration without touching the network.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        Self::assemble(config, None)
    }

    /// Assemble and, when the engine address is configured, attach the
    /// remote model so the finder's LLM strategy becomes available.
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let model = match (&config.engine.address, &config.engine.engine_key) {
            (Some(address), Some(engine_key)) => {
                let authkey = config.engine.authkey.clone().unwrap_or_default();
                match EngineClient::connect(address, &authkey).await {
                    Ok(client) => {
                        let client = Arc::new(client);
                        match client.get_engine(engine_key).await {
                            Ok(proxy) => {
                                info!("attached remote engine '{}' at {}", engine_key, address);
                                Some(Arc::new(proxy) as Arc<dyn crate::engine::RemoteModel>)
                            }
                            Err(e) => {
                                warn!("engine '{}' unavailable: {}; continuing without", engine_key, e);
                                None
                            }
                        }
                    }
                    Err(e) => {
                        warn!("engine server unreachable: {}; continuing without", e);
                        None
                    }
                }
            }
            _ => None,
        };
        Self::assemble(config, model)
    }

    fn assemble(
        config: Config,
        model: Option<Arc<dyn crate::engine::RemoteModel>>,
    ) -> Result<Arc<Self>> {
        let registry =
            Arc::new(ToolRegistry::new().with_spec_hash_path(config.cache.spec_hash_path()));
        let cache = Arc::new(ResultCacheManager::new(&config.cache));
        let hooks = Arc::new(
            HookManager::from_config(&config.hooks).context("invalid hook configuration")?,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&hooks),
        ));
        let mut finder = ToolFinder::new(Arc::clone(&registry));
        if let Some(model) = model {
            finder = finder.with_remote_model(model);
        }

        Ok(Arc::new(Self {
            config,
            registry,
            cache,
            hooks,
            dispatcher,
            finder: Arc::new(finder),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
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

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn finder(&self) -> &Arc<ToolFinder> {
        &self.finder
    }

    /// Register a custom tool with a pre-built instance.
    pub fn register_custom_tool(
        &self,
        spec: ToolSpec,
        instance: Arc<dyn Tool>,
    ) -> crate::errors::DispatchResult<()> {
        self.registry.register_instance(spec, instance)
    }

    /// Run one call with the standard policy. See
    /// [`Dispatcher::run_one`] for the full option surface.
    pub async fn run_one(&self, call: &FunctionCall) -> Value {
        self.dispatcher.run_one(call, &RunOptions::standard()).await
    }

    /// Run an ordered batch with bounded parallelism.
    pub async fn run(
        &self,
        calls: &[FunctionCall],
        opts: &RunOptions,
        max_workers: usize,
    ) -> Vec<Message> {
        self.dispatcher.run_batch(calls, opts, max_workers).await
    }

    pub async fn find(
        &self,
        query: &str,
        method: SearchMethod,
        limit: usize,
    ) -> crate::errors::DispatchResult<Vec<ToolMatch>> {
        self.finder.find(query, method, limit).await
    }

    /// Teardown: flush and close the cache, release tool instances.
    pub fn close(&self) {
        self.registry.persist_spec_hashes();
        self.cache.close();
        self.registry.close();
    }
}

static DEFAULT_RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

/// The process-wide default runtime, built from the environment on first
/// use. Exists only for convenience wrappers; embedders that need custom
/// configuration construct their own [`Runtime`].
pub fn default_runtime() -> Result<Arc<Runtime>> {
    if let Some(runtime) = DEFAULT_RUNTIME.get() {
        return Ok(Arc::clone(runtime));
    }
    let runtime = Runtime::new(Config::from_env())?;
    Ok(Arc::clone(DEFAULT_RUNTIME.get_or_init(|| runtime)))
}
