use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{DispatchError, DispatchResult};
use crate::tools::{Tool, ToolFactory, ToolSpec};

struct RegistryInner {
    factories: HashMap<String, Arc<dyn ToolFactory>>,
    specs: HashMap<String, Arc<ToolSpec>>,
    instances: HashMap<String, Arc<dyn Tool>>,
    /// Lazy catalog: category name → catalog file of specs. Listing a
    /// category never instantiates tools; files load on first demand.
    catalogs: HashMap<String, PathBuf>,
    loaded_catalogs: HashSet<String>,
}

/// Maps tool names to specs and factories, instantiating tools lazily on
/// first use. Reads take the read lock (uncontended after initial
/// population); `register_*` and `refresh` take the write lock.
pub struct ToolRegistry {
    inner: RwLock<RegistryInner>,
    /// Optional sidecar recording per-tool spec hashes so incremental SDK
    /// rebuilds touch only changed tools.
    spec_hash_path: Option<PathBuf>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                factories: HashMap::new(),
                specs: HashMap::new(),
                instances: HashMap::new(),
                catalogs: HashMap::new(),
                loaded_catalogs: HashSet::new(),
            }),
            spec_hash_path: None,
        }
    }

    pub fn with_spec_hash_path(mut self, path: PathBuf) -> Self {
        self.spec_hash_path = Some(path);
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryInner> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryInner> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register the factory that builds instances for a spec `type`.
    pub fn register_factory(&self, type_name: impl Into<String>, factory: Arc<dyn ToolFactory>) {
        let type_name = type_name.into();
        let mut inner = self.write();
        if inner.factories.contains_key(&type_name) {
            warn!("registry: overwriting factory for type '{}'", type_name);
        }
        inner.factories.insert(type_name, factory);
    }

    /// Register a spec. The instance is created lazily by the matching
    /// factory on the first call to that tool.
    pub fn register_tool(&self, spec: ToolSpec) -> DispatchResult<()> {
        spec.validate()?;
        let mut inner = self.write();
        if inner.specs.contains_key(&spec.name) {
            warn!("registry: overwriting duplicate tool '{}'", spec.name);
            inner.instances.remove(&spec.name);
        }
        inner.specs.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    /// Register a spec together with a pre-built instance, bypassing the
    /// factory path. Used for custom tools added at runtime.
    pub fn register_instance(&self, spec: ToolSpec, instance: Arc<dyn Tool>) -> DispatchResult<()> {
        spec.validate()?;
        let mut inner = self.write();
        if inner.specs.contains_key(&spec.name) {
            warn!("registry: overwriting duplicate tool '{}'", spec.name);
        }
        inner.instances.insert(spec.name.clone(), instance);
        inner.specs.insert(spec.name.clone(), Arc::new(spec));
        Ok(())
    }

    /// Attach a catalog file to a category without loading it.
    pub fn add_catalog(&self, category: impl Into<String>, path: impl Into<PathBuf>) {
        let category = category.into();
        let path = path.into();
        let mut inner = self.write();
        inner.loaded_catalogs.remove(&category);
        inner.catalogs.insert(category, path);
    }

    /// Attach every `*.json` file in `dir` as a catalog named after its
    /// file stem.
    pub fn add_catalog_dir(&self, dir: &Path) -> Result<usize> {
        let mut added = 0;
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read catalog directory: {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                self.add_catalog(stem.to_string(), path.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn get_spec(&self, name: &str) -> DispatchResult<Arc<ToolSpec>> {
        if let Some(spec) = self.read().specs.get(name) {
            return Ok(Arc::clone(spec));
        }
        self.load_catalogs_until(|inner| inner.specs.contains_key(name))?;
        self.read()
            .specs
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| DispatchError::ToolNotFound { name: name.into() })
    }

    /// Resolve a live instance, loading the owning catalog and running the
    /// factory on first use. Instances are cached for the runtime's life.
    pub fn get_instance(&self, name: &str) -> DispatchResult<Arc<dyn Tool>> {
        if let Some(instance) = self.read().instances.get(name) {
            return Ok(Arc::clone(instance));
        }
        let spec = self.get_spec(name)?;

        let mut inner = self.write();
        // Another caller may have built it while we waited for the lock.
        if let Some(instance) = inner.instances.get(name) {
            return Ok(Arc::clone(instance));
        }
        let factory = inner.factories.get(&spec.tool_type).cloned().ok_or_else(|| {
            DispatchError::ToolInit {
                tool: name.to_string(),
                message: format!("no factory registered for type '{}'", spec.tool_type),
            }
        })?;
        let instance = factory.create(&spec).map_err(|e| match e {
            err @ DispatchError::ToolInit { .. } => err,
            other => DispatchError::ToolInit {
                tool: name.to_string(),
                message: other.to_string(),
            },
        })?;
        debug!("registry: instantiated tool '{}'", name);
        inner.instances.insert(name.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Whether the tool's results default to cacheable: the spec override
    /// wins, else the factory default for its type, else false. Consulted
    /// without instantiating the tool.
    pub fn default_cacheable(&self, spec: &ToolSpec) -> bool {
        if let Some(flag) = spec.cacheable {
            return flag;
        }
        let inner = self.read();
        if let Some(instance) = inner.instances.get(&spec.name) {
            return instance.cacheable();
        }
        inner
            .factories
            .get(&spec.tool_type)
            .is_some_and(|f| f.default_cacheable())
    }

    /// Sorted tool names, optionally filtered by category. Category
    /// listings load the matching catalog's specs but never instantiate.
    pub fn list_names(&self, category: Option<&str>) -> Vec<String> {
        if let Some(category) = category
            && let Err(e) = self.load_catalog(category)
        {
            warn!("registry: failed to load catalog '{}': {}", category, e);
        }
        let inner = self.read();
        let mut names: Vec<String> = inner
            .specs
            .values()
            .filter(|spec| category.is_none_or(|c| spec.category.as_deref() == Some(c)))
            .map(|spec| spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every known spec, loading all attached catalogs first.
    pub fn list_specs(&self) -> Vec<Arc<ToolSpec>> {
        if let Err(e) = self.load_catalogs_until(|_| false) {
            warn!("registry: catalog load failed during listing: {}", e);
        }
        let mut specs: Vec<Arc<ToolSpec>> = self.read().specs.values().cloned().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn categories(&self) -> Vec<String> {
        let inner = self.read();
        let mut categories: Vec<String> = inner.catalogs.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Re-read all loaded catalogs, replacing changed specs and dropping
    /// cached instances whose spec hash changed. Returns the number of
    /// tools that changed.
    pub fn refresh(&self) -> Result<usize> {
        let loaded: Vec<(String, PathBuf)> = {
            let inner = self.read();
            inner
                .loaded_catalogs
                .iter()
                .filter_map(|c| inner.catalogs.get(c).map(|p| (c.clone(), p.clone())))
                .collect()
        };

        let mut changed = 0;
        for (category, path) in loaded {
            let specs = read_catalog_file(&path, &category)?;
            let mut inner = self.write();
            for spec in specs {
                let replace = inner
                    .specs
                    .get(&spec.name)
                    .is_none_or(|old| old.spec_hash() != spec.spec_hash());
                if replace {
                    info!("registry: spec changed for '{}', dropping instance", spec.name);
                    inner.instances.remove(&spec.name);
                    inner.specs.insert(spec.name.clone(), Arc::new(spec));
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            self.persist_spec_hashes();
        }
        Ok(changed)
    }

    /// Write the name → spec-hash map to the configured sidecar.
    pub fn persist_spec_hashes(&self) {
        let Some(path) = &self.spec_hash_path else {
            return;
        };
        let hashes: HashMap<String, String> = self
            .read()
            .specs
            .values()
            .map(|spec| (spec.name.clone(), spec.spec_hash()))
            .collect();
        let payload = match serde_json::to_string_pretty(&hashes) {
            Ok(p) => p,
            Err(e) => {
                warn!("registry: failed to serialize spec hashes: {}", e);
                return;
            }
        };
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!("registry: failed to create {} parent: {}", path.display(), e);
            return;
        }
        if let Err(e) = std::fs::write(path, payload) {
            warn!("registry: failed to write spec hashes to {}: {}", path.display(), e);
        }
    }

    /// Names whose current spec hash differs from the persisted sidecar
    /// (or are absent from it). Incremental rebuilds regenerate only these.
    pub fn changed_since_last_build(&self) -> Vec<String> {
        let Some(path) = &self.spec_hash_path else {
            return self.read().specs.keys().cloned().collect();
        };
        let previous: HashMap<String, String> = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let mut changed: Vec<String> = self
            .read()
            .specs
            .values()
            .filter(|spec| previous.get(&spec.name) != Some(&spec.spec_hash()))
            .map(|spec| spec.name.clone())
            .collect();
        changed.sort();
        changed
    }

    /// Drop all cached instances, releasing their connections. Specs and
    /// factories survive; instances rebuild lazily.
    pub fn close(&self) {
        let mut inner = self.write();
        let dropped = inner.instances.len();
        inner.instances.clear();
        debug!("registry: released {} tool instances", dropped);
    }

    fn load_catalog(&self, category: &str) -> Result<()> {
        let path = {
            let inner = self.read();
            if inner.loaded_catalogs.contains(category) {
                return Ok(());
            }
            inner.catalogs.get(category).cloned()
        };
        let Some(path) = path else {
            return Ok(());
        };
        let specs = read_catalog_file(&path, category)?;
        let mut inner = self.write();
        for spec in specs {
            inner
                .specs
                .entry(spec.name.clone())
                .or_insert_with(|| Arc::new(spec));
        }
        inner.loaded_catalogs.insert(category.to_string());
        Ok(())
    }

    /// Load unloaded catalogs one by one until `done` is satisfied (or all
    /// are loaded). Used to resolve a name whose owning catalog is unknown.
    fn load_catalogs_until(
        &self,
        done: impl Fn(&RegistryInner) -> bool,
    ) -> Result<()> {
        loop {
            let pending: Option<String> = {
                let inner = self.read();
                if done(&inner) {
                    return Ok(());
                }
                inner
                    .catalogs
                    .keys()
                    .find(|c| !inner.loaded_catalogs.contains(*c))
                    .cloned()
            };
            let Some(category) = pending else {
                return Ok(());
            };
            self.load_catalog(&category)?;
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a catalog file: a JSON array of specs. Specs without a category
/// inherit the catalog's name. Invalid entries are skipped with a warning
/// rather than poisoning the whole catalog.
fn read_catalog_file(path: &Path, category: &str) -> Result<Vec<ToolSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
    let entries: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("Catalog is not a JSON array: {}", path.display()))?;

    let mut specs = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<ToolSpec>(entry) {
            Ok(mut spec) => {
                if spec.category.is_none() {
                    spec.category = Some(category.to_string());
                }
                if let Err(e) = spec.validate() {
                    warn!("catalog {}: skipping invalid spec: {}", path.display(), e);
                    continue;
                }
                specs.push(spec);
            }
            Err(e) => {
                warn!("catalog {}: skipping unparseable entry: {}", path.display(), e);
            }
        }
    }
    Ok(specs)
}

#[cfg(test)]
mod tests;
