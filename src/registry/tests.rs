use super::*;
use crate::tools::ExecutionContext;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

struct EchoTool {
    name: String,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }
    async fn execute(&self, arguments: Value, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
        Ok(json!({"echo": arguments}))
    }
}

fn counting_factory(created: Arc<AtomicUsize>) -> Arc<dyn ToolFactory> {
    Arc::new(move |spec: &ToolSpec| -> DispatchResult<Arc<dyn Tool>> {
        created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(EchoTool {
            name: spec.name.clone(),
        }))
    })
}

fn echo_factory() -> Arc<dyn ToolFactory> {
    Arc::new(|spec: &ToolSpec| -> DispatchResult<Arc<dyn Tool>> {
        Ok(Arc::new(EchoTool {
            name: spec.name.clone(),
        }))
    })
}

fn write_catalog(dir: &tempfile::TempDir, name: &str, specs: Value) -> PathBuf {
    let path = dir.path().join(format!("{}.json", name));
    std::fs::write(&path, serde_json::to_string_pretty(&specs).unwrap()).unwrap();
    path
}

#[test]
fn unknown_tool_is_not_found() {
    let registry = ToolRegistry::new();
    let err = registry.get_spec("ghost").unwrap_err();
    assert!(matches!(err, DispatchError::ToolNotFound { .. }));
}

#[test]
fn missing_factory_is_init_error() {
    let registry = ToolRegistry::new();
    registry.register_tool(ToolSpec::new("orphan", "NoSuchType")).unwrap();
    let err = match registry.get_instance("orphan") {
        Ok(_) => panic!("expected get_instance to fail for orphan spec"),
        Err(err) => err,
    };
    assert!(matches!(err, DispatchError::ToolInit { .. }));
}

#[test]
fn instances_are_created_once_and_cached() {
    let registry = ToolRegistry::new();
    let created = Arc::new(AtomicUsize::new(0));
    registry.register_factory("Echo", counting_factory(Arc::clone(&created)));
    registry.register_tool(ToolSpec::new("echo", "Echo")).unwrap();

    let a = registry.get_instance("echo").unwrap();
    let b = registry.get_instance("echo").unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(a.name(), b.name());
}

#[test]
fn register_instance_bypasses_factory() {
    let registry = ToolRegistry::new();
    registry
        .register_instance(
            ToolSpec::new("custom", "Custom"),
            Arc::new(EchoTool {
                name: "custom".into(),
            }),
        )
        .unwrap();
    assert!(registry.get_instance("custom").is_ok());
}

#[test]
fn lazy_catalog_listing_does_not_instantiate() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(
        &dir,
        "demo",
        json!([
            {"name": "demo_a", "type": "Echo", "description": "first"},
            {"name": "demo_b", "type": "Echo", "description": "second"}
        ]),
    );
    let registry = ToolRegistry::new();
    registry.add_catalog_dir(dir.path()).unwrap();

    let names = registry.list_names(Some("demo"));
    assert_eq!(names, vec!["demo_a", "demo_b"]);
    // No factory registered: listing must not have tried to instantiate.
    assert!(registry.get_spec("demo_a").is_ok());
}

#[test]
fn get_instance_loads_owning_catalog() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(
        &dir,
        "demo",
        json!([{"name": "demo_tool", "type": "Echo"}]),
    );
    let registry = ToolRegistry::new();
    registry.register_factory("Echo", echo_factory());
    registry.add_catalog_dir(dir.path()).unwrap();

    let instance = registry.get_instance("demo_tool").unwrap();
    assert_eq!(instance.name(), "demo_tool");
}

#[test]
fn catalog_skips_invalid_entries() {
    let dir = tempfile::tempdir().unwrap();
    write_catalog(
        &dir,
        "mixed",
        json!([
            {"name": "good", "type": "Echo"},
            {"name": "bad", "type": "Echo", "batch_max_concurrency": 0},
            {"not": "a spec"}
        ]),
    );
    let registry = ToolRegistry::new();
    registry.add_catalog_dir(dir.path()).unwrap();
    assert_eq!(registry.list_names(Some("mixed")), vec!["good"]);
}

#[test]
fn refresh_drops_instances_for_changed_specs() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_catalog(
        &dir,
        "demo",
        json!([{"name": "demo_tool", "type": "Echo", "description": "v1"}]),
    );
    let registry = ToolRegistry::new();
    registry.register_factory("Echo", echo_factory());
    registry.add_catalog_dir(dir.path()).unwrap();
    registry.get_instance("demo_tool").unwrap();

    // Unchanged catalog: refresh is a no-op.
    assert_eq!(registry.refresh().unwrap(), 0);

    std::fs::write(
        &path,
        serde_json::to_string(&json!([
            {"name": "demo_tool", "type": "Echo", "description": "v2"}
        ]))
        .unwrap(),
    )
    .unwrap();
    assert_eq!(registry.refresh().unwrap(), 1);
    assert_eq!(
        registry.get_spec("demo_tool").unwrap().description,
        "v2"
    );
}

#[test]
fn spec_hash_sidecar_tracks_changes() {
    let dir = tempfile::tempdir().unwrap();
    let sidecar = dir.path().join("spec_hashes.json");
    let registry = ToolRegistry::new().with_spec_hash_path(sidecar.clone());
    registry.register_tool(ToolSpec::new("a", "T")).unwrap();
    registry.register_tool(ToolSpec::new("b", "T")).unwrap();

    // Nothing persisted yet: everything counts as changed.
    assert_eq!(registry.changed_since_last_build(), vec!["a", "b"]);
    registry.persist_spec_hashes();
    assert!(registry.changed_since_last_build().is_empty());

    let mut changed = ToolSpec::new("a", "T");
    changed.description = "updated".into();
    registry.register_tool(changed).unwrap();
    assert_eq!(registry.changed_since_last_build(), vec!["a"]);
}

#[test]
fn default_cacheable_prefers_spec_override() {
    let registry = ToolRegistry::new();
    registry.register_factory("Echo", echo_factory());
    let mut spec = ToolSpec::new("echo", "Echo");
    spec.cacheable = Some(true);
    registry.register_tool(spec).unwrap();
    assert!(registry.default_cacheable(&registry.get_spec("echo").unwrap()));

    registry.register_tool(ToolSpec::new("plain", "Echo")).unwrap();
    assert!(!registry.default_cacheable(&registry.get_spec("plain").unwrap()));
}

#[test]
fn close_releases_instances() {
    let registry = ToolRegistry::new();
    let created = Arc::new(AtomicUsize::new(0));
    registry.register_factory("Echo", counting_factory(Arc::clone(&created)));
    registry.register_tool(ToolSpec::new("echo", "Echo")).unwrap();
    registry.get_instance("echo").unwrap();
    registry.close();
    registry.get_instance("echo").unwrap();
    assert_eq!(created.load(Ordering::SeqCst), 2);
}
