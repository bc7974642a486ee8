use super::*;
use serde_json::json;

#[test]
fn spec_parses_from_catalog_json() {
    let spec: ToolSpec = serde_json::from_value(json!({
        "name": "UniProt_get_entry",
        "type": "RestTool",
        "description": "Fetch a UniProt entry by accession.",
        "parameter": {
            "type": "object",
            "properties": {"accession": {"type": "string"}},
            "required": ["accession"]
        },
        "cacheable": true,
        "cache_ttl_seconds": 3600,
        "batch_max_concurrency": 4,
        "category": "uniprot"
    }))
    .unwrap();
    assert_eq!(spec.name, "UniProt_get_entry");
    assert_eq!(spec.tool_type, "RestTool");
    assert_eq!(spec.batch_max_concurrency, Some(4));
    spec.validate().unwrap();
}

#[test]
fn spec_rejects_zero_concurrency() {
    let mut spec = ToolSpec::new("t", "T");
    spec.batch_max_concurrency = Some(0);
    assert!(spec.validate().is_err());
}

#[test]
fn spec_rejects_negative_concurrency_at_parse() {
    let parsed: Result<ToolSpec, _> = serde_json::from_value(json!({
        "name": "t",
        "type": "T",
        "batch_max_concurrency": -2
    }));
    assert!(parsed.is_err());
}

#[test]
fn spec_rejects_undeclared_required_field() {
    let mut spec = ToolSpec::new("t", "T");
    spec.parameter = json!({
        "type": "object",
        "properties": {"a": {"type": "string"}},
        "required": ["a", "ghost"]
    });
    let err = spec.validate().unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[test]
fn spec_rejects_control_chars_in_name() {
    let spec = ToolSpec::new("bad\nname", "T");
    assert!(spec.validate().is_err());
}

#[test]
fn spec_hash_changes_with_schema() {
    let mut a = ToolSpec::new("t", "T");
    let b = ToolSpec::new("t", "T");
    assert_eq!(a.spec_hash(), b.spec_hash());
    a.parameter = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
    assert_ne!(a.spec_hash(), b.spec_hash());
}

#[test]
fn cache_version_tag_prefers_declared_version() {
    let mut spec = ToolSpec::new("t", "T");
    assert_eq!(spec.cache_version_tag(), spec.spec_hash());
    spec.cache_version = Some("2".into());
    assert_eq!(spec.cache_version_tag(), "2");
}

#[test]
fn effective_timeout_prefers_spec() {
    let mut spec = ToolSpec::new("t", "T");
    let fallback = Duration::from_secs(120);
    assert_eq!(spec.effective_timeout(fallback), fallback);
    spec.timeout_seconds = Some(5);
    assert_eq!(spec.effective_timeout(fallback), Duration::from_secs(5));
}
