//! End-to-end pipeline: catalog-loaded specs, factory instantiation,
//! batch execution, hook offload, and the RPC projection working against
//! one runtime.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use tooluniverse::config::{CacheConfig, Config, HooksConfig};
use tooluniverse::dispatch::{FunctionCall, RunOptions};
use tooluniverse::errors::DispatchResult;
use tooluniverse::hooks::{HookConditions, HookConfig, LengthCondition};
use tooluniverse::rpc::RpcServer;
use tooluniverse::runtime::Runtime;
use tooluniverse::tools::{ExecutionContext, Tool, ToolFactory, ToolSpec};

/// Repeats a phrase; output size is controlled by the `repeat` argument.
struct RepeaterTool {
    name: String,
}

#[async_trait]
impl Tool for RepeaterTool {
    fn name(&self) -> &str {
        &self.name
    }
    async fn execute(&self, arguments: Value, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
        let phrase = arguments["phrase"].as_str().unwrap_or("tick");
        let repeat = arguments["repeat"].as_u64().unwrap_or(1) as usize;
        Ok(json!({"text": phrase.repeat(repeat)}))
    }
}

fn repeater_factory() -> Arc<dyn ToolFactory> {
    Arc::new(|spec: &ToolSpec| -> DispatchResult<Arc<dyn Tool>> {
        Ok(Arc::new(RepeaterTool {
            name: spec.name.clone(),
        }))
    })
}

fn write_catalog(dir: &std::path::Path) -> PathBuf {
    let catalog = json!([{
        "name": "repeater",
        "type": "Repeater",
        "description": "Repeat a phrase a number of times.",
        "parameter": {
            "type": "object",
            "properties": {
                "phrase": {"type": "string"},
                "repeat": {"type": "integer"}
            },
            "required": ["phrase"]
        }
    }]);
    let path = dir.join("text.json");
    std::fs::write(&path, serde_json::to_string_pretty(&catalog).unwrap()).unwrap();
    path
}

fn runtime_with_file_save(output_dir: &std::path::Path) -> Arc<Runtime> {
    let config = Config {
        cache: CacheConfig {
            enabled: true,
            persist: false,
            ..CacheConfig::default()
        },
        hooks: HooksConfig {
            enabled: true,
            hooks: vec![HookConfig {
                name: "offload_large_outputs".to_string(),
                hook_type: "FileSaveHook".to_string(),
                enabled: true,
                priority: 10,
                conditions: HookConditions {
                    output_length: Some(LengthCondition {
                        operator: ">".to_string(),
                        threshold: 1000,
                    }),
                    tool_names: None,
                },
                hook_config: json!({"temp_dir": output_dir, "file_prefix": "repeat"}),
            }],
            tool_overrides: std::collections::HashMap::new(),
        },
        ..Config::default()
    };
    Runtime::new(config).unwrap()
}

#[tokio::test]
async fn catalog_batch_and_hook_offload() {
    let catalog_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    write_catalog(catalog_dir.path());

    let runtime = runtime_with_file_save(output_dir.path());
    runtime.registry().register_factory("Repeater", repeater_factory());
    runtime.registry().add_catalog_dir(catalog_dir.path()).unwrap();

    // Small output: hook condition unmet, payload passes through.
    let small = runtime
        .run_one(&FunctionCall::new("repeater", json!({"phrase": "hi", "repeat": 3})))
        .await;
    assert_eq!(small["text"], "hihihi");

    // Large output: replaced by a file descriptor.
    let large = runtime
        .run_one(&FunctionCall::new(
            "repeater",
            json!({"phrase": "data ", "repeat": 500}),
        ))
        .await;
    assert!(large["file_path"].is_string());
    assert_eq!(large["data_format"], "json");
    let saved = std::fs::read_to_string(large["file_path"].as_str().unwrap()).unwrap();
    assert!(saved.contains("data data"));

    // Batch over the same catalog tool preserves order and dedups.
    let calls = vec![
        FunctionCall::new("repeater", json!({"phrase": "a", "repeat": 1})),
        FunctionCall::new("repeater", json!({"phrase": "a", "repeat": 1})),
        FunctionCall::new("repeater", json!({"phrase": "b", "repeat": 1})),
    ];
    let messages = runtime.run(&calls, &RunOptions::standard(), 4).await;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role, "assistant");
    let texts: Vec<String> = messages[1..]
        .iter()
        .map(|m| {
            let record: Value = serde_json::from_str(&m.content).unwrap();
            record["content"]["text"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(texts, vec!["a", "a", "b"]);

    runtime.close();
}

#[tokio::test]
async fn rpc_surface_projects_catalog_tools() {
    let catalog_dir = tempfile::tempdir().unwrap();
    write_catalog(catalog_dir.path());

    let config = Config {
        cache: CacheConfig {
            enabled: true,
            persist: false,
            ..CacheConfig::default()
        },
        ..Config::default()
    };
    let runtime = Runtime::new(config).unwrap();
    runtime.registry().register_factory("Repeater", repeater_factory());
    runtime.registry().add_catalog_dir(catalog_dir.path()).unwrap();

    let server = RpcServer::new(
        Arc::clone(runtime.dispatcher()),
        Arc::clone(runtime.finder()),
        "integration",
    );

    let list = server
        .handle_frame(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}}).to_string())
        .await
        .unwrap();
    assert_eq!(list["result"]["tools"][0]["name"], "repeater");

    let call = server
        .handle_frame(
            &json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": {"name": "repeater", "arguments": {"phrase": "x", "repeat": "4"}}
            })
            .to_string(),
        )
        .await
        .unwrap();
    let payload: Value =
        serde_json::from_str(call["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["text"], "xxxx");

    let found = server
        .handle_frame(
            &json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/find",
                "params": {"query": "repeat a phrase", "search_method": "keyword"}
            })
            .to_string(),
        )
        .await
        .unwrap();
    assert_eq!(found["result"]["tools"][0]["name"], "repeater");

    runtime.close();
}
