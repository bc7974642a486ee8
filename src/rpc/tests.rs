use super::*;
use crate::cache::ResultCacheManager;
use crate::config::CacheConfig;
use crate::hooks::HookManager;
use crate::registry::ToolRegistry;
use crate::tools::{ExecutionContext, Tool, ToolSpec};
use async_trait::async_trait;
use serde_json::json;

struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }
    async fn execute(&self, arguments: Value, _ctx: &ExecutionContext) -> anyhow::Result<Value> {
        let a = arguments["a"].as_i64().unwrap_or(0);
        let b = arguments["b"].as_i64().unwrap_or(0);
        Ok(json!({"sum": a + b}))
    }
}

fn test_server() -> RpcServer {
    let registry = Arc::new(ToolRegistry::new());
    let mut spec = ToolSpec::new("add", "Math");
    spec.description = "Add two integers.".to_string();
    spec.parameter = json!({
        "type": "object",
        "properties": {
            "a": {"type": "integer"},
            "b": {"type": "integer"}
        },
        "required": ["a", "b"]
    });
    registry.register_instance(spec, Arc::new(AddTool)).unwrap();

    let cache_config = CacheConfig {
        enabled: true,
        persist: false,
        ..CacheConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        Arc::new(ResultCacheManager::new(&cache_config)),
        Arc::new(HookManager::disabled()),
    ));
    let finder = Arc::new(ToolFinder::new(Arc::clone(dispatcher.registry())));
    RpcServer::new(dispatcher, finder, "test-server")
}

fn request(id: Value, method: &str, params: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string()
}

#[tokio::test]
async fn initialize_negotiates_protocol() {
    let server = test_server();
    let response = server
        .handle_frame(&request(json!(1), "initialize", json!({})))
        .await
        .unwrap();
    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
    assert_eq!(response["result"]["serverInfo"]["name"], "test-server");
}

#[tokio::test]
async fn tools_list_projects_input_schema() {
    let server = test_server();
    let response = server
        .handle_frame(&request(json!(2), "tools/list", json!({})))
        .await
        .unwrap();
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "add");
    assert_eq!(tools[0]["inputSchema"]["properties"]["a"]["type"], "integer");
}

#[tokio::test]
async fn tools_call_returns_mcp_content_envelope() {
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(3),
            "tools/call",
            json!({"name": "add", "arguments": {"a": 2, "b": 3}}),
        ))
        .await
        .unwrap();
    let content = &response["result"]["content"][0];
    assert_eq!(content["type"], "text");
    let payload: Value = serde_json::from_str(content["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["sum"], 5);
}

#[tokio::test]
async fn tools_call_parses_string_encoded_arguments() {
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(4),
            "tools/call",
            json!({"name": "add", "arguments": "{\"a\": 1, \"b\": 1}"}),
        ))
        .await
        .unwrap();
    let payload: Value =
        serde_json::from_str(response["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["sum"], 2);
}

#[tokio::test]
async fn tools_call_coerces_string_scalars() {
    // RPC surface validates leniently: "2" is accepted for an integer.
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(5),
            "tools/call",
            json!({"name": "add", "arguments": {"a": "2", "b": "3"}}),
        ))
        .await
        .unwrap();
    let payload: Value =
        serde_json::from_str(response["result"]["content"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(payload["sum"], 5);
}

#[tokio::test]
async fn validation_failure_maps_to_invalid_params() {
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(6),
            "tools/call",
            json!({"name": "add", "arguments": {"a": 1}}),
        ))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], INVALID_PARAMS);
    assert_eq!(response["error"]["data"]["type"], "ValidationError");
    assert!(
        response["error"]["data"]["next_steps"]
            .as_array()
            .is_some_and(|s| !s.is_empty())
    );
}

#[tokio::test]
async fn unknown_tool_maps_to_method_not_found_code() {
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(7),
            "tools/call",
            json!({"name": "ghost", "arguments": {}}),
        ))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    assert_eq!(response["error"]["data"]["type"], "ToolNotFound");
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let server = test_server();
    let response = server
        .handle_frame(&request(json!(8), "tools/destroy", json!({})))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
}

#[tokio::test]
async fn parse_error_is_reported_with_null_id() {
    let server = test_server();
    let response = server.handle_frame("{not json").await.unwrap();
    assert_eq!(response["error"]["code"], PARSE_ERROR);
    assert_eq!(response["id"], Value::Null);
}

#[tokio::test]
async fn notification_gets_no_response() {
    let server = test_server();
    let frame = json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string();
    assert!(server.handle_frame(&frame).await.is_none());
}

#[tokio::test]
async fn request_ids_are_preserved_for_string_ids() {
    let server = test_server();
    let response = server
        .handle_frame(&request(json!("req-42"), "tools/list", json!({})))
        .await
        .unwrap();
    assert_eq!(response["id"], "req-42");
}

#[tokio::test]
async fn tools_find_detailed_envelope() {
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(9),
            "tools/find",
            json!({"query": "add integers", "search_method": "keyword", "limit": 5}),
        ))
        .await
        .unwrap();
    let result = &response["result"];
    assert_eq!(result["query"], "add integers");
    assert_eq!(result["total"], 1);
    assert_eq!(result["tools"][0]["name"], "add");
}

#[tokio::test]
async fn tools_find_mcp_standard_envelope() {
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(10),
            "tools/find",
            json!({"query": "add", "format": "mcp_standard"}),
        ))
        .await
        .unwrap();
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools[0]["name"], "add");
    assert!(tools[0]["inputSchema"].is_object());
}

#[tokio::test]
async fn tools_find_empty_query_is_invalid_params() {
    let server = test_server();
    let response = server
        .handle_frame(&request(json!(11), "tools/find", json!({"query": ""})))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], INVALID_PARAMS);
}

#[tokio::test]
async fn unknown_search_method_falls_back_to_keyword() {
    let server = test_server();
    let response = server
        .handle_frame(&request(
            json!(12),
            "tools/find",
            json!({"query": "add", "search_method": "telepathy"}),
        ))
        .await
        .unwrap();
    assert_eq!(response["result"]["tools"][0]["name"], "add");
}

#[tokio::test]
async fn responses_are_single_line_frames() {
    // Stdio discipline: every serialized response must be one line.
    let server = test_server();
    for (method, params) in [
        ("initialize", json!({})),
        ("tools/list", json!({})),
        ("tools/call", json!({"name": "add", "arguments": {"a": 1, "b": 2}})),
        ("nope", json!({})),
    ] {
        let response = server
            .handle_frame(&request(json!(1), method, params))
            .await
            .unwrap();
        assert!(!response.to_string().contains('\n'));
    }
}
