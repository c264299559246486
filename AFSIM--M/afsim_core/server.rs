use serde_json::{json, Value};
use shared_logging::LogLevel;

use crate::{
    helper::ServiceTelemetry,
    tools::{is_error, ToolRouter},
};

/// Protocol revision announced by `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
/// Name announced by `initialize`.
pub const SERVER_NAME: &str = "afsim-mcp";

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// JSON-RPC 2.0 front of the tool router.
#[derive(Debug, Clone)]
pub struct McpServer {
    router: ToolRouter,
    telemetry: Option<ServiceTelemetry>,
}

impl McpServer {
    /// Wraps a router.
    #[must_use]
    pub fn new(router: ToolRouter) -> Self {
        let telemetry = router.state().telemetry().map(|tel| tel.scoped("server"));
        Self { router, telemetry }
    }

    /// Underlying router.
    #[must_use]
    pub const fn router(&self) -> &ToolRouter {
        &self.router
    }

    /// Handles one line of the stdio stream.
    ///
    /// Unparseable input yields a parse error with a null id.
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(line) {
            Ok(request) => self.handle_request(&request).await,
            Err(err) => {
                self.log(LogLevel::Warn, "rpc.parse_failed", json!({ "error": err.to_string() }));
                Some(error_response(&Value::Null, PARSE_ERROR, &format!("Parse error: {err}")))
            }
        }
    }

    /// Handles one decoded request. Notifications (no id) get no response.
    pub async fn handle_request(&self, request: &Value) -> Option<Value> {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let notification = id.is_null();
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return (!notification)
                .then(|| error_response(&id, INVALID_REQUEST, "Invalid request: missing method"));
        };
        self.log(LogLevel::Debug, "rpc.request", json!({ "method": method, "id": id }));

        let outcome = match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
                "capabilities": { "tools": {} },
            })),
            "tools/list" => Ok(json!({ "tools": self.router.specs() })),
            "tools/call" => self.call_tool(request.get("params")).await,
            "ping" => Ok(json!({})),
            other if notification => {
                self.log(LogLevel::Debug, "rpc.notification", json!({ "method": other }));
                return None;
            }
            other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        };
        if notification {
            return None;
        }
        Some(match outcome {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error_response(&id, code, &message),
        })
    }

    async fn call_tool(&self, params: Option<&Value>) -> Result<Value, (i64, String)> {
        let Some(name) = params
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str)
        else {
            return Err((INVALID_PARAMS, "Invalid params: missing tool name".to_owned()));
        };
        let empty = json!({});
        let arguments = params
            .and_then(|params| params.get("arguments"))
            .filter(|args| !args.is_null())
            .unwrap_or(&empty);
        let result = self.router.call(name, arguments).await;
        let failed = is_error(&result);
        let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "isError": failed,
        }))
    }

    fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(level, message, metadata);
        }
    }
}

fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ServerConfig, runtime::AppState};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn server() -> (tempfile::TempDir, McpServer) {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            state_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let state = Arc::new(AppState::builder(config).build().unwrap());
        (dir, McpServer::new(ToolRouter::new(state)))
    }

    #[tokio::test]
    async fn initialize_announces_protocol() {
        let (_dir, server) = server();
        let response = server
            .handle_request(&json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }))
            .await
            .unwrap();
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["result"]["protocolVersion"], json!("2024-11-05"));
        assert_eq!(response["result"]["serverInfo"]["name"], json!("afsim-mcp"));
        assert!(response["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_and_call() {
        let (_dir, server) = server();
        let listed = server
            .handle_request(&json!({ "jsonrpc": "2.0", "id": "a", "method": "tools/list" }))
            .await
            .unwrap();
        assert_eq!(listed["result"]["tools"].as_array().unwrap().len(), 39);
        assert!(listed["result"]["tools"][0]["inputSchema"].is_object());

        let called = server
            .handle_request(&json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "create_scenario", "arguments": { "name": "rpc" } },
            }))
            .await
            .unwrap();
        assert_eq!(called["result"]["isError"], json!(false));
        let text = called["result"]["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["name"], json!("rpc"));
    }

    #[tokio::test]
    async fn tool_failures_set_is_error() {
        let (_dir, server) = server();
        let called = server
            .handle_request(&json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "get_simulation_status", "arguments": { "run_id": "missing" } },
            }))
            .await
            .unwrap();
        assert_eq!(called["result"]["isError"], json!(true));
        assert!(called["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("error"));

        let no_name = server
            .handle_request(&json!({ "jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {} }))
            .await
            .unwrap();
        assert_eq!(no_name["error"]["code"], json!(-32602));
    }

    #[tokio::test]
    async fn unknown_methods_and_notifications() {
        let (_dir, server) = server();
        let unknown = server
            .handle_request(&json!({ "jsonrpc": "2.0", "id": 5, "method": "resources/list" }))
            .await
            .unwrap();
        assert_eq!(unknown["error"]["code"], json!(-32601));

        let note = server
            .handle_request(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
            .await;
        assert!(note.is_none());

        let pong = server
            .handle_request(&json!({ "jsonrpc": "2.0", "id": 6, "method": "ping" }))
            .await
            .unwrap();
        assert_eq!(pong["result"], json!({}));
    }

    #[tokio::test]
    async fn malformed_lines_get_parse_errors() {
        let (_dir, server) = server();
        let response = server.handle_line("{not json").await.unwrap();
        assert_eq!(response["error"]["code"], json!(-32700));
        assert!(response["id"].is_null());
    }
}
