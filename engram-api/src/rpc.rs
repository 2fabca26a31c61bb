//! JSON-RPC over stdio
//!
//! One request per line; responses are written one per line in completion
//! order. Handlers run concurrently; a dedicated writer task keeps stdout
//! frames whole. Oversized frames are rejected before parsing.

use crate::dispatch::{Dispatcher, ToolRequest};
use crate::tools::tool_catalog;
use engram_core::ValidationError;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Maximum accepted stdin frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn rpc_result(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_error(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

fn to_tool_request(rpc: &RpcRequest) -> ToolRequest {
    let action = rpc
        .params
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("get")
        .to_string();
    let agent_id = rpc
        .params
        .get("agent_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    ToolRequest {
        tool: rpc.method.clone(),
        action,
        agent_id,
        params: rpc.params.clone(),
    }
}

async fn handle_line(dispatcher: &Dispatcher, line: &str) -> Value {
    let rpc: RpcRequest = match serde_json::from_str(line) {
        Ok(rpc) => rpc,
        Err(e) => return rpc_error(None, -32700, &format!("parse error: {e}")),
    };
    let id = rpc.id.clone();
    if rpc.method == "tools/list" {
        return rpc_result(id, json!({ "tools": tool_catalog() }));
    }
    let result = dispatcher.dispatch(to_tool_request(&rpc)).await;
    rpc_result(id, result)
}

/// Run the stdio transport until stdin closes.
pub async fn serve_stdio(dispatcher: Dispatcher) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    // Writer task: one frame per line, never interleaved.
    let (out_tx, mut out_rx) = mpsc::channel::<Value>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = out_rx.recv().await {
            let mut frame = response.to_string();
            frame.push('\n');
            if stdout.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if line.len() > MAX_FRAME_BYTES {
            let err: engram_core::EngramError = ValidationError::FrameTooLarge {
                size: line.len(),
                max: MAX_FRAME_BYTES,
            }
            .into();
            let _ = out_tx
                .send(rpc_error(None, -32600, &err.to_string()))
                .await;
            continue;
        }
        let dispatcher = dispatcher.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let response = handle_line(&dispatcher, &line).await;
            let _ = out_tx.send(response).await;
        });
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{build_app_context, shutdown};

    async fn dispatcher() -> (Dispatcher, std::sync::Arc<crate::runtime::AppContext>) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = build_app_context(crate::runtime::tests::test_config(dir.path()))
            .await
            .unwrap();
        std::mem::forget(dir); // keep the sqlite file alive for the test
        (Dispatcher::new(ctx.clone()), ctx)
    }

    #[tokio::test]
    async fn test_tools_list() {
        let (dispatcher, ctx) = dispatcher().await;
        let response = handle_line(
            &dispatcher,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{}}"#,
        )
        .await;
        assert_eq!(response["id"], 1);
        assert!(response["result"]["tools"].as_array().unwrap().len() >= 15);
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn test_create_and_get_over_rpc() {
        let (dispatcher, ctx) = dispatcher().await;
        let create = handle_line(
            &dispatcher,
            r#"{"jsonrpc":"2.0","id":2,"method":"guideline","params":{
                "action":"create","agent_id":"agent-a","name":"sql-params",
                "scope":{"type":"global"},"content":"use parameterized queries",
                "priority":95}}"#,
        )
        .await;
        assert_eq!(create["result"]["success"], true, "create failed: {create}");
        let entry_id = create["result"]["entry"]["entry_id"].as_str().unwrap();

        let get = handle_line(
            &dispatcher,
            &format!(
                r#"{{"jsonrpc":"2.0","id":3,"method":"guideline","params":{{
                    "action":"get","agent_id":"agent-a","id":"{entry_id}"}}}}"#
            ),
        )
        .await;
        assert_eq!(get["result"]["success"], true);
        assert_eq!(get["result"]["entry"]["name"], "sql-params");
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn test_parse_error_is_structured() {
        let (dispatcher, ctx) = dispatcher().await;
        let response = handle_line(&dispatcher, "not json").await;
        assert_eq!(response["error"]["code"], -32700);
        shutdown(&ctx).await;
    }

    #[tokio::test]
    async fn test_missing_agent_id_rejected() {
        let (dispatcher, ctx) = dispatcher().await;
        let response = handle_line(
            &dispatcher,
            r#"{"jsonrpc":"2.0","id":4,"method":"guideline","params":{"action":"list","scope":{"type":"global"}}}"#,
        )
        .await;
        assert_eq!(response["result"]["success"], false);
        assert_eq!(response["result"]["error"]["code"], 1001);
        shutdown(&ctx).await;
    }
}
