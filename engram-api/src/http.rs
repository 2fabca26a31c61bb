//! HTTP transport
//!
//! The equivalent surface to stdio: `POST /tools/{tool}` carries the same
//! action-discriminated body, plus `GET /health` and `GET /tools`. A
//! keyed per-IP limiter guards the transport edge; the per-agent token
//! bucket inside the dispatcher still applies on top.

use crate::dispatch::{Dispatcher, ToolRequest};
use crate::runtime::AppContext;
use crate::tools::tool_catalog;
use axum::error_handling::HandleErrorLayer;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

type IpLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Requests per minute per client IP at the transport edge.
const HTTP_RATE_PER_MINUTE: u32 = 600;

#[derive(Clone)]
struct HttpState {
    dispatcher: Dispatcher,
    limiter: Arc<IpLimiter>,
}

/// Map the envelope's numeric error code onto an HTTP status.
fn status_for(body: &Value) -> StatusCode {
    if body.get("success").and_then(Value::as_bool).unwrap_or(false) {
        return StatusCode::OK;
    }
    let code = body
        .pointer("/error/code")
        .and_then(Value::as_u64)
        .unwrap_or(5001);
    match code {
        1000..=1999 => StatusCode::BAD_REQUEST,
        2001 => StatusCode::NOT_FOUND,
        2002 | 2003 | 2004 | 3000..=3999 => StatusCode::CONFLICT,
        6001 => StatusCode::FORBIDDEN,
        6002 => StatusCode::TOO_MANY_REQUESTS,
        4000..=4999 | 5000..=5999 => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn call_tool(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(tool): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if state.limiter.check_key(&addr.ip()).is_err() {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "success": false,
                "error": { "code": 6002, "message": "transport rate limit exceeded" }
            })),
        )
            .into_response();
    }

    let action = body
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("get")
        .to_string();
    let agent_id = body
        .get("agent_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let result = state
        .dispatcher
        .dispatch(ToolRequest {
            tool,
            action,
            agent_id,
            params: body,
        })
        .await;
    (status_for(&result), Json(result)).into_response()
}

async fn health(State(state): State<HttpState>) -> Response {
    let health = state.dispatcher.context().health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

async fn list_tools() -> Json<Value> {
    Json(json!({ "tools": tool_catalog() }))
}

/// Build the router over an AppContext.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let quota = Quota::per_minute(NonZeroU32::new(HTTP_RATE_PER_MINUTE).expect("non-zero"));
    let state = HttpState {
        dispatcher: Dispatcher::new(ctx),
        limiter: Arc::new(RateLimiter::keyed(quota)),
    };
    Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/tools/:tool", post(call_tool))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_e: tower::BoxError| async {
                    (
                        StatusCode::GATEWAY_TIMEOUT,
                        Json(json!({
                            "success": false,
                            "error": { "code": 5002, "message": "request timed out" }
                        })),
                    )
                }))
                .timeout(std::time::Duration::from_secs(30)),
        )
        .with_state(state)
}

/// Serve HTTP until ctrl-c.
pub async fn serve_http(ctx: Arc<AppContext>, bind: &str) -> std::io::Result<()> {
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "engram http surface listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&json!({ "success": true })),
            StatusCode::OK
        );
        assert_eq!(
            status_for(&json!({ "success": false, "error": { "code": 1001 } })),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&json!({ "success": false, "error": { "code": 2001 } })),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&json!({ "success": false, "error": { "code": 2002 } })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&json!({ "success": false, "error": { "code": 6001 } })),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&json!({ "success": false, "error": { "code": 6002 } })),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
