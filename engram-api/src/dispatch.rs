//! Tool dispatcher
//!
//! One flat table of `(tool, action)` pairs routes to concrete handlers
//! with typed parameter structs. The dispatcher owns the cross-cutting
//! boundary work: agent identity, rate limiting by operation class, and
//! permission checks for mutating actions.

use crate::response::{error_body, success_body};
use crate::runtime::AppContext;
use crate::tools;
use engram_core::{AgentId, EngramError, EngramResult, ScopeRef};
use engram_repos::GrantAction;
use engram_services::OperationClass;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// One incoming tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub params: Value,
}

fn default_action() -> String {
    "get".to_string()
}

/// Mutating actions; everything else is read-class.
const MUTATING_ACTIONS: &[&str] = &[
    "create", "update", "delete", "deactivate", "reactivate", "attach", "detach", "acquire",
    "release", "extend", "resolve", "cast", "retract", "end", "import", "grant", "revoke",
];

fn operation_class(tool: &str, action: &str) -> OperationClass {
    match (tool, action) {
        ("query", _) => OperationClass::Query,
        ("permission", _) | ("backup", _) | ("init", _) | ("import", _) => OperationClass::Admin,
        (_, action) if MUTATING_ACTIONS.contains(&action) => OperationClass::Write,
        _ => OperationClass::Read,
    }
}

/// Grant needed for this invocation; `None` for read-only surfaces.
/// Policy is enforced at the boundary of every mutating handler.
fn required_grant(tool: &str, action: &str) -> Option<GrantAction> {
    match (tool, action) {
        ("permission", "grant") | ("permission", "revoke") => Some(GrantAction::Admin),
        ("backup", _) | ("import", _) | ("init", _) => Some(GrantAction::Admin),
        (_, action) if MUTATING_ACTIONS.contains(&action) => Some(GrantAction::Write),
        _ => None,
    }
}

#[derive(Deserialize)]
struct ScopedParams {
    scope: Option<ScopeRef>,
}

/// The dispatcher: one per transport, sharing an AppContext.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<AppContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.ctx
    }

    /// Dispatch and envelope. Never panics; every failure is a structured
    /// error body.
    pub async fn dispatch(&self, request: ToolRequest) -> Value {
        match self.execute(request).await {
            Ok(payload) => success_body(payload),
            Err(e) => error_body(&e),
        }
    }

    async fn execute(&self, request: ToolRequest) -> EngramResult<Value> {
        let agent = match request.agent_id.as_deref() {
            Some(raw) => AgentId::new(raw).map_err(|e| {
                EngramError::invalid_value("agent_id", e.to_string())
            })?,
            // Health probes run unauthenticated; everything else names
            // its caller.
            None if request.tool == "health" => AgentId::new("anonymous").expect("valid"),
            None => return Err(EngramError::missing_field("agent_id")),
        };

        self.ctx
            .runtime
            .rate_limiter
            .check(&agent, operation_class(&request.tool, &request.action))?;

        if let Some(needed) = required_grant(&request.tool, &request.action) {
            let scope = serde_json::from_value::<ScopedParams>(request.params.clone())
                .ok()
                .and_then(|p| p.scope)
                .unwrap_or_else(ScopeRef::global);
            let chain = self.ctx.entries.resolve_chain(&scope).await?;
            self.ctx
                .permissions
                .check(&agent, needed, chain.scopes())
                .await?;
        }

        tools::route(&self.ctx, &agent, &request).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_classes() {
        assert_eq!(operation_class("query", "search"), OperationClass::Query);
        assert_eq!(operation_class("guideline", "create"), OperationClass::Write);
        assert_eq!(operation_class("guideline", "get"), OperationClass::Read);
        assert_eq!(operation_class("permission", "grant"), OperationClass::Admin);
    }

    #[test]
    fn test_required_grants() {
        assert_eq!(required_grant("guideline", "get"), None);
        assert_eq!(required_grant("guideline", "create"), Some(GrantAction::Write));
        assert_eq!(
            required_grant("permission", "grant"),
            Some(GrantAction::Admin)
        );
        assert_eq!(required_grant("query", "search"), None);
    }
}
