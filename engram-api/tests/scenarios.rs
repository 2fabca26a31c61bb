//! End-to-end scenarios against a real SQLite-backed context.

use engram_api::{build_app_context, shutdown, AppContext, Dispatcher, ToolRequest};
use engram_core::{
    CacheBackendConfig, EmbeddingConfig, EmbeddingProviderKind, EngramConfig, EntryKind,
    QueryCacheConfig, RateClass, RateLimitConfig, StorageBackendConfig, TxnRetryConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn config(dir: &std::path::Path) -> EngramConfig {
    EngramConfig {
        data_dir: dir.to_path_buf(),
        storage: StorageBackendConfig::Sqlite {
            path: dir.join("engram.db"),
        },
        cache: CacheBackendConfig::Memory,
        environment: "development".into(),
        cursor_secret: "scenario-secret".into(),
        embedding: EmbeddingConfig {
            provider: EmbeddingProviderKind::Disabled,
            model: "stub".into(),
            api_key: String::new(),
            url: String::new(),
            dimension: 8,
            timeout: Duration::from_secs(2),
            max_attempts: 2,
            queue_capacity: 16,
            workers: 1,
        },
        rate_limit: RateLimitConfig {
            enabled: false,
            read: RateClass { per_minute: 120, burst: 10 },
            write: RateClass { per_minute: 60, burst: 10 },
            query: RateClass { per_minute: 120, burst: 10 },
            admin: RateClass { per_minute: 30, burst: 10 },
        },
        txn_retry: TxnRetryConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
        },
        query_cache: QueryCacheConfig {
            max_bytes: 1 << 20,
            ttl: Duration::from_secs(60),
        },
        audit_retention_days: 30,
        http_bind: "127.0.0.1:0".into(),
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    ctx: Arc<AppContext>,
    dispatcher: Dispatcher,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ctx = build_app_context(config(dir.path())).await.unwrap();
        Self {
            _dir: dir,
            dispatcher: Dispatcher::new(ctx.clone()),
            ctx,
        }
    }

    async fn call(&self, tool: &str, action: &str, agent: &str, params: Value) -> Value {
        self.dispatcher
            .dispatch(ToolRequest {
                tool: tool.to_string(),
                action: action.to_string(),
                agent_id: Some(agent.to_string()),
                params,
            })
            .await
    }

    async fn ok(&self, tool: &str, action: &str, agent: &str, params: Value) -> Value {
        let response = self.call(tool, action, agent, params).await;
        assert_eq!(
            response["success"], true,
            "{tool}.{action} failed: {response}"
        );
        response
    }
}

fn names(response: &Value) -> Vec<String> {
    response["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_string())
        .collect()
}

// ============================================================================
// Scenario 1: create and list with inheritance
// ============================================================================

#[tokio::test]
async fn scenario_create_and_query_with_inheritance() {
    let h = Harness::new().await;

    let org = h.ok("org", "create", "admin", json!({ "name": "O" })).await;
    let org_id = org["org"]["org_id"].as_str().unwrap().to_string();
    let project = h
        .ok("project", "create", "admin", json!({ "org_id": org_id, "name": "P" }))
        .await;
    let project_id = project["project"]["project_id"].as_str().unwrap().to_string();

    h.ok(
        "guideline",
        "create",
        "admin",
        json!({
            "name": "g_sec",
            "scope": { "type": "global" },
            "content": "use parameterized queries",
            "priority": 95
        }),
    )
    .await;
    h.ok(
        "guideline",
        "create",
        "admin",
        json!({
            "name": "g_style",
            "scope": { "type": "project", "id": project_id },
            "content": "prefer early returns",
            "priority": 70
        }),
    )
    .await;

    let response = h
        .ok(
            "query",
            "search",
            "admin",
            json!({
                "scope": { "type": "project", "id": project_id, "inherit": true },
                "types": ["guidelines"]
            }),
        )
        .await;

    let names = names(&response);
    assert_eq!(names.len(), 2);
    // Project scope outranks global on ties and near-ties.
    assert_eq!(names[0], "g_style");
    assert_eq!(names[1], "g_sec");
}

// ============================================================================
// Scenario 2: versioning
// ============================================================================

#[tokio::test]
async fn scenario_versioning_history() {
    let h = Harness::new().await;

    let created = h
        .ok(
            "tool",
            "create",
            "admin",
            json!({
                "name": "run_tests",
                "scope": { "type": "global" },
                "description": "run tests"
            }),
        )
        .await;
    let id = created["entry"]["entry_id"].as_str().unwrap().to_string();

    h.ok(
        "tool",
        "update",
        "admin",
        json!({ "id": id, "description": "run test suite", "reason": "clarify wording" }),
    )
    .await;

    let history = h.ok("tool", "history", "admin", json!({ "id": id })).await;
    let versions = history["versions"].as_array().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0]["version_number"], 1);
    assert_eq!(versions[1]["version_number"], 2);
    assert_eq!(versions[1]["change_reason"], "clarify wording");

    let fetched = h.ok("tool", "get", "admin", json!({ "id": id })).await;
    assert_eq!(fetched["entry"]["head_version"], 2);
    assert_eq!(
        fetched["entry"]["payload"]["description"],
        "run test suite"
    );
}

// ============================================================================
// Scenario 3: conflict detection
// ============================================================================

#[tokio::test]
async fn scenario_conflict_detection() {
    let h = Harness::new().await;

    let created = h
        .ok(
            "knowledge",
            "create",
            "agent-a",
            json!({
                "name": "K",
                "scope": { "type": "global" },
                "content": "initial"
            }),
        )
        .await;
    let id = created["entry"]["entry_id"].as_str().unwrap().to_string();

    let first = h
        .ok(
            "knowledge",
            "update",
            "agent-a",
            json!({ "id": id, "content": "from A", "reason": "a" }),
        )
        .await;
    assert!(first["conflict"].is_null());
    assert_eq!(first["entry"]["head_version"], 2);

    // Agent B lands well inside the window.
    let second = h
        .ok(
            "knowledge",
            "update",
            "agent-b",
            json!({ "id": id, "content": "from B", "reason": "b" }),
        )
        .await;
    assert_eq!(second["entry"]["head_version"], 3);
    assert_eq!(second["conflict"]["resolved"], false);

    let listed = h
        .ok("conflict", "list", "agent-a", json!({ "entry_id": id }))
        .await;
    assert_eq!(listed["count"], 1);

    // Resolve by picking the surviving version.
    let conflict_id = listed["conflicts"][0]["conflict_id"].as_str().unwrap();
    let winning = listed["conflicts"][0]["version_b"].as_str().unwrap();
    let resolved = h
        .ok(
            "conflict",
            "resolve",
            "agent-a",
            json!({ "id": conflict_id, "winning_version": winning }),
        )
        .await;
    assert_eq!(resolved["conflict"]["resolved"], true);
}

// ============================================================================
// Scenario 4: file lock exclusion
// ============================================================================

#[tokio::test]
async fn scenario_file_lock_exclusion() {
    let h = Harness::new().await;

    let acquired = h
        .ok(
            "file_lock",
            "acquire",
            "agent-a",
            json!({ "path": "/src/x.ts", "ttl_ms": 60000 }),
        )
        .await;
    assert_eq!(acquired["acquired"], true);
    let lock_id = acquired["lock"]["lock_id"].as_str().unwrap().to_string();
    let token = acquired["lock"]["token"].as_str().unwrap().to_string();

    let denied = h
        .ok(
            "file_lock",
            "acquire",
            "agent-b",
            json!({ "path": "/src/x.ts", "ttl_ms": 60000 }),
        )
        .await;
    assert_eq!(denied["acquired"], false);
    assert_eq!(denied["held_by"], "agent-a");

    let released = h
        .ok(
            "file_lock",
            "release",
            "agent-a",
            json!({ "path": "/src/x.ts", "lock_id": lock_id, "token": token }),
        )
        .await;
    assert_eq!(released["released"], true);

    let reacquired = h
        .ok(
            "file_lock",
            "acquire",
            "agent-b",
            json!({ "path": "/src/x.ts", "ttl_ms": 60000 }),
        )
        .await;
    assert_eq!(reacquired["acquired"], true);
    assert_eq!(reacquired["lock"]["owner"], "agent-b");
}

// ============================================================================
// Scenario 5: relation traversal
// ============================================================================

#[tokio::test]
async fn scenario_relation_traversal() {
    let h = Harness::new().await;

    let mut ids = Vec::new();
    for name in ["K1", "K2", "K3"] {
        let created = h
            .ok(
                "knowledge",
                "create",
                "admin",
                json!({ "name": name, "scope": { "type": "global" }, "content": name }),
            )
            .await;
        ids.push(created["entry"]["entry_id"].as_str().unwrap().to_string());
    }
    for (source, target) in [(0usize, 1usize), (1, 2)] {
        h.ok(
            "relation",
            "create",
            "admin",
            json!({
                "source_type": "knowledge", "source_id": ids[source],
                "target_type": "knowledge", "target_id": ids[target],
                "relation_type": "depends_on"
            }),
        )
        .await;
    }

    let query = |id: &str, direction: &str, depth: u32| {
        json!({
            "scope": { "type": "global" },
            "types": ["knowledge"],
            "related_to": { "type": "knowledge", "id": id, "direction": direction, "depth": depth }
        })
    };

    let d1 = h.ok("query", "search", "admin", query(&ids[0], "forward", 1)).await;
    assert_eq!(names(&d1), vec!["K2"]);

    let d2 = h.ok("query", "search", "admin", query(&ids[0], "forward", 2)).await;
    let mut d2_names = names(&d2);
    d2_names.sort();
    assert_eq!(d2_names, vec!["K2", "K3"]);

    let back = h
        .ok("query", "search", "admin", query(&ids[2], "backward", 2))
        .await;
    let mut back_names = names(&back);
    back_names.sort();
    assert_eq!(back_names, vec!["K1", "K2"]);
}

// ============================================================================
// Round-trip: export / reset / import
// ============================================================================

#[tokio::test]
async fn scenario_export_import_roundtrip() {
    let h = Harness::new().await;

    h.ok(
        "guideline",
        "create",
        "admin",
        json!({
            "name": "g1",
            "scope": { "type": "global" },
            "content": "first",
            "priority": 80,
            "tags": ["security"]
        }),
    )
    .await;
    h.ok(
        "knowledge",
        "create",
        "admin",
        json!({ "name": "k1", "scope": { "type": "global" }, "content": "fact" }),
    )
    .await;

    let exported = h
        .ok("export", "run", "admin", json!({ "scope": { "type": "global" } }))
        .await;
    assert_eq!(exported["count"], 2);
    let document = exported["document"].clone();

    // Fresh context plays the part of `reset`.
    let h2 = Harness::new().await;
    let imported = h2
        .ok("import", "run", "admin", json!({ "document": document }))
        .await;
    assert_eq!(imported["imported"], 2);

    let listed = h2
        .ok(
            "guideline",
            "list",
            "admin",
            json!({ "scope": { "type": "global" } }),
        )
        .await;
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["entries"][0]["name"], "g1");
    assert_eq!(listed["entries"][0]["payload"]["priority"], 80);

    shutdown(&h2.ctx).await;
    shutdown(&h.ctx).await;
}

// ============================================================================
// Cascade: scope deletion removes owned entries
// ============================================================================

#[tokio::test]
async fn scenario_scope_delete_cascades() {
    let h = Harness::new().await;

    let org = h.ok("org", "create", "admin", json!({ "name": "doomed" })).await;
    let org_id = org["org"]["org_id"].as_str().unwrap().to_string();
    let project = h
        .ok(
            "project",
            "create",
            "admin",
            json!({ "org_id": org_id, "name": "p" }),
        )
        .await;
    let project_id = project["project"]["project_id"].as_str().unwrap().to_string();

    let entry = h
        .ok(
            "knowledge",
            "create",
            "admin",
            json!({
                "name": "owned",
                "scope": { "type": "project", "id": project_id },
                "content": "dies with the org"
            }),
        )
        .await;
    let entry_id = entry["entry"]["entry_id"].as_str().unwrap().to_string();

    let deleted = h.ok("org", "delete", "admin", json!({ "id": org_id })).await;
    assert_eq!(deleted["entries_removed"], 1);

    let gone = h
        .call("knowledge", "get", "admin", json!({ "id": entry_id }))
        .await;
    assert_eq!(gone["success"], false);
    assert_eq!(gone["error"]["code"], 2001);
}

// ============================================================================
// Health and analytics surfaces
// ============================================================================

#[tokio::test]
async fn scenario_health_and_analytics() {
    let h = Harness::new().await;
    let health = h.ok("health", "get", "admin", json!({})).await;
    assert_eq!(health["healthy"], true);
    assert_eq!(health["embedding_enabled"], false);

    h.ok(
        "guideline",
        "create",
        "admin",
        json!({ "name": "g", "scope": { "type": "global" }, "content": "c", "priority": 10 }),
    )
    .await;
    let stats = h.ok("analytics", "stats", "admin", json!({})).await;
    assert_eq!(stats["counts"]["entries"], 1);
    assert_eq!(stats["counts"]["versions"], 1);
    assert_eq!(stats["audit_write_failures"], 0);
}
