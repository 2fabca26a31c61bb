//! Engram Test Utilities
//!
//! Centralized test infrastructure for the workspace: a migrated SQLite
//! fixture, entry builders, and re-exported deterministic providers.

pub use engram_services::{InMemoryVectorStore, StubEmbeddingProvider};

use engram_adapters::{InProcessEventBus, SqliteAdapter, StorageAdapter};
use engram_core::{
    AgentId, EntryPayload, GuidelineExamples, GuidelinePayload, KnowledgePayload, ScopeRef,
    ToolPayload, TxnRetryConfig,
};
use engram_repos::{run_migrations, DbDeps, NewEntry};
use std::sync::Arc;
use std::time::Duration;

/// A connected, migrated, in-memory SQLite deps bundle.
pub async fn sqlite_deps() -> DbDeps {
    let storage = Arc::new(SqliteAdapter::in_memory());
    storage.connect().await.expect("in-memory sqlite connects");
    run_migrations(storage.as_ref(), None)
        .await
        .expect("migrations apply");
    DbDeps::new(
        storage,
        InProcessEventBus::new(64),
        TxnRetryConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
        },
    )
}

/// The default test actor.
pub fn test_agent() -> AgentId {
    AgentId::new("test-agent").expect("valid agent id")
}

/// Guideline entry input with sensible defaults.
pub fn guideline_entry(name: &str, scope: ScopeRef, priority: i32, content: &str) -> NewEntry {
    NewEntry {
        name: name.to_string(),
        category: None,
        scope,
        payload: EntryPayload::Guideline(GuidelinePayload {
            content: content.to_string(),
            rationale: None,
            examples: GuidelineExamples::default(),
            priority,
        }),
        tags: vec![],
        created_by: test_agent(),
        correlation_id: None,
    }
}

/// Knowledge entry input with sensible defaults.
pub fn knowledge_entry(name: &str, scope: ScopeRef, content: &str) -> NewEntry {
    NewEntry {
        name: name.to_string(),
        category: None,
        scope,
        payload: EntryPayload::Knowledge(KnowledgePayload {
            content: content.to_string(),
            source: None,
            confidence: 0.9,
            valid_from: None,
            valid_until: None,
        }),
        tags: vec![],
        created_by: test_agent(),
        correlation_id: None,
    }
}

/// Tool entry input with sensible defaults.
pub fn tool_entry(name: &str, scope: ScopeRef, description: &str) -> NewEntry {
    NewEntry {
        name: name.to_string(),
        category: None,
        scope,
        payload: EntryPayload::Tool(ToolPayload {
            description: description.to_string(),
            parameters: serde_json::json!({}),
            examples: vec![],
            constraints: None,
        }),
        tags: vec![],
        created_by: test_agent(),
        correlation_id: None,
    }
}
