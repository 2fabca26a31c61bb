//! Store invariants exercised at the repository level.

use engram_core::{EntryPatch, IdType, ScopeRef};
use engram_repos::{EntryRepository, NullEmbeddingSink};
use engram_test_utils::{guideline_entry, knowledge_entry, sqlite_deps, test_agent, tool_entry};
use std::sync::Arc;

async fn entries() -> EntryRepository {
    EntryRepository::new(sqlite_deps().await, Arc::new(NullEmbeddingSink))
}

#[tokio::test]
async fn head_version_equals_max_version_number() {
    let repo = entries().await;
    let agent = test_agent();
    let created = repo
        .create(knowledge_entry("k", ScopeRef::global(), "v1"))
        .await
        .unwrap();

    for i in 0..5 {
        repo.update(
            created.entry_id,
            EntryPatch {
                payload: Some(knowledge_entry("k", ScopeRef::global(), &format!("v{i}")).payload),
                ..Default::default()
            },
            "edit",
            &agent,
            None,
        )
        .await
        .unwrap();
    }

    let entry = repo.get_by_id(created.entry_id).await.unwrap().unwrap();
    let history = repo.history(created.entry_id).await.unwrap();
    assert_eq!(
        entry.head_version,
        history.iter().map(|v| v.version_number).max().unwrap()
    );
    assert_eq!(entry.head_version_id, history.last().unwrap().version_id);
}

#[tokio::test]
async fn version_numbers_start_at_one_and_increase() {
    let repo = entries().await;
    let agent = test_agent();
    let created = repo
        .create(tool_entry("t", ScopeRef::global(), "runs things"))
        .await
        .unwrap();
    repo.deactivate(created.entry_id, "pause", &agent)
        .await
        .unwrap();
    repo.reactivate(created.entry_id, "resume", &agent)
        .await
        .unwrap();

    let history = repo.history(created.entry_id).await.unwrap();
    let numbers: Vec<i32> = history.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(numbers.iter().all(|n| *n >= 1));
}

#[tokio::test]
async fn create_then_get_is_payload_equal() {
    let repo = entries().await;
    let input = guideline_entry("g", ScopeRef::global(), 80, "payload equality");
    let created = repo.create(input.clone()).await.unwrap();
    let fetched = repo.get_by_id(created.entry_id).await.unwrap().unwrap();
    assert_eq!(fetched.payload, input.payload);
    assert_eq!(fetched.name, input.name);
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn deletion_removes_every_owned_row() {
    let repo = entries().await;
    let agent = test_agent();
    let mut input = knowledge_entry("doomed", ScopeRef::global(), "x");
    input.tags = vec!["a".into(), "b".into()];
    let created = repo.create(input).await.unwrap();

    repo.delete(created.entry_id, &agent).await.unwrap();
    assert!(repo.get_by_id(created.entry_id).await.unwrap().is_none());
    assert!(repo.history(created.entry_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn typed_ids_are_stable_across_serialization() {
    let repo = entries().await;
    let created = repo
        .create(knowledge_entry("serde", ScopeRef::global(), "x"))
        .await
        .unwrap();
    let json = serde_json::to_string(&created).unwrap();
    assert!(json.contains(&created.entry_id.as_uuid().to_string()));
    let back: engram_core::Entry = serde_json::from_str(&json).unwrap();
    assert_eq!(back, created);
}
