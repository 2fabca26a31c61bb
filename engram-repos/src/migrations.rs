//! Schema migrations
//!
//! Migrations are embedded, ordered, and tracked in a `_migrations` table.
//! Applied names are also appended to a `migrations.journal` file in the
//! data directory so operators can see history without a SQL client.
//!
//! The DDL is portable: TEXT primary keys (UUID strings), BIGINT integers,
//! TEXT RFC 3339 timestamps, and an empty string instead of NULL for the
//! global scope id, keeping unique indexes honest on both backends.

use engram_adapters::{SqlValue, StorageAdapter};
use engram_core::{DatabaseError, EngramResult, SystemError, Timestamp};
use std::path::Path;

/// One embedded migration.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
    /// Set for migrations using SQLite-only features (FTS5).
    pub sqlite_only: bool,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_scopes",
        sqlite_only: false,
        sql: r#"
CREATE TABLE orgs (
    org_id      TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    description TEXT,
    created_at  TEXT NOT NULL,
    metadata    TEXT
);

CREATE TABLE projects (
    project_id  TEXT PRIMARY KEY,
    org_id      TEXT NOT NULL,
    name        TEXT NOT NULL,
    description TEXT,
    created_at  TEXT NOT NULL,
    metadata    TEXT,
    UNIQUE (org_id, name)
);

CREATE TABLE sessions (
    session_id  TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    agent_id    TEXT,
    name        TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    ended_at    TEXT,
    metadata    TEXT
);
"#,
    },
    Migration {
        name: "0002_entries",
        sqlite_only: false,
        sql: r#"
CREATE TABLE entries (
    entry_id        TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    name            TEXT NOT NULL,
    category        TEXT,
    scope_kind      TEXT NOT NULL,
    scope_id        TEXT NOT NULL DEFAULT '',
    active          BIGINT NOT NULL DEFAULT 1,
    created_at      TEXT NOT NULL,
    created_by      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    head_version    BIGINT NOT NULL,
    head_version_id TEXT NOT NULL,
    payload         TEXT NOT NULL
);

CREATE INDEX idx_entries_scope ON entries (kind, scope_kind, scope_id, active);
CREATE INDEX idx_entries_category ON entries (kind, category);
CREATE UNIQUE INDEX uq_entries_active_name
    ON entries (kind, scope_kind, scope_id, name) WHERE active = 1;

CREATE TABLE entry_versions (
    version_id     TEXT PRIMARY KEY,
    entry_id       TEXT NOT NULL,
    version_number BIGINT NOT NULL,
    payload        TEXT NOT NULL,
    change_reason  TEXT NOT NULL,
    created_by     TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    UNIQUE (entry_id, version_number)
);
"#,
    },
    Migration {
        name: "0003_tags_relations",
        sqlite_only: false,
        sql: r#"
CREATE TABLE tags (
    tag_id      TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    color       TEXT,
    description TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE tag_attachments (
    entry_kind TEXT NOT NULL,
    entry_id   TEXT NOT NULL,
    tag_id     TEXT NOT NULL,
    PRIMARY KEY (entry_kind, entry_id, tag_id)
);

CREATE INDEX idx_tag_attachments_tag ON tag_attachments (tag_id);

CREATE TABLE relations (
    relation_id   TEXT PRIMARY KEY,
    source_kind   TEXT NOT NULL,
    source_id     TEXT NOT NULL,
    target_kind   TEXT NOT NULL,
    target_id     TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    properties    TEXT,
    created_at    TEXT NOT NULL,
    created_by    TEXT NOT NULL,
    UNIQUE (source_kind, source_id, target_kind, target_id, relation_type)
);

CREATE INDEX idx_relations_source ON relations (source_kind, source_id);
CREATE INDEX idx_relations_target ON relations (target_kind, target_id);

CREATE TABLE graph_nodes (
    entry_kind TEXT NOT NULL,
    entry_id   TEXT NOT NULL,
    scope_kind TEXT NOT NULL,
    scope_id   TEXT NOT NULL DEFAULT '',
    label      TEXT NOT NULL,
    PRIMARY KEY (entry_kind, entry_id)
);
"#,
    },
    Migration {
        name: "0004_coordination",
        sqlite_only: false,
        sql: r#"
CREATE TABLE file_locks (
    lock_id     TEXT PRIMARY KEY,
    path        TEXT NOT NULL UNIQUE,
    owner       TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL,
    token       TEXT NOT NULL
);

CREATE TABLE conflicts (
    conflict_id     TEXT PRIMARY KEY,
    entry_kind      TEXT NOT NULL,
    entry_id        TEXT NOT NULL,
    version_a       TEXT NOT NULL,
    version_b       TEXT NOT NULL,
    detected_at     TEXT NOT NULL,
    resolved        BIGINT NOT NULL DEFAULT 0,
    resolved_by     TEXT,
    resolved_at     TEXT,
    winning_version TEXT
);

CREATE INDEX idx_conflicts_entry ON conflicts (entry_id, resolved);

CREATE TABLE grants (
    grant_id   TEXT PRIMARY KEY,
    agent_id   TEXT NOT NULL,
    action     TEXT NOT NULL,
    scope_kind TEXT NOT NULL,
    scope_id   TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    UNIQUE (agent_id, action, scope_kind, scope_id)
);

CREATE TABLE votes (
    vote_id    TEXT PRIMARY KEY,
    entry_kind TEXT NOT NULL,
    entry_id   TEXT NOT NULL,
    agent_id   TEXT NOT NULL,
    vote       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (entry_kind, entry_id, agent_id)
);
"#,
    },
    Migration {
        name: "0005_audit_embeddings",
        sqlite_only: false,
        sql: r#"
CREATE TABLE audit_log (
    audit_id          TEXT PRIMARY KEY,
    action            TEXT NOT NULL,
    entry_kind        TEXT,
    entity_id         TEXT,
    actor             TEXT NOT NULL,
    scope_kind        TEXT,
    scope_id          TEXT,
    correlation_id    TEXT,
    payload           TEXT,
    payload_truncated BIGINT NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL
);

CREATE INDEX idx_audit_created ON audit_log (created_at);

CREATE TABLE embedding_records (
    entry_kind TEXT NOT NULL,
    entry_id   TEXT NOT NULL,
    version_id TEXT NOT NULL,
    provider   TEXT NOT NULL,
    model      TEXT NOT NULL,
    dimension  BIGINT NOT NULL,
    stored_at  TEXT NOT NULL,
    status     TEXT NOT NULL DEFAULT 'stored',
    PRIMARY KEY (entry_kind, entry_id)
);
"#,
    },
    Migration {
        name: "0006_fts",
        sqlite_only: true,
        sql: r#"
CREATE VIRTUAL TABLE entries_fts USING fts5(
    entry_id UNINDEXED,
    kind UNINDEXED,
    name,
    body,
    tokenize = 'unicode61'
);
"#,
    },
];

/// Apply pending migrations. Returns how many were applied.
pub async fn run_migrations(
    storage: &dyn StorageAdapter,
    journal_dir: Option<&Path>,
) -> EngramResult<usize> {
    storage
        .execute_script(
            "CREATE TABLE IF NOT EXISTS _migrations (
                 name       TEXT PRIMARY KEY,
                 applied_at TEXT NOT NULL
             )",
        )
        .await?;

    let applied: Vec<String> = storage
        .execute("SELECT name FROM _migrations ORDER BY name", &[])
        .await?
        .into_iter()
        .map(|row| row.text("name"))
        .collect::<EngramResult<_>>()?;

    let mut count = 0usize;
    for migration in MIGRATIONS {
        if applied.iter().any(|name| name == migration.name) {
            continue;
        }
        if migration.sqlite_only && storage.backend_name() != "sqlite" {
            // Recorded as applied so the journal stays linear across
            // backends.
            record(storage, migration.name, journal_dir, "skipped").await?;
            continue;
        }
        storage
            .execute_script(migration.sql)
            .await
            .map_err(|e| DatabaseError::Migration {
                reason: format!("{}: {e}", migration.name),
            })?;
        record(storage, migration.name, journal_dir, "applied").await?;
        tracing::info!(migration = migration.name, "applied migration");
        count += 1;
    }
    Ok(count)
}

async fn record(
    storage: &dyn StorageAdapter,
    name: &str,
    journal_dir: Option<&Path>,
    verb: &str,
) -> EngramResult<()> {
    let now: Timestamp = chrono::Utc::now();
    storage
        .execute(
            "INSERT INTO _migrations (name, applied_at) VALUES ($1, $2)",
            &[SqlValue::from(name), SqlValue::from(now)],
        )
        .await?;
    if let Some(dir) = journal_dir {
        let line = format!("{} {verb} {name}\n", now.to_rfc3339());
        append_journal(&dir.join("migrations.journal"), &line)?;
    }
    Ok(())
}

fn append_journal(path: &Path, line: &str) -> EngramResult<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SystemError::Io {
            reason: format!("open {}: {e}", path.display()),
        })?;
    file.write_all(line.as_bytes()).map_err(|e| {
        SystemError::Io {
            reason: format!("append {}: {e}", path.display()),
        }
        .into()
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use engram_adapters::SqliteAdapter;

    #[tokio::test]
    async fn test_migrations_apply_once() {
        let adapter = SqliteAdapter::in_memory();
        adapter.connect().await.unwrap();

        let first = run_migrations(&adapter, None).await.unwrap();
        assert_eq!(first, MIGRATIONS.len());

        // Second run is a no-op.
        let second = run_migrations(&adapter, None).await.unwrap();
        assert_eq!(second, 0);

        // Schema is usable afterwards.
        adapter
            .execute("SELECT entry_id FROM entries LIMIT 1", &[])
            .await
            .unwrap();
        adapter
            .execute("SELECT entry_id FROM entries_fts LIMIT 1", &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_journal_lists_applied_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = SqliteAdapter::in_memory();
        adapter.connect().await.unwrap();

        run_migrations(&adapter, Some(dir.path())).await.unwrap();
        let journal = std::fs::read_to_string(dir.path().join("migrations.journal")).unwrap();
        let names: Vec<&str> = journal
            .lines()
            .filter_map(|l| l.split_whitespace().last())
            .collect();
        let expected: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_migration_names_are_ordered_and_unique() {
        let names: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(names, sorted);
    }
}
