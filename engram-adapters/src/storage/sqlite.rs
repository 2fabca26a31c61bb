//! Embedded single-file store on rusqlite
//!
//! One connection behind an async mutex. Blocking rusqlite work crosses
//! `spawn_blocking`; transactions hold the owned guard for their whole
//! extent so no foreign statement can interleave.

use super::{rewrite_placeholders, SqlRow, SqlValue, StorageAdapter, StorageTransaction};
use async_trait::async_trait;
use engram_core::{DatabaseError, EngramError, EngramResult};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-connection page cache: negative value = KiB, so -65536 is 64 MiB.
const CACHE_SIZE_KIB: i64 = -65536;

/// Embedded SQLite adapter.
pub struct SqliteAdapter {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteAdapter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Open an in-memory database; used by tests.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    fn open(path: &Path) -> EngramResult<Connection> {
        let conn = Connection::open(path).map_err(|e| connection_err(&e))?;
        // WAL + NORMAL + FK + 64 MiB page cache, per the persistent layout.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| connection_err(&e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| connection_err(&e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| connection_err(&e))?;
        conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)
            .map_err(|e| connection_err(&e))?;
        conn.busy_timeout(std::time::Duration::from_millis(250))
            .map_err(|e| connection_err(&e))?;
        Ok(conn)
    }

    async fn guard(&self) -> EngramResult<OwnedMutexGuard<Option<Connection>>> {
        let guard = self.conn.clone().lock_owned().await;
        if guard.is_none() {
            return Err(DatabaseError::Connection {
                reason: "sqlite adapter is not connected".into(),
            }
            .into());
        }
        Ok(guard)
    }
}

fn connection_err(e: &rusqlite::Error) -> EngramError {
    DatabaseError::Connection {
        reason: e.to_string(),
    }
    .into()
}

/// Classify a rusqlite failure. Busy/locked become the retryable class.
fn query_err(e: rusqlite::Error) -> EngramError {
    use rusqlite::ErrorCode;
    if let rusqlite::Error::SqliteFailure(inner, ref msg) = e {
        match inner.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return DatabaseError::Busy {
                    reason: msg.clone().unwrap_or_else(|| "database busy".into()),
                }
                .into();
            }
            _ => {}
        }
    }
    DatabaseError::Query {
        reason: e.to_string(),
    }
    .into()
}

fn to_sqlite_value(v: &SqlValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match v {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(r) => Value::Real(*r),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
    }
}

fn from_sqlite_value(v: rusqlite::types::ValueRef<'_>) -> SqlValue {
    use rusqlite::types::ValueRef;
    match v {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(r) => SqlValue::Real(r),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

/// Run a statement on the connection. Uses the prepared-statement cache;
/// handles never leak past this function.
fn run_statement(
    conn: &Connection,
    sql: &str,
    params: &[SqlValue],
) -> EngramResult<Vec<SqlRow>> {
    let rewritten = rewrite_placeholders(sql);
    let mut stmt = conn.prepare_cached(&rewritten).map_err(query_err)?;
    let columns: Arc<Vec<String>> =
        Arc::new(stmt.column_names().iter().map(|c| c.to_string()).collect());
    let values: Vec<rusqlite::types::Value> = params.iter().map(to_sqlite_value).collect();

    let mut rows = stmt
        .query(rusqlite::params_from_iter(values))
        .map_err(query_err)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_err)? {
        let mut vals = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            vals.push(from_sqlite_value(row.get_ref(i).map_err(query_err)?));
        }
        out.push(SqlRow::new(Arc::clone(&columns), vals));
    }
    Ok(out)
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    async fn connect(&self) -> EngramResult<()> {
        let mut guard = self.conn.clone().lock_owned().await;
        if guard.is_some() {
            return Ok(());
        }
        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || Self::open(&path))
            .await
            .map_err(|e| EngramError::internal(format!("connect task failed: {e}")))??;
        *guard = Some(conn);
        Ok(())
    }

    async fn close(&self) -> EngramResult<()> {
        let mut guard = self.conn.clone().lock_owned().await;
        guard.take();
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> EngramResult<Vec<SqlRow>> {
        let guard = self.guard().await?;
        let sql = sql.to_string();
        let params = params.to_vec();
        let (_guard, result) = tokio::task::spawn_blocking(move || {
            let result = run_statement(guard.as_ref().expect("checked connected"), &sql, &params);
            (guard, result)
        })
        .await
        .map_err(|e| EngramError::internal(format!("execute task failed: {e}")))?;
        result
    }

    async fn execute_script(&self, sql: &str) -> EngramResult<()> {
        let guard = self.guard().await?;
        let sql = sql.to_string();
        let (_guard, result) = tokio::task::spawn_blocking(move || {
            let result = guard
                .as_ref()
                .expect("checked connected")
                .execute_batch(&sql)
                .map_err(query_err);
            (guard, result)
        })
        .await
        .map_err(|e| EngramError::internal(format!("script task failed: {e}")))?;
        result
    }

    async fn begin(&self) -> EngramResult<Box<dyn StorageTransaction>> {
        let guard = self.guard().await?;
        let (guard, begun) = tokio::task::spawn_blocking(move || {
            let begun = guard
                .as_ref()
                .expect("checked connected")
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(query_err);
            (guard, begun)
        })
        .await
        .map_err(|e| EngramError::internal(format!("begin task failed: {e}")))?;
        begun?;
        Ok(Box::new(SqliteTransaction {
            guard: Some(guard),
            finished: false,
        }))
    }

    async fn health(&self) -> EngramResult<()> {
        self.execute("SELECT 1 AS ok", &[]).await.map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Transaction over the single connection. The owned guard keeps every
/// other caller out until commit/rollback.
struct SqliteTransaction {
    guard: Option<OwnedMutexGuard<Option<Connection>>>,
    finished: bool,
}

impl SqliteTransaction {
    async fn end(&mut self, sql: &'static str) -> EngramResult<()> {
        if self.finished {
            return Ok(());
        }
        let guard = self
            .guard
            .take()
            .ok_or_else(|| EngramError::internal("transaction guard missing"))?;
        let (_guard, result) = tokio::task::spawn_blocking(move || {
            let result = guard
                .as_ref()
                .expect("checked connected")
                .execute_batch(sql)
                .map_err(query_err);
            (guard, result)
        })
        .await
        .map_err(|e| EngramError::internal(format!("txn end task failed: {e}")))?;
        self.finished = true;
        result
    }
}

#[async_trait]
impl StorageTransaction for SqliteTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> EngramResult<Vec<SqlRow>> {
        let guard = self
            .guard
            .take()
            .ok_or_else(|| EngramError::internal("transaction already finished"))?;
        let sql = sql.to_string();
        let params = params.to_vec();
        let (guard, result) = tokio::task::spawn_blocking(move || {
            let result = run_statement(guard.as_ref().expect("checked connected"), &sql, &params);
            (guard, result)
        })
        .await
        .map_err(|e| EngramError::internal(format!("txn execute task failed: {e}")))?;
        self.guard = Some(guard);
        result
    }

    async fn commit(mut self: Box<Self>) -> EngramResult<()> {
        self.end("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> EngramResult<()> {
        self.end("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        // Dropping an unfinished transaction rolls back synchronously on
        // the guard we still hold.
        if !self.finished {
            if let Some(guard) = self.guard.take() {
                if let Some(conn) = guard.as_ref() {
                    let _ = conn.execute_batch("ROLLBACK");
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
