//! Storage adapter interface
//!
//! The storage adapter is the only component that talks SQL dialects.
//! Callers write statements with `$n` placeholders; the SQLite adapter
//! rewrites them. Rows come back as dynamically-typed `SqlRow`s that the
//! repositories decode into domain types.

mod postgres;
mod sqlite;

pub use postgres::{PgConfig, PostgresAdapter};
pub use sqlite::SqliteAdapter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engram_core::{DatabaseError, EngramResult, Timestamp, TxnRetryConfig};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// VALUES AND ROWS
// ============================================================================

/// Backend-independent SQL parameter / column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(if v { 1 } else { 0 })
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Timestamp> for SqlValue {
    fn from(v: Timestamp) -> Self {
        SqlValue::Text(v.to_rfc3339())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => SqlValue::Null,
        }
    }
}

/// One result row: shared column list plus positional values.
#[derive(Debug, Clone)]
pub struct SqlRow {
    columns: Arc<Vec<String>>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    fn decode_err(&self, column: &str, expected: &str) -> engram_core::EngramError {
        DatabaseError::Decode {
            reason: format!("column '{column}' is not {expected}"),
        }
        .into()
    }

    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    pub fn is_null(&self, column: &str) -> bool {
        matches!(self.value(column), Some(SqlValue::Null) | None)
    }

    pub fn text(&self, column: &str) -> EngramResult<String> {
        match self.value(column) {
            Some(SqlValue::Text(s)) => Ok(s.clone()),
            _ => Err(self.decode_err(column, "text")),
        }
    }

    pub fn opt_text(&self, column: &str) -> EngramResult<Option<String>> {
        match self.value(column) {
            Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
            Some(SqlValue::Null) | None => Ok(None),
            _ => Err(self.decode_err(column, "text or null")),
        }
    }

    pub fn integer(&self, column: &str) -> EngramResult<i64> {
        match self.value(column) {
            Some(SqlValue::Integer(v)) => Ok(*v),
            _ => Err(self.decode_err(column, "integer")),
        }
    }

    pub fn opt_integer(&self, column: &str) -> EngramResult<Option<i64>> {
        match self.value(column) {
            Some(SqlValue::Integer(v)) => Ok(Some(*v)),
            Some(SqlValue::Null) | None => Ok(None),
            _ => Err(self.decode_err(column, "integer or null")),
        }
    }

    pub fn real(&self, column: &str) -> EngramResult<f64> {
        match self.value(column) {
            Some(SqlValue::Real(v)) => Ok(*v),
            // SQLite may report integral reals as integers.
            Some(SqlValue::Integer(v)) => Ok(*v as f64),
            _ => Err(self.decode_err(column, "real")),
        }
    }

    pub fn boolean(&self, column: &str) -> EngramResult<bool> {
        Ok(self.integer(column)? != 0)
    }

    pub fn uuid(&self, column: &str) -> EngramResult<Uuid> {
        let raw = self.text(column)?;
        raw.parse().map_err(|_| self.decode_err(column, "uuid"))
    }

    pub fn opt_uuid(&self, column: &str) -> EngramResult<Option<Uuid>> {
        match self.opt_text(column)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| self.decode_err(column, "uuid")),
            None => Ok(None),
        }
    }

    pub fn timestamp(&self, column: &str) -> EngramResult<Timestamp> {
        let raw = self.text(column)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| self.decode_err(column, "rfc3339 timestamp"))
    }

    pub fn opt_timestamp(&self, column: &str) -> EngramResult<Option<Timestamp>> {
        match self.opt_text(column)? {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|_| self.decode_err(column, "rfc3339 timestamp")),
            None => Ok(None),
        }
    }

    pub fn json(&self, column: &str) -> EngramResult<serde_json::Value> {
        let raw = self.text(column)?;
        serde_json::from_str(&raw).map_err(|_| self.decode_err(column, "json"))
    }

    pub fn opt_json(&self, column: &str) -> EngramResult<Option<serde_json::Value>> {
        match self.opt_text(column)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|_| self.decode_err(column, "json")),
            None => Ok(None),
        }
    }
}

// ============================================================================
// ADAPTER TRAITS
// ============================================================================

/// Narrow interface over a relational store.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Establish connectivity and apply per-connection settings.
    async fn connect(&self) -> EngramResult<()>;

    /// Close connections. Idempotent.
    async fn close(&self) -> EngramResult<()>;

    /// Run one statement outside a transaction.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> EngramResult<Vec<SqlRow>>;

    /// Run a multi-statement script (migrations only).
    async fn execute_script(&self, sql: &str) -> EngramResult<()>;

    /// Open a transaction.
    async fn begin(&self) -> EngramResult<Box<dyn StorageTransaction>>;

    /// Cheap liveness probe.
    async fn health(&self) -> EngramResult<()>;

    /// Stable backend name ("sqlite" | "postgres").
    fn backend_name(&self) -> &'static str;
}

/// An open transaction. Dropping without commit rolls back.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> EngramResult<Vec<SqlRow>>;

    async fn commit(self: Box<Self>) -> EngramResult<()>;

    async fn rollback(self: Box<Self>) -> EngramResult<()>;
}

/// Run `op` inside a transaction, committing on success and rolling back
/// on error. Retries the whole closure only on retryable failures
/// (busy/locked/deadlock/serialization) with exponential backoff up to the
/// configured maximum.
pub async fn with_transaction<T, F>(
    adapter: &dyn StorageAdapter,
    retry: TxnRetryConfig,
    op: F,
) -> EngramResult<T>
where
    F: for<'t> Fn(&'t mut dyn StorageTransaction) -> BoxFuture<'t, EngramResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let mut tx = adapter.begin().await?;
        let outcome = op(tx.as_mut()).await;
        match outcome {
            Ok(value) => match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    backoff(retry, attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            },
            Err(e) => {
                let _ = tx.rollback().await;
                if e.is_retryable() && attempt < retry.max_retries {
                    backoff(retry, attempt).await;
                    attempt += 1;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

async fn backoff(retry: TxnRetryConfig, attempt: u32) {
    let factor = 1u64 << attempt.min(8);
    let delay = retry.base_backoff.saturating_mul(factor as u32);
    tokio::time::sleep(delay).await;
}

/// Rewrite `$n` placeholders to the SQLite `?n` form. Quoted literals are
/// left untouched.
pub(crate) fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_quote = false;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                out.push(c);
            }
            '$' if !in_quote && chars.peek().is_some_and(|n| n.is_ascii_digit()) => {
                out.push('?');
            }
            _ => out.push(c),
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cols: &[&str], vals: Vec<SqlValue>) -> SqlRow {
        SqlRow::new(
            Arc::new(cols.iter().map(|c| c.to_string()).collect()),
            vals,
        )
    }

    #[test]
    fn test_placeholder_rewrite() {
        assert_eq!(
            rewrite_placeholders("SELECT * FROM t WHERE a = $1 AND b = $2"),
            "SELECT * FROM t WHERE a = ?1 AND b = ?2"
        );
        // Dollar inside a string literal survives.
        assert_eq!(
            rewrite_placeholders("SELECT '$1' WHERE a = $1"),
            "SELECT '$1' WHERE a = ?1"
        );
        // Two-digit placeholders keep both digits.
        assert_eq!(rewrite_placeholders("x = $12"), "x = ?12");
    }

    #[test]
    fn test_row_decoding() {
        let now = Utc::now();
        let id = Uuid::now_v7();
        let r = row(
            &["id", "n", "score", "created_at", "note"],
            vec![
                SqlValue::from(id),
                SqlValue::Integer(3),
                SqlValue::Real(0.5),
                SqlValue::from(now),
                SqlValue::Null,
            ],
        );
        assert_eq!(r.uuid("id").unwrap(), id);
        assert_eq!(r.integer("n").unwrap(), 3);
        assert!((r.real("score").unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(r.timestamp("created_at").unwrap(), now);
        assert_eq!(r.opt_text("note").unwrap(), None);
        assert!(r.text("note").is_err());
        assert!(r.text("missing").is_err());
    }

    #[test]
    fn test_option_into_sql_value() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some(5i64)), SqlValue::Integer(5));
        assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
    }
}
