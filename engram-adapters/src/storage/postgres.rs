//! Client-server store on tokio-postgres with a deadpool connection pool.

use super::{SqlRow, SqlValue, StorageAdapter, StorageTransaction};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use engram_core::{DatabaseError, EngramError, EngramResult};
use std::sync::Arc;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_size: usize,
}

impl PgConfig {
    fn create_pool(&self) -> EngramResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                DatabaseError::Connection {
                    reason: format!("failed to create pool: {e}"),
                }
                .into()
            })
    }
}

// ============================================================================
// VALUE BRIDGING
// ============================================================================

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut tokio_postgres::types::private::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Integer(v) => v.to_sql(ty, out),
            SqlValue::Real(v) => v.to_sql(ty, out),
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Blob(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Variant/type agreement is enforced by the schema, which only
        // uses BIGINT, DOUBLE PRECISION, TEXT, and BYTEA columns.
        true
    }

    to_sql_checked!();
}

fn decode_row(row: &tokio_postgres::Row) -> EngramResult<SqlRow> {
    let columns: Arc<Vec<String>> = Arc::new(
        row.columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
    );
    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in row.columns().iter().enumerate() {
        let ty = col.type_();
        let value = if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i)
                .map(|v| v.map(|v| SqlValue::Integer(v as i64)))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)
                .map(|v| v.map(|v| SqlValue::Integer(v as i64)))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i)
                .map(|v| v.map(SqlValue::Integer))
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i)
                .map(|v| v.map(|v| SqlValue::Real(v as f64)))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i)
                .map(|v| v.map(SqlValue::Real))
        } else if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i)
                .map(|v| v.map(|v| SqlValue::Integer(if v { 1 } else { 0 })))
        } else if *ty == Type::BYTEA {
            row.try_get::<_, Option<Vec<u8>>>(i)
                .map(|v| v.map(SqlValue::Blob))
        } else {
            row.try_get::<_, Option<String>>(i)
                .map(|v| v.map(SqlValue::Text))
        }
        .map_err(|e| {
            EngramError::from(DatabaseError::Decode {
                reason: format!("column '{}': {e}", col.name()),
            })
        })?;
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow::new(columns, values))
}

/// Classify a postgres failure. Deadlocks and serialization failures are
/// the retryable class.
fn query_err(e: tokio_postgres::Error) -> EngramError {
    use tokio_postgres::error::SqlState;
    if let Some(state) = e.code() {
        if *state == SqlState::T_R_DEADLOCK_DETECTED
            || *state == SqlState::T_R_SERIALIZATION_FAILURE
            || *state == SqlState::LOCK_NOT_AVAILABLE
        {
            return DatabaseError::Busy {
                reason: e.to_string(),
            }
            .into();
        }
    }
    DatabaseError::Query {
        reason: e.to_string(),
    }
    .into()
}

fn pool_err(e: deadpool_postgres::PoolError) -> EngramError {
    DatabaseError::Connection {
        reason: format!("pool error: {e}"),
    }
    .into()
}

fn param_refs(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

// ============================================================================
// ADAPTER
// ============================================================================

/// Client-server PostgreSQL adapter.
pub struct PostgresAdapter {
    pool: Pool,
}

impl PostgresAdapter {
    pub fn new(config: &PgConfig) -> EngramResult<Self> {
        Ok(Self {
            pool: config.create_pool()?,
        })
    }
}

#[async_trait]
impl StorageAdapter for PostgresAdapter {
    async fn connect(&self) -> EngramResult<()> {
        // Verify one connection is obtainable; the pool itself is lazy.
        let conn = self.pool.get().await.map_err(pool_err)?;
        conn.simple_query("SELECT 1").await.map_err(query_err)?;
        Ok(())
    }

    async fn close(&self) -> EngramResult<()> {
        self.pool.close();
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> EngramResult<Vec<SqlRow>> {
        let conn = self.pool.get().await.map_err(pool_err)?;
        let rows = conn
            .query(sql, &param_refs(params))
            .await
            .map_err(query_err)?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute_script(&self, sql: &str) -> EngramResult<()> {
        let conn = self.pool.get().await.map_err(pool_err)?;
        conn.batch_execute(sql).await.map_err(query_err)
    }

    async fn begin(&self) -> EngramResult<Box<dyn StorageTransaction>> {
        let conn = self.pool.get().await.map_err(pool_err)?;
        conn.batch_execute("BEGIN").await.map_err(query_err)?;
        Ok(Box::new(PostgresTransaction {
            conn: Some(conn),
            finished: false,
        }))
    }

    async fn health(&self) -> EngramResult<()> {
        let conn = self.pool.get().await.map_err(pool_err)?;
        conn.simple_query("SELECT 1").await.map_err(query_err)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

/// Transaction pinned to one pooled connection.
struct PostgresTransaction {
    conn: Option<deadpool_postgres::Object>,
    finished: bool,
}

impl PostgresTransaction {
    fn conn(&self) -> EngramResult<&deadpool_postgres::Object> {
        self.conn
            .as_ref()
            .ok_or_else(|| EngramError::internal("transaction already finished"))
    }

    async fn end(&mut self, sql: &'static str) -> EngramResult<()> {
        if self.finished {
            return Ok(());
        }
        let result = self.conn()?.batch_execute(sql).await.map_err(query_err);
        self.finished = true;
        self.conn.take();
        result
    }
}

#[async_trait]
impl StorageTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> EngramResult<Vec<SqlRow>> {
        let rows = self
            .conn()?
            .query(sql, &param_refs(params))
            .await
            .map_err(query_err)?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(mut self: Box<Self>) -> EngramResult<()> {
        self.end("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> EngramResult<()> {
        self.end("ROLLBACK").await
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        // Best-effort rollback so the pooled connection is not recycled
        // with an open transaction.
        if !self.finished {
            if let Some(conn) = self.conn.take() {
                tokio::spawn(async move {
                    let _ = conn.batch_execute("ROLLBACK").await;
                });
            }
        }
    }
}
