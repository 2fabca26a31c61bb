//! Configuration registry
//!
//! Every option declares its env key, default, and description in one
//! registry table. Parsing and validation happen once at startup;
//! reloads are explicit.

use crate::{EngramResult, SystemError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// OPTION REGISTRY
// ============================================================================

/// One declared configuration option.
#[derive(Debug, Clone, Copy)]
pub struct ConfigOption {
    pub env_key: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

/// The registry. Documentation and `from_env` both read from this table.
pub const CONFIG_OPTIONS: &[ConfigOption] = &[
    ConfigOption {
        env_key: "ENGRAM_DATA_DIR",
        default: "~/.agent-memory",
        description: "Data directory holding the database and vector store",
    },
    ConfigOption {
        env_key: "ENGRAM_DB_BACKEND",
        default: "sqlite",
        description: "Storage backend: sqlite or postgres",
    },
    ConfigOption {
        env_key: "ENGRAM_DB_PATH",
        default: "engram.db",
        description: "SQLite database file, relative to the data directory",
    },
    ConfigOption {
        env_key: "ENGRAM_PG_HOST",
        default: "localhost",
        description: "PostgreSQL host (postgres backend)",
    },
    ConfigOption {
        env_key: "ENGRAM_PG_PORT",
        default: "5432",
        description: "PostgreSQL port",
    },
    ConfigOption {
        env_key: "ENGRAM_PG_DBNAME",
        default: "engram",
        description: "PostgreSQL database name",
    },
    ConfigOption {
        env_key: "ENGRAM_PG_USER",
        default: "postgres",
        description: "PostgreSQL user",
    },
    ConfigOption {
        env_key: "ENGRAM_PG_PASSWORD",
        default: "",
        description: "PostgreSQL password",
    },
    ConfigOption {
        env_key: "ENGRAM_PG_POOL_SIZE",
        default: "16",
        description: "PostgreSQL connection pool size",
    },
    ConfigOption {
        env_key: "ENGRAM_ENV",
        default: "development",
        description: "Environment name: development, staging, or production",
    },
    ConfigOption {
        env_key: "ENGRAM_CURSOR_SECRET",
        default: "",
        description: "HMAC secret for pagination cursors; required non-empty",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_PROVIDER",
        default: "disabled",
        description: "Embedding provider: disabled, stub, or http",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_MODEL",
        default: "text-embedding-3-small",
        description: "Embedding model identifier",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_API_KEY",
        default: "",
        description: "API key for the http embedding provider",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_URL",
        default: "",
        description: "Endpoint for the http embedding provider",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_DIMENSION",
        default: "1536",
        description: "Expected embedding dimension",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_TIMEOUT_MS",
        default: "10000",
        description: "Per-request embedding timeout",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_MAX_ATTEMPTS",
        default: "5",
        description: "Maximum embedding attempts before marking failed",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_QUEUE_CAPACITY",
        default: "1024",
        description: "High-water mark of the embedding queue",
    },
    ConfigOption {
        env_key: "ENGRAM_EMBEDDING_WORKERS",
        default: "4",
        description: "Embedding worker count",
    },
    ConfigOption {
        env_key: "ENGRAM_RATE_LIMIT_ENABLED",
        default: "true",
        description: "Whether the per-agent rate limiter is active",
    },
    ConfigOption {
        env_key: "ENGRAM_RATE_LIMIT_READ",
        default: "120",
        description: "Read-class refill per minute",
    },
    ConfigOption {
        env_key: "ENGRAM_RATE_LIMIT_WRITE",
        default: "60",
        description: "Write-class refill per minute",
    },
    ConfigOption {
        env_key: "ENGRAM_RATE_LIMIT_QUERY",
        default: "120",
        description: "Query-class refill per minute",
    },
    ConfigOption {
        env_key: "ENGRAM_RATE_LIMIT_ADMIN",
        default: "30",
        description: "Admin-class refill per minute",
    },
    ConfigOption {
        env_key: "ENGRAM_RATE_LIMIT_BURST",
        default: "10",
        description: "Burst capacity per class",
    },
    ConfigOption {
        env_key: "ENGRAM_TXN_MAX_RETRIES",
        default: "5",
        description: "Maximum retries on busy/serialization failures",
    },
    ConfigOption {
        env_key: "ENGRAM_TXN_BACKOFF_MS",
        default: "20",
        description: "Base transaction retry backoff",
    },
    ConfigOption {
        env_key: "ENGRAM_CACHE_BACKEND",
        default: "memory",
        description: "Shared cache backend: memory or redis",
    },
    ConfigOption {
        env_key: "ENGRAM_REDIS_URL",
        default: "redis://127.0.0.1:6379",
        description: "Redis endpoint (redis cache backend)",
    },
    ConfigOption {
        env_key: "ENGRAM_QUERY_CACHE_BYTES",
        default: "8388608",
        description: "Byte budget of the query result cache",
    },
    ConfigOption {
        env_key: "ENGRAM_QUERY_CACHE_TTL_SECS",
        default: "300",
        description: "TTL of cached query results",
    },
    ConfigOption {
        env_key: "ENGRAM_AUDIT_RETENTION_DAYS",
        default: "90",
        description: "Days of audit history kept by cleanup",
    },
    ConfigOption {
        env_key: "ENGRAM_HTTP_BIND",
        default: "127.0.0.1:7437",
        description: "Bind address of the HTTP surface",
    },
];

fn env_or_default(key: &'static str) -> String {
    let default = CONFIG_OPTIONS
        .iter()
        .find(|o| o.env_key == key)
        .map(|o| o.default)
        .unwrap_or("");
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> EngramResult<T> {
    let raw = env_or_default(key);
    raw.parse::<T>().map_err(|_| {
        SystemError::Config {
            reason: format!("{key}: cannot parse '{raw}'"),
        }
        .into()
    })
}

// ============================================================================
// TYPED CONFIGURATION
// ============================================================================

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    Sqlite {
        path: PathBuf,
    },
    Postgres {
        host: String,
        port: u16,
        dbname: String,
        user: String,
        password: String,
        pool_size: usize,
    },
}

/// Shared cache backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheBackendConfig {
    Memory,
    Redis { url: String },
}

/// Embedding provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Disabled,
    Stub,
    Http,
}

/// Embedding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub api_key: String,
    pub url: String,
    pub dimension: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl EmbeddingConfig {
    pub fn enabled(&self) -> bool {
        self.provider != EmbeddingProviderKind::Disabled
    }
}

/// One rate-limit class: refill per minute plus burst.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateClass {
    pub per_minute: u32,
    pub burst: u32,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub read: RateClass,
    pub write: RateClass,
    pub query: RateClass,
    pub admin: RateClass,
}

/// Transaction retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TxnRetryConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

/// Query cache budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    pub max_bytes: usize,
    pub ttl: Duration,
}

/// Full validated configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngramConfig {
    pub data_dir: PathBuf,
    pub storage: StorageBackendConfig,
    pub cache: CacheBackendConfig,
    pub environment: String,
    pub cursor_secret: String,
    pub embedding: EmbeddingConfig,
    pub rate_limit: RateLimitConfig,
    pub txn_retry: TxnRetryConfig,
    pub query_cache: QueryCacheConfig,
    pub audit_retention_days: u32,
    pub http_bind: String,
}

impl EngramConfig {
    /// Load and validate configuration from the environment.
    pub fn from_env() -> EngramResult<Self> {
        let data_dir = resolve_data_dir()?;

        let storage = match env_or_default("ENGRAM_DB_BACKEND").as_str() {
            "sqlite" => StorageBackendConfig::Sqlite {
                path: data_dir.join(env_or_default("ENGRAM_DB_PATH")),
            },
            "postgres" => StorageBackendConfig::Postgres {
                host: env_or_default("ENGRAM_PG_HOST"),
                port: parse_env("ENGRAM_PG_PORT")?,
                dbname: env_or_default("ENGRAM_PG_DBNAME"),
                user: env_or_default("ENGRAM_PG_USER"),
                password: env_or_default("ENGRAM_PG_PASSWORD"),
                pool_size: parse_env("ENGRAM_PG_POOL_SIZE")?,
            },
            other => {
                return Err(SystemError::Config {
                    reason: format!("ENGRAM_DB_BACKEND: unknown backend '{other}'"),
                }
                .into())
            }
        };

        let provider = match env_or_default("ENGRAM_EMBEDDING_PROVIDER").as_str() {
            "disabled" => EmbeddingProviderKind::Disabled,
            "stub" => EmbeddingProviderKind::Stub,
            "http" => EmbeddingProviderKind::Http,
            other => {
                return Err(SystemError::Config {
                    reason: format!("ENGRAM_EMBEDDING_PROVIDER: unknown provider '{other}'"),
                }
                .into())
            }
        };

        let cache = match env_or_default("ENGRAM_CACHE_BACKEND").as_str() {
            "memory" => CacheBackendConfig::Memory,
            "redis" => CacheBackendConfig::Redis {
                url: env_or_default("ENGRAM_REDIS_URL"),
            },
            other => {
                return Err(SystemError::Config {
                    reason: format!("ENGRAM_CACHE_BACKEND: unknown backend '{other}'"),
                }
                .into())
            }
        };

        let config = Self {
            data_dir,
            storage,
            cache,
            environment: env_or_default("ENGRAM_ENV"),
            cursor_secret: env_or_default("ENGRAM_CURSOR_SECRET"),
            embedding: EmbeddingConfig {
                provider,
                model: env_or_default("ENGRAM_EMBEDDING_MODEL"),
                api_key: env_or_default("ENGRAM_EMBEDDING_API_KEY"),
                url: env_or_default("ENGRAM_EMBEDDING_URL"),
                dimension: parse_env("ENGRAM_EMBEDDING_DIMENSION")?,
                timeout: Duration::from_millis(parse_env("ENGRAM_EMBEDDING_TIMEOUT_MS")?),
                max_attempts: parse_env("ENGRAM_EMBEDDING_MAX_ATTEMPTS")?,
                queue_capacity: parse_env("ENGRAM_EMBEDDING_QUEUE_CAPACITY")?,
                workers: parse_env("ENGRAM_EMBEDDING_WORKERS")?,
            },
            rate_limit: RateLimitConfig {
                enabled: parse_env("ENGRAM_RATE_LIMIT_ENABLED")?,
                read: RateClass {
                    per_minute: parse_env("ENGRAM_RATE_LIMIT_READ")?,
                    burst: parse_env("ENGRAM_RATE_LIMIT_BURST")?,
                },
                write: RateClass {
                    per_minute: parse_env("ENGRAM_RATE_LIMIT_WRITE")?,
                    burst: parse_env("ENGRAM_RATE_LIMIT_BURST")?,
                },
                query: RateClass {
                    per_minute: parse_env("ENGRAM_RATE_LIMIT_QUERY")?,
                    burst: parse_env("ENGRAM_RATE_LIMIT_BURST")?,
                },
                admin: RateClass {
                    per_minute: parse_env("ENGRAM_RATE_LIMIT_ADMIN")?,
                    burst: parse_env("ENGRAM_RATE_LIMIT_BURST")?,
                },
            },
            txn_retry: TxnRetryConfig {
                max_retries: parse_env("ENGRAM_TXN_MAX_RETRIES")?,
                base_backoff: Duration::from_millis(parse_env("ENGRAM_TXN_BACKOFF_MS")?),
            },
            query_cache: QueryCacheConfig {
                max_bytes: parse_env("ENGRAM_QUERY_CACHE_BYTES")?,
                ttl: Duration::from_secs(parse_env("ENGRAM_QUERY_CACHE_TTL_SECS")?),
            },
            audit_retention_days: parse_env("ENGRAM_AUDIT_RETENTION_DAYS")?,
            http_bind: env_or_default("ENGRAM_HTTP_BIND"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints. Called by `from_env` and by
    /// explicit `reload()` paths.
    pub fn validate(&self) -> EngramResult<()> {
        if !matches!(
            self.environment.as_str(),
            "development" | "staging" | "production"
        ) {
            return Err(SystemError::Config {
                reason: format!("ENGRAM_ENV: unknown environment '{}'", self.environment),
            }
            .into());
        }
        if self.cursor_secret.trim().is_empty() {
            return Err(SystemError::Config {
                reason: "ENGRAM_CURSOR_SECRET must be non-empty and non-whitespace".into(),
            }
            .into());
        }
        if self.embedding.provider == EmbeddingProviderKind::Http {
            if self.embedding.url.is_empty() {
                return Err(SystemError::Config {
                    reason: "ENGRAM_EMBEDDING_URL required for the http provider".into(),
                }
                .into());
            }
            if self.embedding.api_key.is_empty() {
                return Err(SystemError::Config {
                    reason: "ENGRAM_EMBEDDING_API_KEY required for the http provider".into(),
                }
                .into());
            }
        }
        if self.embedding.workers == 0 || self.embedding.queue_capacity == 0 {
            return Err(SystemError::Config {
                reason: "embedding workers and queue capacity must be positive".into(),
            }
            .into());
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

/// Resolve the data directory: env var, then `~/.agent-memory`, then error
/// if unwritable.
pub fn resolve_data_dir() -> EngramResult<PathBuf> {
    let dir = match std::env::var("ENGRAM_DATA_DIR") {
        Ok(explicit) if !explicit.trim().is_empty() => PathBuf::from(explicit),
        _ => dirs::home_dir()
            .ok_or_else(|| SystemError::Config {
                reason: "cannot determine home directory; set ENGRAM_DATA_DIR".into(),
            })?
            .join(".agent-memory"),
    };

    std::fs::create_dir_all(&dir).map_err(|e| SystemError::Io {
        reason: format!("data directory {} is not writable: {e}", dir.display()),
    })?;

    // Probe writability; creation alone can succeed on a read-only mount.
    let probe = dir.join(".write-probe");
    std::fs::write(&probe, b"ok").map_err(|e| SystemError::Io {
        reason: format!("data directory {} is not writable: {e}", dir.display()),
    })?;
    let _ = std::fs::remove_file(&probe);

    Ok(dir)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(dir: &std::path::Path) -> EngramConfig {
        EngramConfig {
            data_dir: dir.to_path_buf(),
            storage: StorageBackendConfig::Sqlite {
                path: dir.join("engram.db"),
            },
            cache: CacheBackendConfig::Memory,
            environment: "development".into(),
            cursor_secret: "test-secret".into(),
            embedding: EmbeddingConfig {
                provider: EmbeddingProviderKind::Disabled,
                model: "stub".into(),
                api_key: String::new(),
                url: String::new(),
                dimension: 8,
                timeout: Duration::from_secs(5),
                max_attempts: 3,
                queue_capacity: 16,
                workers: 2,
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                read: RateClass { per_minute: 120, burst: 10 },
                write: RateClass { per_minute: 60, burst: 10 },
                query: RateClass { per_minute: 120, burst: 10 },
                admin: RateClass { per_minute: 30, burst: 10 },
            },
            txn_retry: TxnRetryConfig {
                max_retries: 3,
                base_backoff: Duration::from_millis(10),
            },
            query_cache: QueryCacheConfig {
                max_bytes: 1 << 20,
                ttl: Duration::from_secs(60),
            },
            audit_retention_days: 30,
            http_bind: "127.0.0.1:0".into(),
        }
    }

    #[test]
    fn test_validate_rejects_blank_cursor_secret() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.cursor_secret = "   ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.environment = "prod".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_provider_requires_url_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.embedding.provider = EmbeddingProviderKind::Http;
        assert!(config.validate().is_err());
        config.embedding.url = "https://embeddings.example".into();
        config.embedding.api_key = "key".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_registry_has_no_duplicate_keys() {
        let mut keys: Vec<_> = CONFIG_OPTIONS.iter().map(|o| o.env_key).collect();
        keys.sort_unstable();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len());
    }
}
