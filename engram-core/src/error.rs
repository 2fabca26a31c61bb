//! Error types for Engram operations
//!
//! The taxonomy is closed and numeric-coded. Each category owns a range:
//! validation 1000-1999, resource 2000-2999, locks 3000-3999, database
//! 4000-4999, system 5000-5999, permission 6000-6999, extraction
//! 7000-7999, embedding 8000-8999, vector store 9000-9999, network 10000+.

use crate::{AgentId, ScopeRef};
use thiserror::Error;

/// Validation errors (1000-1999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("required field missing: {field}")]
    MissingField { field: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("{field} out of range [{min}, {max}]")]
    OutOfRange { field: String, min: i64, max: i64 },

    #[error("malformed identifier for {field}: {input}")]
    InvalidIdentifier { field: String, input: String },

    #[error("invalid scope reference: {reason}")]
    InvalidScope { reason: String },

    #[error("invalid cursor: {reason}")]
    InvalidCursor { reason: String },

    #[error("cursor of {size} bytes exceeds maximum {max}")]
    CursorTooLarge { size: usize, max: usize },

    #[error("input frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown action '{action}' for tool '{tool}'")]
    UnknownAction { tool: String, action: String },
}

impl ValidationError {
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::MissingField { .. } => 1001,
            ValidationError::InvalidValue { .. } => 1002,
            ValidationError::OutOfRange { .. } => 1003,
            ValidationError::InvalidIdentifier { .. } => 1004,
            ValidationError::InvalidScope { .. } => 1005,
            ValidationError::InvalidCursor { .. } => 1006,
            ValidationError::CursorTooLarge { .. } => 1007,
            ValidationError::FrameTooLarge { .. } => 1008,
            ValidationError::UnknownAction { .. } => 1009,
        }
    }
}

/// Resource errors (2000-2999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResourceError {
    #[error("{record} not found: {id}")]
    NotFound { record: &'static str, id: String },

    #[error("{record} '{name}' already exists in scope {scope}")]
    AlreadyExists {
        record: &'static str,
        name: String,
        scope: String,
    },

    #[error("state conflict: {reason}")]
    StateConflict { reason: String },

    #[error("version {version} not found for entry {entry_id}")]
    VersionNotFound { entry_id: String, version: i32 },
}

impl ResourceError {
    pub fn code(&self) -> u32 {
        match self {
            ResourceError::NotFound { .. } => 2001,
            ResourceError::AlreadyExists { .. } => 2002,
            ResourceError::StateConflict { .. } => 2003,
            ResourceError::VersionNotFound { .. } => 2004,
        }
    }
}

/// Lock errors (3000-3999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LockError {
    #[error("{path} is locked by {owner}")]
    AlreadyLocked { path: String, owner: AgentId },

    #[error("lock on {path} is not held by the caller")]
    NotOwner { path: String },

    #[error("lock on {path} has expired")]
    Expired { path: String },

    #[error("lock token does not match")]
    TokenMismatch,
}

impl LockError {
    pub fn code(&self) -> u32 {
        match self {
            LockError::AlreadyLocked { .. } => 3001,
            LockError::NotOwner { .. } => 3002,
            LockError::Expired { .. } => 3003,
            LockError::TokenMismatch => 3004,
        }
    }
}

/// Database and adapter errors (4000-4999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DatabaseError {
    #[error("connection failed: {reason}")]
    Connection { reason: String },

    #[error("query failed: {reason}")]
    Query { reason: String },

    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// Retryable: busy/locked/deadlock/serialization.
    #[error("database busy: {reason}")]
    Busy { reason: String },

    #[error("migration failed: {reason}")]
    Migration { reason: String },

    #[error("row decode failed: {reason}")]
    Decode { reason: String },
}

impl DatabaseError {
    pub fn code(&self) -> u32 {
        match self {
            DatabaseError::Connection { .. } => 4001,
            DatabaseError::Query { .. } => 4002,
            DatabaseError::Transaction { .. } => 4003,
            DatabaseError::Busy { .. } => 4004,
            DatabaseError::Migration { .. } => 4005,
            DatabaseError::Decode { .. } => 4006,
        }
    }
}

/// System/internal errors (5000-5999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SystemError {
    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error("operation '{operation}' timed out")]
    Timeout { operation: String },

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("io error: {reason}")]
    Io { reason: String },

    #[error("configuration error: {reason}")]
    Config { reason: String },
}

impl SystemError {
    pub fn code(&self) -> u32 {
        match self {
            SystemError::Internal { .. } => 5001,
            SystemError::Timeout { .. } => 5002,
            SystemError::ShuttingDown => 5003,
            SystemError::Io { .. } => 5004,
            SystemError::Config { .. } => 5005,
        }
    }
}

/// Permission errors (6000-6999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PermissionError {
    #[error("agent {agent} denied {action} on {scope}")]
    Denied {
        agent: AgentId,
        action: String,
        scope: ScopeRef,
    },

    #[error("agent {agent} rate limited on class {class}")]
    RateLimited {
        agent: AgentId,
        class: String,
        retry_after_ms: Option<u64>,
    },
}

impl PermissionError {
    pub fn code(&self) -> u32 {
        match self {
            PermissionError::Denied { .. } => 6001,
            PermissionError::RateLimited { .. } => 6002,
        }
    }
}

/// Extraction errors (7000-7999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error("extraction failed: {reason}")]
    Failed { reason: String },
}

impl ExtractionError {
    pub fn code(&self) -> u32 {
        7001
    }
}

/// Embedding errors (8000-8999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EmbeddingError {
    #[error("no embedding provider configured")]
    ProviderNotConfigured,

    #[error("embedding request failed with status {status}: {message}")]
    RequestFailed { status: u16, message: String },

    #[error("embedding provider rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("embedding queue is full")]
    QueueFull,

    #[error("embedding job is stale: version is no longer head")]
    StaleVersion,

    #[error("embedding permanently failed after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

impl EmbeddingError {
    pub fn code(&self) -> u32 {
        match self {
            EmbeddingError::ProviderNotConfigured => 8001,
            EmbeddingError::RequestFailed { .. } => 8002,
            EmbeddingError::RateLimited { .. } => 8003,
            EmbeddingError::QueueFull => 8004,
            EmbeddingError::StaleVersion => 8005,
            EmbeddingError::Exhausted { .. } => 8006,
        }
    }
}

/// Vector store errors (9000-9999).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VectorStoreError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("invalid vector: {reason}")]
    InvalidVector { reason: String },
}

impl VectorStoreError {
    pub fn code(&self) -> u32 {
        match self {
            VectorStoreError::DimensionMismatch { .. } => 9001,
            VectorStoreError::Unavailable { .. } => 9002,
            VectorStoreError::InvalidVector { .. } => 9003,
        }
    }
}

/// Network errors (10000+).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetworkError {
    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("network timeout after {ms}ms")]
    Timeout { ms: u64 },
}

impl NetworkError {
    pub fn code(&self) -> u32 {
        match self {
            NetworkError::Transport { .. } => 10001,
            NetworkError::Timeout { .. } => 10002,
        }
    }
}

// ============================================================================
// MASTER ERROR
// ============================================================================

/// Master error type for all Engram operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngramError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Vector(#[from] VectorStoreError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl EngramError {
    /// Numeric code per the closed taxonomy.
    pub fn code(&self) -> u32 {
        match self {
            EngramError::Validation(e) => e.code(),
            EngramError::Resource(e) => e.code(),
            EngramError::Lock(e) => e.code(),
            EngramError::Database(e) => e.code(),
            EngramError::System(e) => e.code(),
            EngramError::Permission(e) => e.code(),
            EngramError::Extraction(e) => e.code(),
            EngramError::Embedding(e) => e.code(),
            EngramError::Vector(e) => e.code(),
            EngramError::Network(e) => e.code(),
        }
    }

    /// Whether a transaction wrapper may retry the operation.
    /// Only busy/locked/deadlock/serialization classes qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngramError::Database(DatabaseError::Busy { .. }))
    }

    /// Shorthand constructors used pervasively.
    pub fn missing_field(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
        .into()
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
        .into()
    }

    pub fn not_found(record: &'static str, id: impl std::fmt::Display) -> Self {
        ResourceError::NotFound {
            record,
            id: id.to_string(),
        }
        .into()
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        SystemError::Internal {
            reason: reason.into(),
        }
        .into()
    }
}

/// Result alias used by every fallible Engram API.
pub type EngramResult<T> = Result<T, EngramError>;

// ============================================================================
// TESTS
// ============================================================================
