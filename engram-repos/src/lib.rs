//! Engram Repositories - Database Gateway
//!
//! Repositories are the only component that issues SQL. They enforce the
//! store invariants (version append-only, head pointers, active-name
//! uniqueness, cascades), emit mutation events through the event adapter,
//! and hand embedding work to the configured sink. Cascade policy is
//! implemented here, never delegated to database foreign keys, so both
//! backends behave identically.

mod audit;
mod conflicts;
mod embeddings;
mod entries;
mod file_locks;
mod grants;
mod migrations;
mod relations;
mod scopes;
mod tags;
mod votes;

pub use audit::AuditRepository;
pub use conflicts::ConflictRepository;
pub use embeddings::EmbeddingRepository;
pub use entries::{EntryRepository, NewEntry};
pub use file_locks::FileLockRepository;
pub use grants::{Grant, GrantAction, GrantRepository};
pub use migrations::{run_migrations, Migration, MIGRATIONS};
pub use relations::{RelationRepository, TraversalResult};
pub use scopes::ScopeRepository;
pub use tags::TagRepository;
pub use votes::{VoteRepository, VoteTally, VoteValue};

use engram_adapters::{EventAdapter, StorageAdapter};
use engram_core::{EmbeddingJob, TxnRetryConfig};
use std::sync::Arc;

/// Sink receiving embedding jobs after successful create/update. The
/// embedding path is optional; the null sink drops jobs.
pub trait EmbeddingSink: Send + Sync {
    fn enqueue(&self, job: EmbeddingJob);
}

/// Sink used when the semantic path is disabled.
pub struct NullEmbeddingSink;

impl EmbeddingSink for NullEmbeddingSink {
    fn enqueue(&self, _job: EmbeddingJob) {}
}

/// Construction-time dependencies shared by every repository.
#[derive(Clone)]
pub struct DbDeps {
    pub storage: Arc<dyn StorageAdapter>,
    pub events: Arc<dyn EventAdapter>,
    pub retry: TxnRetryConfig,
}

impl DbDeps {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        events: Arc<dyn EventAdapter>,
        retry: TxnRetryConfig,
    ) -> Self {
        Self {
            storage,
            events,
            retry,
        }
    }
}

/// Whether an adapter error is a unique-constraint violation. Both
/// backends mention "unique" in the failure text; this is the portable
/// signal used by insert-or-conflict flows.
pub(crate) fn is_unique_violation(err: &engram_core::EngramError) -> bool {
    match err {
        engram_core::EngramError::Database(engram_core::DatabaseError::Query { reason }) => {
            reason.to_lowercase().contains("unique")
                || reason.to_lowercase().contains("duplicate key")
        }
        _ => false,
    }
}
