//! Engram Services - Cross-Cutting Policy and Side Effects
//!
//! Services sit between the repositories and the tool handlers: permission
//! checks at every mutating boundary, per-agent rate limiting, the
//! asynchronous embedding path, the vector store, guideline verification,
//! and the failure-isolated audit writer.

mod audit;
mod embedding;
mod permission;
mod rate_limit;
mod vector;
mod verification;

pub use audit::AuditService;
pub use embedding::{
    reindex, EmbeddingProvider, EmbeddingWorkerPool, HttpEmbeddingProvider, ReindexOptions,
    ReindexReport, StubEmbeddingProvider,
};
pub use permission::PermissionService;
pub use rate_limit::{OperationClass, RateLimiter};
pub use vector::{FileVectorStore, InMemoryVectorStore, VectorStore};
pub use verification::{
    escape_for_prompt, ProposedAction, VerificationOutcome, VerificationService, Violation,
    ViolationSeverity,
};
