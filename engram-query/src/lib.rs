//! Engram Query - Deterministic Ranked Retrieval
//!
//! The pipeline is a linear sequence of stages over one mutable context:
//! resolve → fetch → fts → filter → tags → relations → score → format.
//! Results are cached in a byte-budgeted LRU invalidated by mutation
//! events; pagination cursors are HMAC-signed and base64url encoded.

mod cache;
mod cursor;
mod pipeline;
mod score;

pub use cache::{wire_query_cache, QueryCache, QueryCacheStats};
pub use cursor::{CursorCodec, MAX_CURSOR_BYTES};
pub use pipeline::{
    QueryDeps, QueryEngine, QueryResponse, QueryResultEntry, ScoredEntry,
};
pub use score::{final_score, rank_order, ScoreInputs};
