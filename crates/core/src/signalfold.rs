//! signalfold: event-sourced projection of observed facts into a property graph.
//!
//! The core primitive is an [`Event`]: an immutable, typed observation
//! appended once to the [`FactLog`] and given a strictly increasing sequence
//! number. Everything else in the system is derived from that log:
//!
//! - the materialized property graph (see [`graph`] and [`graph_store`]),
//!   written only through stamped, idempotent [`GraphOp`]s;
//! - the [`EmbeddingCache`], a get-or-compute memo keyed by model version and
//!   normalized text.
//!
//! The projection pipeline itself (projector, executor, enrichers,
//! orchestrator, replay audit) lives in the `signalfold-engine` crate.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use signalfold::{EntityId, EventPayload, FactLog, GatheringDiscovered, NewEvent};
//!
//! let log = FactLog::open("facts.redb").unwrap();
//! let seq = log
//!     .append(NewEvent::new(
//!         "harvester-run-1",
//!         EventPayload::GatheringDiscovered(GatheringDiscovered::new(
//!             EntityId::from("E1"),
//!             "Cleanup",
//!             10.0,
//!             20.0,
//!         )),
//!     ))
//!     .unwrap();
//!
//! for event in log.read_from(seq).unwrap() {
//!     let event = event.unwrap();
//!     println!("{} {}", event.seq, event.payload.type_tag());
//! }
//! ```

pub mod config;
pub mod embedding;
pub mod event;
pub mod fact_log;
pub mod graph;
pub mod graph_store;
mod vector;

pub use config::{ConfigError, EngineConfig};
pub use embedding::{
    normalize_text, signal_text, ComputeError, Embedder, EmbeddingCache, EmbeddingLookup,
    HashingEmbedder,
};
pub use event::{
    AidDiscovered, EntityId, Event, EventPayload, GatheringDiscovered, GatheringRescheduled, Label,
    Level, NeedDiscovered, NewEvent, Seq, SignalCore, SourceChange, TensionDiscovered,
    ValidationError,
};
pub use fact_log::{EventCursor, FactLog};
pub use graph::{
    ApplyError, Condition, Counter, Edge, EdgeKey, GraphOp, GraphSnapshot, Node, NodeKey, NodeRef,
    ProjectedOp, PropValue, Register,
};
pub use graph_store::{BatchOutcomes, Checkpoint, GraphStore, MemoryGraph, RedbGraph};
pub use vector::{cosine_similarity, l2_norm};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SignalfoldError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for SignalfoldError {
    fn from(e: redb::DatabaseError) -> Self {
        SignalfoldError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for SignalfoldError {
    fn from(e: redb::TransactionError) -> Self {
        SignalfoldError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for SignalfoldError {
    fn from(e: redb::TableError) -> Self {
        SignalfoldError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for SignalfoldError {
    fn from(e: redb::StorageError) -> Self {
        SignalfoldError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for SignalfoldError {
    fn from(e: redb::CommitError) -> Self {
        SignalfoldError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SignalfoldError>;
