//! signalfold-engine: the projection pipeline over a [`signalfold::FactLog`].
//!
//! - [`projector`]: pure mapping from events to stamped graph operations.
//! - [`executor`]: applies operations per entity batch with bounded retry.
//! - [`enrich`]: derived scores. Diversity and corroboration are read
//!   straight off the snapshot; cause-heat is a global phase that appends
//!   `CauseHeatComputed` facts.
//! - [`orchestrator`]: the Project → Apply → Enrich → Project → Apply cycle
//!   with a durable watermark.
//! - [`replay`]: full rebuild into a scratch graph and structural diff.

pub mod enrich;
pub mod executor;
pub mod orchestrator;
pub mod projector;
pub mod replay;

pub use enrich::{
    corroboration_count, diversity, CauseHeat, EnrichOutcome, Enricher, EnrichmentComputeError,
};
pub use executor::{ApplyReport, Executor, OpOutcome};
pub use orchestrator::{CancelToken, CycleDetail, CyclePhase, CycleReport, Orchestrator};
pub use projector::{project, project_sharded, Projection, ProjectionError};
pub use replay::{
    audit, diff, replay, PropertyMismatch, Replay, ReplayDiscrepancy, ReplayOptions, StaleValue,
};

use signalfold::{ConfigError, EntityId, SignalfoldError};

/// Failures that abort a cycle. Everything else is reported and retried.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("fact log unavailable: {0}")]
    Log(#[source] SignalfoldError),
    #[error("graph store unavailable: {0}")]
    Graph(#[source] SignalfoldError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable shard index for `entity` among `shards` workers.
pub(crate) fn shard_of(entity: &EntityId, shards: usize) -> usize {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in entity.as_str().as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (h % shards.max(1) as u64) as usize
}
