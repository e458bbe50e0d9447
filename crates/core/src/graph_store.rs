//! Graph store adapters.
//!
//! A [`GraphStore`] offers two capabilities: a write path
//! ([`GraphStore::apply_batch`], used only by the executor) and a read-only
//! [`GraphSnapshot`]. The checkpoint (watermark plus deferred work) lives with
//! the graph, because it describes how far the graph has caught up.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::event::Seq;
use crate::graph::{apply_op, ApplyError, Edge, GraphSnapshot, GraphTxn, Node, ProjectedOp};
use crate::{Result, SignalfoldError};

/// Progress marker persisted alongside the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last fact-log seq whose operations have all been attempted.
    pub watermark: Seq,
    /// Operations that failed and must be retried.
    pub deferred: Vec<ProjectedOp>,
    /// Events at or below the watermark that still need a full re-projection.
    pub pending: BTreeSet<Seq>,
}

impl Checkpoint {
    pub fn is_settled(&self) -> bool {
        self.deferred.is_empty() && self.pending.is_empty()
    }

    /// Highest seq below which every operation has been applied or dropped
    /// for good. Counter stamps up to here no longer need to be remembered.
    pub fn counter_floor(&self) -> Seq {
        let deferred = self.deferred.iter().map(|op| op.seq).min();
        let pending = self.pending.first().copied();
        [deferred, pending]
            .into_iter()
            .flatten()
            .map(|seq| seq.saturating_sub(1))
            .fold(self.watermark, Seq::min)
    }
}

/// One outcome per op handed to [`GraphStore::apply_batch`].
pub type BatchOutcomes = Vec<std::result::Result<(), ApplyError>>;

pub trait GraphStore: Send + Sync {
    /// Apply `ops` in order and report one outcome per op. A failed op leaves
    /// no trace; earlier successes in the batch are kept. An outer `Err`
    /// means nothing from this batch was persisted.
    fn apply_batch(&self, ops: &[ProjectedOp]) -> Result<BatchOutcomes>;

    /// A consistent point-in-time copy of the graph.
    fn snapshot(&self) -> Result<GraphSnapshot>;

    fn load_checkpoint(&self) -> Result<Checkpoint>;

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Mutex-guarded in-memory graph. Used for replay scratch graphs and tests.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    state: Mutex<(GraphSnapshot, Checkpoint)>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, (GraphSnapshot, Checkpoint)>> {
        self.state
            .lock()
            .map_err(|_| SignalfoldError::Internal("memory graph lock poisoned".into()))
    }
}

impl GraphStore for MemoryGraph {
    fn apply_batch(&self, ops: &[ProjectedOp]) -> Result<BatchOutcomes> {
        let mut state = self.lock()?;
        let floor = state.1.counter_floor();
        Ok(state.0.apply_settled(ops, floor))
    }

    fn snapshot(&self) -> Result<GraphSnapshot> {
        Ok(self.lock()?.0.clone())
    }

    fn load_checkpoint(&self) -> Result<Checkpoint> {
        Ok(self.lock()?.1.clone())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.lock()?.1 = checkpoint.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// redb store
// ---------------------------------------------------------------------------

/// Nodes keyed by `"Label:id"`, stored as JSON.
const NODES: TableDefinition<&str, &str> = TableDefinition::new("nodes");

/// Edges keyed by `"{from}\u{1f}{rel}\u{1f}{to}"`, stored as JSON.
const EDGES: TableDefinition<&str, &str> = TableDefinition::new("edges");

/// Key `"checkpoint"` holds the JSON [`Checkpoint`].
const META: TableDefinition<&str, &str> = TableDefinition::new("graph_meta");

const CHECKPOINT_KEY: &str = "checkpoint";

/// Key holding [`Checkpoint::counter_floor`] of the saved checkpoint, so
/// writers need not decode the whole checkpoint.
const COUNTER_FLOOR_KEY: &str = "counter_floor";

/// Durable graph on redb. Each [`GraphStore::apply_batch`] call is one write
/// transaction.
pub struct RedbGraph {
    db: Database,
}

impl RedbGraph {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(NODES)?;
        write_txn.open_table(EDGES)?;
        write_txn.open_table(META)?;
        write_txn.commit()?;
        Ok(Self { db })
    }
}

struct RedbTxn<'t> {
    nodes: redb::Table<'t, &'static str, &'static str>,
    edges: redb::Table<'t, &'static str, &'static str>,
}

fn backend(e: impl std::fmt::Display) -> ApplyError {
    ApplyError::Backend(e.to_string())
}

impl GraphTxn for RedbTxn<'_> {
    fn get_node(&mut self, key: &str) -> std::result::Result<Option<Node>, ApplyError> {
        let json: Option<String> = self
            .nodes
            .get(key)
            .map_err(backend)?
            .map(|g| g.value().to_string());
        json.map(|j| serde_json::from_str(&j).map_err(backend))
            .transpose()
    }

    fn put_node(&mut self, node: Node) -> std::result::Result<(), ApplyError> {
        let json = serde_json::to_string(&node).map_err(backend)?;
        self.nodes
            .insert(node.key.storage_key().as_str(), json.as_str())
            .map_err(backend)?;
        Ok(())
    }

    fn get_edge(&mut self, key: &str) -> std::result::Result<Option<Edge>, ApplyError> {
        let json: Option<String> = self
            .edges
            .get(key)
            .map_err(backend)?
            .map(|g| g.value().to_string());
        json.map(|j| serde_json::from_str(&j).map_err(backend))
            .transpose()
    }

    fn put_edge(&mut self, edge: Edge) -> std::result::Result<(), ApplyError> {
        let json = serde_json::to_string(&edge).map_err(backend)?;
        self.edges
            .insert(edge.key.storage_key().as_str(), json.as_str())
            .map_err(backend)?;
        Ok(())
    }
}

impl GraphStore for RedbGraph {
    fn apply_batch(&self, ops: &[ProjectedOp]) -> Result<BatchOutcomes> {
        let write_txn = self.db.begin_write()?;
        let floor = {
            let meta = write_txn.open_table(META)?;
            let stored = meta.get(COUNTER_FLOOR_KEY)?.map(|g| g.value().to_string());
            match stored {
                Some(v) => v.parse::<Seq>().map_err(|e| {
                    SignalfoldError::Internal(format!("bad counter floor {v:?}: {e}"))
                })?,
                None => 0,
            }
        };
        let outcomes = {
            let mut txn = RedbTxn {
                nodes: write_txn.open_table(NODES)?,
                edges: write_txn.open_table(EDGES)?,
            };
            ops.iter()
                .map(|op| apply_op(&mut txn, op, floor))
                .collect::<Vec<_>>()
        };
        write_txn.commit()?;
        Ok(outcomes)
    }

    fn snapshot(&self) -> Result<GraphSnapshot> {
        let read_txn = self.db.begin_read()?;
        let nodes_table = read_txn.open_table(NODES)?;
        let edges_table = read_txn.open_table(EDGES)?;

        let mut nodes = BTreeMap::new();
        for entry in nodes_table.iter()? {
            let (k, v) = entry?;
            let node: Node = serde_json::from_str(v.value())?;
            nodes.insert(k.value().to_string(), node);
        }
        let mut edges = BTreeMap::new();
        for entry in edges_table.iter()? {
            let (k, v) = entry?;
            let edge: Edge = serde_json::from_str(v.value())?;
            edges.insert(k.value().to_string(), edge);
        }
        Ok(GraphSnapshot { nodes, edges })
    }

    fn load_checkpoint(&self) -> Result<Checkpoint> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        let json: Option<String> = meta.get(CHECKPOINT_KEY)?.map(|g| g.value().to_string());
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Checkpoint::default()),
        }
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META)?;
            meta.insert(CHECKPOINT_KEY, json.as_str())?;
            let floor = checkpoint.counter_floor().to_string();
            meta.insert(COUNTER_FLOOR_KEY, floor.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
