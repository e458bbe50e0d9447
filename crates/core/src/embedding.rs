//! Get-or-compute embedding cache.
//!
//! Entries are keyed by `(model_version, normalized text)` and stored as raw
//! little-endian `f32` bytes in redb. An entry is never rewritten once
//! present. Switching `model_version` simply stops matching the old keys;
//! nothing is deleted.

use std::path::Path;
use std::time::{Duration, Instant};

use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::vector;
use crate::{Result, SignalfoldError};

/// `"{model}\u{1f}{normalized text}" -> f32 LE bytes`.
const VECTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");

/// `"dim\u{1f}{model}" -> dimension`, set by the first insert under a model.
const META: TableDefinition<&str, u64> = TableDefinition::new("embedding_meta");

/// Collapse runs of whitespace and trim, so trivially different spellings of
/// the same text share one cache entry.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text embedded for a signal: its title followed by its summary.
pub fn signal_text(title: &str, summary: &str) -> String {
    normalize_text(&format!("{title} {summary}"))
}

/// Failure at the embedding compute boundary. Callers skip the derivation
/// for this cycle and try again next time, unless the error is permanent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputeError {
    #[error("embedding compute timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),
    #[error("embedding backend returned an invalid vector: {0}")]
    InvalidVector(String),
    #[error("embedding cache error: {0}")]
    Cache(String),
}

impl ComputeError {
    /// The text itself cannot be encoded. Retrying gives the same answer.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ComputeError::InvalidVector(_))
    }
}

/// External text encoder. Called only on a cache miss.
pub trait Embedder: Send + Sync {
    /// Encode `text`. Implementations should give up after `timeout`; results
    /// that arrive later are discarded by the cache anyway.
    fn compute(&self, text: &str, timeout: Duration) -> std::result::Result<Vec<f32>, ComputeError>;
}

/// Read-only cache access. This is all the projector is allowed to see.
pub trait EmbeddingLookup: Sync {
    fn lookup(&self, text: &str) -> Result<Option<Vec<f32>>>;
}

pub struct EmbeddingCache {
    db: Database,
    model_version: String,
    timeout: Duration,
}

impl EmbeddingCache {
    pub fn open(path: impl AsRef<Path>, model_version: impl Into<String>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db, model_version.into())
    }

    pub fn open_in_memory(model_version: impl Into<String>) -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, model_version.into())
    }

    fn init(db: Database, model_version: String) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(VECTORS)?;
        write_txn.open_table(META)?;
        write_txn.commit()?;
        Ok(Self {
            db,
            model_version,
            timeout: Duration::from_secs(5),
        })
    }

    /// Per-call budget for [`Embedder::compute`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    fn key(&self, text: &str) -> String {
        format!("{}\u{1f}{}", self.model_version, normalize_text(text))
    }

    pub fn get(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let key = self.key(text);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VECTORS)?;
        let bytes: Option<Vec<u8>> = table.get(key.as_str())?.map(|g| g.value().to_vec());
        bytes.map(|b| decode(&key, &b)).transpose()
    }

    /// Store `embedding` for `text` unless an entry already exists, and return
    /// whichever vector is now cached. The first write under a key wins.
    pub fn insert(&self, text: &str, embedding: Vec<f32>) -> Result<Vec<f32>> {
        if embedding.is_empty() {
            return Err(SignalfoldError::InvalidEmbedding(
                "embedding must not be empty".into(),
            ));
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(SignalfoldError::InvalidEmbedding(
                "embedding contains non-finite components".into(),
            ));
        }

        let key = self.key(text);
        let write_txn = self.db.begin_write()?;
        {
            let table = write_txn.open_table(VECTORS)?;
            let existing: Option<Vec<u8>> = table.get(key.as_str())?.map(|g| g.value().to_vec());
            if let Some(bytes) = existing {
                return decode(&key, &bytes);
            }
        }
        {
            let dim_key = format!("dim\u{1f}{}", self.model_version);
            let mut meta = write_txn.open_table(META)?;
            let stored_dim: Option<u64> = meta.get(dim_key.as_str())?.map(|g| g.value());
            match stored_dim {
                None => {
                    meta.insert(dim_key.as_str(), embedding.len() as u64)?;
                }
                Some(d) if d as usize != embedding.len() => {
                    return Err(SignalfoldError::InvalidEmbedding(format!(
                        "embedding dimension mismatch for model {}: expected {d}, got {}",
                        self.model_version,
                        embedding.len()
                    )));
                }
                Some(_) => {}
            }
        }
        {
            let bytes: Vec<u8> = embedding.iter().flat_map(|x| x.to_le_bytes()).collect();
            let mut table = write_txn.open_table(VECTORS)?;
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(embedding)
    }

    /// Return the cached vector for `text`, computing and caching it on a miss.
    pub fn get_or_compute(
        &self,
        text: &str,
        embedder: &dyn Embedder,
    ) -> std::result::Result<Vec<f32>, ComputeError> {
        if let Some(hit) = self.get(text).map_err(|e| ComputeError::Cache(e.to_string()))? {
            return Ok(hit);
        }

        let normalized = normalize_text(text);
        let started = Instant::now();
        let computed = embedder.compute(&normalized, self.timeout)?;
        let elapsed = started.elapsed();
        if elapsed > self.timeout {
            return Err(ComputeError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        self.insert(&normalized, computed).map_err(|e| match e {
            SignalfoldError::InvalidEmbedding(msg) => ComputeError::InvalidVector(msg),
            other => ComputeError::Cache(other.to_string()),
        })
    }

    /// Number of cached vectors across all model versions.
    pub fn len(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VECTORS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl EmbeddingLookup for EmbeddingCache {
    fn lookup(&self, text: &str) -> Result<Option<Vec<f32>>> {
        self.get(text)
    }
}

fn decode(key: &str, bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(SignalfoldError::Storage(format!(
            "corrupt embedding for {key:?}: byte length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

// ---------------------------------------------------------------------------
// Hashing embedder
// ---------------------------------------------------------------------------

/// Deterministic offline encoder: signed feature hashing over lower-cased
/// alphanumeric tokens, L2-normalised.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn compute(
        &self,
        text: &str,
        _timeout: Duration,
    ) -> std::result::Result<Vec<f32>, ComputeError> {
        let mut v = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.to_lowercase().as_bytes());
            let idx = (h % self.dim as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        if !vector::normalize(&mut v) {
            return Err(ComputeError::InvalidVector(format!(
                "no tokens to embed in {text:?}"
            )));
        }
        Ok(v)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}
