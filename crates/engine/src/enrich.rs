//! Derived scores.
//!
//! Diversity and corroboration count are local: they are read straight off a
//! signal's `SOURCED_FROM` evidence edges whenever they are needed and are
//! never stored on events. Cause-heat is global and runs once per cycle as
//! an [`Enricher`], emitting `CauseHeatComputed` facts.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use signalfold::{
    cosine_similarity, signal_text, ComputeError, Embedder, EmbeddingCache, EngineConfig,
    EntityId, EventPayload, GraphSnapshot, Label, Node, NodeKey,
};
use tracing::{debug, warn};

use crate::projector::SOURCED_FROM;

/// Number of evidence edges on a signal.
pub fn corroboration_count(snapshot: &GraphSnapshot, signal: &NodeKey) -> usize {
    snapshot.edges_from(signal, SOURCED_FROM).count()
}

/// Number of distinct source domains among a signal's evidence.
pub fn diversity(snapshot: &GraphSnapshot, signal: &NodeKey) -> usize {
    snapshot
        .edges_from(signal, SOURCED_FROM)
        .filter_map(|edge| snapshot.node(&edge.key.to))
        .filter_map(|evidence| evidence.text("domain"))
        .collect::<BTreeSet<_>>()
        .len()
}

/// An embedding could not be obtained, so the entity's derived value is
/// postponed to a later cycle.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{entity}: {cause}")]
pub struct EnrichmentComputeError {
    pub entity: EntityId,
    #[serde(serialize_with = "display")]
    pub cause: ComputeError,
}

fn display<S: serde::Serializer>(e: &ComputeError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(e)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichOutcome {
    /// New facts to append.
    pub events: Vec<EventPayload>,
    pub deferred: Vec<EnrichmentComputeError>,
}

/// A global enrichment phase. Reads a snapshot, never writes the graph.
pub trait Enricher: Send + Sync {
    fn name(&self) -> &'static str;

    fn enrich(
        &self,
        snapshot: &GraphSnapshot,
        cache: &EmbeddingCache,
        embedder: &dyn Embedder,
    ) -> EnrichOutcome;
}

/// Diversity-weighted similarity of a signal's geographic neighborhood.
///
/// For each live signal E, sums `sim(E, N) * diversity(N)` over the other
/// live signals N within `window` degrees of latitude and longitude whose
/// similarity to E is at least `threshold`.
#[derive(Debug, Clone)]
pub struct CauseHeat {
    pub threshold: f32,
    pub epsilon: f64,
    pub window: f64,
}

struct Candidate<'a> {
    node: &'a Node,
    lat: f64,
    lng: f64,
    diversity: usize,
    embedding: Result<Vec<f32>, ComputeError>,
}

impl CauseHeat {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            threshold: config.similarity_threshold,
            epsilon: config.heat_epsilon,
            window: config.geo_window_degrees,
        }
    }

    /// Heat for every live signal whose neighborhood could be fully
    /// evaluated, plus the entities that had to be deferred.
    pub fn scores(
        &self,
        snapshot: &GraphSnapshot,
        cache: &EmbeddingCache,
        embedder: &dyn Embedder,
    ) -> (BTreeMap<NodeKey, f64>, Vec<EnrichmentComputeError>) {
        let mut candidates: Vec<Candidate<'_>> = Label::SIGNALS
            .iter()
            .flat_map(|label| snapshot.nodes_with_label(*label))
            .filter(|node| !node.flag("expired"))
            .filter_map(|node| {
                let (lat, lng) = (node.float("lat")?, node.float("lng")?);
                let embedding = embedding_for(node, cache, embedder);
                if let Err(cause) = &embedding {
                    if cause.is_permanent() {
                        warn!(
                            entity = %node.key.id,
                            %cause,
                            "signal text cannot be embedded; excluded from cause-heat"
                        );
                        return None;
                    }
                }
                Some(Candidate {
                    node,
                    lat,
                    lng,
                    diversity: diversity(snapshot, &node.key),
                    embedding,
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.lat
                .total_cmp(&b.lat)
                .then_with(|| a.node.key.cmp(&b.node.key))
        });

        let n = candidates.len();
        let mut heat = vec![0.0f64; n];
        let mut blocked = vec![false; n];
        for i in 0..n {
            if candidates[i].embedding.is_err() {
                blocked[i] = true;
            }
            for j in (i + 1)..n {
                if candidates[j].lat - candidates[i].lat > self.window {
                    break;
                }
                if (candidates[j].lng - candidates[i].lng).abs() > self.window {
                    continue;
                }
                let (a, b) = match (&candidates[i].embedding, &candidates[j].embedding) {
                    (Ok(a), Ok(b)) => (a, b),
                    // A neighbor we cannot see would make the sum incomplete.
                    _ => {
                        blocked[i] = true;
                        blocked[j] = true;
                        continue;
                    }
                };
                let sim = cosine_similarity(a, b);
                if sim < self.threshold {
                    continue;
                }
                let sim = f64::from(sim);
                heat[i] += sim * candidates[j].diversity as f64;
                heat[j] += sim * candidates[i].diversity as f64;
            }
        }

        let mut scores = BTreeMap::new();
        let mut deferred = Vec::new();
        for (i, candidate) in candidates.into_iter().enumerate() {
            if blocked[i] {
                let cause = match candidate.embedding {
                    Err(e) => e,
                    Ok(_) => ComputeError::Unavailable(
                        "a neighbor's embedding is unavailable".into(),
                    ),
                };
                deferred.push(EnrichmentComputeError {
                    entity: candidate.node.key.id.clone(),
                    cause,
                });
            } else {
                scores.insert(candidate.node.key.clone(), heat[i]);
            }
        }
        deferred.sort_by(|a, b| a.entity.cmp(&b.entity));
        (scores, deferred)
    }
}

/// The node's stored embedding, or the cached/computed one for its text.
fn embedding_for(
    node: &Node,
    cache: &EmbeddingCache,
    embedder: &dyn Embedder,
) -> Result<Vec<f32>, ComputeError> {
    if let Some(v) = node.prop("embedding").and_then(|p| p.as_vector()) {
        return Ok(v.to_vec());
    }
    let title = node.text("title").unwrap_or_default();
    let summary = node.text("summary").unwrap_or_default();
    cache.get_or_compute(&signal_text(title, summary), embedder)
}

impl Enricher for CauseHeat {
    fn name(&self) -> &'static str {
        "cause_heat"
    }

    fn enrich(
        &self,
        snapshot: &GraphSnapshot,
        cache: &EmbeddingCache,
        embedder: &dyn Embedder,
    ) -> EnrichOutcome {
        let (scores, deferred) = self.scores(snapshot, cache, embedder);
        let mut events = Vec::new();
        for (key, heat) in scores {
            let stored = snapshot
                .node(&key)
                .and_then(|n| n.float("cause_heat"))
                .unwrap_or(0.0);
            if (heat - stored).abs() > self.epsilon {
                events.push(EventPayload::CauseHeatComputed {
                    entity_id: key.id,
                    heat,
                });
            }
        }
        if !deferred.is_empty() {
            warn!(deferred = deferred.len(), "cause-heat postponed for some entities");
        }
        debug!(changed = events.len(), "cause-heat computed");
        EnrichOutcome { events, deferred }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
