//! Full rebuild of the graph from the fact log, and a structural diff
//! against the live graph.
//!
//! An empty [`ReplayDiscrepancy`] is the normal state. Anything else points
//! at a projection defect or an incompatible change to a historical mapping.

use std::collections::BTreeSet;

use serde::Serialize;
use signalfold::{
    Embedder, EmbeddingCache, EngineConfig, EntityId, FactLog, GraphSnapshot, GraphStore,
    MemoryGraph, ProjectedOp, Register, Seq,
};
use tracing::{info, warn};

use crate::enrich::CauseHeat;
use crate::executor::Executor;
use crate::orchestrator::warm_cache;
use crate::projector::project;
use crate::{EngineError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayOptions {
    /// First seq to replay. `0` replays the whole history.
    pub from: Seq,
    /// Last seq to replay; `None` means the log head.
    pub until: Option<Seq>,
    /// Re-run cause-heat on the rebuilt graph and report stale stored values.
    pub verify_enrichment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleValue {
    pub entity: EntityId,
    pub key: String,
    pub stored: f64,
    pub recomputed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyMismatch {
    /// Node or edge storage key.
    pub target: String,
    pub key: String,
    pub expected: Option<serde_json::Value>,
    pub actual: Option<serde_json::Value>,
}

/// Result of [`diff`]: what the live graph gets wrong relative to a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplayDiscrepancy {
    pub missing_nodes: Vec<String>,
    pub unexpected_nodes: Vec<String>,
    pub property_mismatches: Vec<PropertyMismatch>,
    pub missing_edges: Vec<String>,
    pub unexpected_edges: Vec<String>,
    pub edge_mismatches: Vec<PropertyMismatch>,
    pub stale_derived: Vec<StaleValue>,
    /// Replayed events whose operations did not all take effect.
    pub unprojected: Vec<Seq>,
}

impl ReplayDiscrepancy {
    pub fn is_empty(&self) -> bool {
        self.missing_nodes.is_empty()
            && self.unexpected_nodes.is_empty()
            && self.property_mismatches.is_empty()
            && self.missing_edges.is_empty()
            && self.unexpected_edges.is_empty()
            && self.edge_mismatches.is_empty()
            && self.stale_derived.is_empty()
            && self.unprojected.is_empty()
    }

    pub fn total(&self) -> usize {
        self.missing_nodes.len()
            + self.unexpected_nodes.len()
            + self.property_mismatches.len()
            + self.missing_edges.len()
            + self.unexpected_edges.len()
            + self.edge_mismatches.len()
            + self.stale_derived.len()
            + self.unprojected.len()
    }
}

/// A rebuilt graph and what could not be rebuilt.
#[derive(Debug, Clone)]
pub struct Replay {
    pub snapshot: GraphSnapshot,
    pub events: usize,
    pub unprojected: Vec<Seq>,
    pub stale_derived: Vec<StaleValue>,
}

/// Project and apply `[from, until]` into a scratch in-memory graph.
///
/// Failed operations are retried until a pass makes no progress, so the
/// result does not depend on how the history is paged.
pub fn replay(
    log: &FactLog,
    cache: &EmbeddingCache,
    embedder: &dyn Embedder,
    config: &EngineConfig,
    options: &ReplayOptions,
) -> Result<Replay> {
    let scratch = MemoryGraph::new();
    let executor = Executor::from_config(config);
    let until = match options.until {
        Some(until) => until,
        None => log.last_seq().map_err(EngineError::Log)?,
    };

    let mut cursor = log
        .read_range(options.from, until)
        .map_err(EngineError::Log)?
        .with_page_size(config.batch_size);
    let mut events = 0usize;
    let mut unprojected: BTreeSet<Seq> = BTreeSet::new();
    let mut deferred: Vec<ProjectedOp> = Vec::new();

    loop {
        let page: Vec<_> = cursor
            .by_ref()
            .take(config.batch_size)
            .collect::<signalfold::Result<Vec<_>>>()
            .map_err(EngineError::Log)?;
        if page.is_empty() {
            break;
        }
        events += page.len();
        let unembeddable = warm_cache(&page, cache, embedder);
        let projection = project(&page, cache);
        unprojected.extend(
            projection
                .errors
                .iter()
                .map(|e| e.seq())
                .filter(|seq| !unembeddable.contains(seq)),
        );
        let report = executor.apply(&projection.ops, &scratch);
        deferred.extend(report.retryable_failures(&projection.ops));
    }

    while !deferred.is_empty() {
        let report = executor.apply(&deferred, &scratch);
        let still = report.retryable_failures(&deferred);
        if still.len() == deferred.len() {
            break;
        }
        deferred = still;
    }
    unprojected.extend(deferred.iter().map(|op| op.seq));

    let snapshot = scratch.snapshot().map_err(EngineError::Graph)?;
    let stale_derived = if options.verify_enrichment {
        stale_heat(&snapshot, cache, embedder, config)
    } else {
        Vec::new()
    };

    info!(
        events,
        nodes = snapshot.nodes.len(),
        edges = snapshot.edges.len(),
        unprojected = unprojected.len(),
        "replay finished"
    );
    Ok(Replay {
        snapshot,
        events,
        unprojected: unprojected.into_iter().collect(),
        stale_derived,
    })
}

fn stale_heat(
    snapshot: &GraphSnapshot,
    cache: &EmbeddingCache,
    embedder: &dyn Embedder,
    config: &EngineConfig,
) -> Vec<StaleValue> {
    let (scores, _) = CauseHeat::from_config(config).scores(snapshot, cache, embedder);
    scores
        .into_iter()
        .filter_map(|(key, recomputed)| {
            let stored = snapshot
                .node(&key)
                .and_then(|n| n.float("cause_heat"))
                .unwrap_or(0.0);
            ((recomputed - stored).abs() > config.heat_epsilon).then(|| StaleValue {
                entity: key.id,
                key: "cause_heat".into(),
                stored,
                recomputed,
            })
        })
        .collect()
}

/// Compare a rebuilt graph (`fresh`) with the live one.
pub fn diff(fresh: &GraphSnapshot, live: &GraphSnapshot) -> ReplayDiscrepancy {
    let mut out = ReplayDiscrepancy::default();

    for (key, expected) in &fresh.nodes {
        let Some(actual) = live.nodes.get(key) else {
            out.missing_nodes.push(key.clone());
            continue;
        };
        if expected == actual {
            continue;
        }
        if expected.created != actual.created {
            out.property_mismatches.push(PropertyMismatch {
                target: key.clone(),
                key: "@created".into(),
                expected: Some(expected.created.into()),
                actual: Some(actual.created.into()),
            });
        }
        register_mismatches(key, &expected.props, &actual.props, &mut out.property_mismatches);
        // Live counters forget settled stamps, so only totals are comparable.
        let names: BTreeSet<&String> = expected
            .counters
            .keys()
            .chain(actual.counters.keys())
            .collect();
        for name in names {
            let (e, a) = (expected.counter(name), actual.counter(name));
            if e != a {
                out.property_mismatches.push(PropertyMismatch {
                    target: key.clone(),
                    key: format!("@counter:{name}"),
                    expected: Some(e.into()),
                    actual: Some(a.into()),
                });
            }
        }
    }
    out.unexpected_nodes = live
        .nodes
        .keys()
        .filter(|k| !fresh.nodes.contains_key(*k))
        .cloned()
        .collect();

    for (key, expected) in &fresh.edges {
        let Some(actual) = live.edges.get(key) else {
            out.missing_edges.push(key.clone());
            continue;
        };
        if expected == actual {
            continue;
        }
        if expected.created != actual.created {
            out.edge_mismatches.push(PropertyMismatch {
                target: key.clone(),
                key: "@created".into(),
                expected: Some(expected.created.into()),
                actual: Some(actual.created.into()),
            });
        }
        register_mismatches(key, &expected.props, &actual.props, &mut out.edge_mismatches);
    }
    out.unexpected_edges = live
        .edges
        .keys()
        .filter(|k| !fresh.edges.contains_key(*k))
        .cloned()
        .collect();

    out
}

fn register_mismatches(
    target: &str,
    expected: &std::collections::BTreeMap<String, Register>,
    actual: &std::collections::BTreeMap<String, Register>,
    out: &mut Vec<PropertyMismatch>,
) {
    let keys: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    for key in keys {
        let (e, a) = (expected.get(key), actual.get(key));
        if e != a {
            out.push(PropertyMismatch {
                target: target.to_string(),
                key: key.clone(),
                expected: e.and_then(|r| serde_json::to_value(r).ok()),
                actual: a.and_then(|r| serde_json::to_value(r).ok()),
            });
        }
    }
}

/// Replay with `options` and diff the result against `live`.
pub fn audit<G: GraphStore + ?Sized>(
    log: &FactLog,
    cache: &EmbeddingCache,
    embedder: &dyn Embedder,
    config: &EngineConfig,
    live: &G,
    options: ReplayOptions,
) -> Result<ReplayDiscrepancy> {
    let rebuilt = replay(log, cache, embedder, config, &options)?;
    let live = live.snapshot().map_err(EngineError::Graph)?;
    let mut report = diff(&rebuilt.snapshot, &live);
    report.stale_derived = rebuilt.stale_derived;
    report.unprojected = rebuilt.unprojected;
    if report.is_empty() {
        info!(events = rebuilt.events, "audit clean");
    } else {
        warn!(
            events = rebuilt.events,
            discrepancies = report.total(),
            "audit found discrepancies"
        );
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{CancelToken, Orchestrator};
    use crate::testutil::{aid, corroborated, gathering, FixedEmbedder};
    use signalfold::{
        Condition, EventPayload, GraphOp, Label, NewEvent, NodeKey, NodeRef, PropValue,
    };
    use std::sync::Arc;

    fn embedder() -> Arc<FixedEmbedder> {
        Arc::new(FixedEmbedder::with(&[
            ("Cleanup", vec![1.0, 0.0]),
            ("River cleanup", vec![0.8, 0.6]),
            ("Tool library", vec![0.0, 1.0]),
        ]))
    }

    fn populated() -> Orchestrator<MemoryGraph> {
        let o = Orchestrator::new(
            Arc::new(FactLog::open_in_memory().unwrap()),
            Arc::new(EmbeddingCache::open_in_memory("t").unwrap()),
            embedder(),
            Arc::new(MemoryGraph::new()),
            EngineConfig::default(),
        )
        .unwrap();
        for payload in [
            gathering("E1", "Cleanup", 10.0, 20.0),
            gathering("E2", "River cleanup", 10.1, 20.1),
            aid("A1", "Tool library", 10.0, 20.0),
            corroborated("E1", "https://a.org/1"),
            corroborated("E2", "https://a.org/2"),
            corroborated("E2", "https://b.org/2"),
            EventPayload::SourceScraped {
                source_id: "S1".into(),
                signals_produced: 3,
                scraped_at: "2025-01-01T00:00:00Z".into(),
            },
            EventPayload::ActorIdentified {
                actor_id: "P1".into(),
                name: "Parks Dept".into(),
                entity_id: "E1".into(),
                role: "organizer".into(),
            },
        ] {
            o.log().append(NewEvent::new("producer", payload)).unwrap();
        }
        o.run_until_idle(&CancelToken::new(), 10).unwrap();
        o
    }

    #[test]
    fn replay_of_unmodified_log_matches_live() {
        let o = populated();
        let report = o.audit(true).unwrap();
        assert!(report.is_empty(), "{report:?}");
    }

    #[test]
    fn replay_is_byte_identical_regardless_of_page_size() {
        let o = populated();
        let cache = EmbeddingCache::open_in_memory("t").unwrap();
        let fe = embedder();
        let live = o.graph().snapshot().unwrap().to_canonical_json().unwrap();
        for batch_size in [1, 3, 500] {
            let config = EngineConfig {
                batch_size,
                ..EngineConfig::default()
            };
            let options = ReplayOptions::default();
            let rebuilt = replay(o.log(), &cache, fe.as_ref(), &config, &options).unwrap();
            assert_eq!(rebuilt.snapshot.to_canonical_json().unwrap(), live);
            assert!(rebuilt.unprojected.is_empty());
        }
    }

    #[test]
    fn counters_compare_by_total_only() {
        let bump = |seq| ProjectedOp {
            seq,
            entity: "S1".into(),
            op: GraphOp::Increment {
                target: NodeRef::exact(Label::Source, "S1"),
                key: "signals_produced".into(),
                delta: 1,
            },
        };
        let mut fresh = GraphSnapshot::default();
        fresh.apply_all(&[ProjectedOp {
            seq: 1,
            entity: "S1".into(),
            op: GraphOp::UpsertNode {
                node: NodeKey::new(Label::Source, "S1"),
                props: Default::default(),
            },
        }]);
        fresh.apply_all(&(2..=6).map(bump).collect::<Vec<_>>());

        // Live has folded its settled stamps; the count is what matters.
        let mut live = fresh.clone();
        for node in live.nodes.values_mut() {
            for counter in node.counters.values_mut() {
                counter.compact(5);
            }
        }
        assert_ne!(fresh, live);
        assert!(diff(&fresh, &live).is_empty());

        live.apply_all(&[bump(7)]);
        let report = diff(&fresh, &live);
        assert_eq!(report.property_mismatches.len(), 1);
        let mismatch = &report.property_mismatches[0];
        assert_eq!(mismatch.key, "@counter:signals_produced");
        assert_eq!(mismatch.expected, Some(5.into()));
        assert_eq!(mismatch.actual, Some(6.into()));
    }

    #[test]
    fn tampered_live_graph_is_reported() {
        let o = populated();
        // Out-of-band write that no event explains.
        o.graph()
            .apply_batch(&[
                ProjectedOp {
                    seq: 999,
                    entity: "E1".into(),
                    op: GraphOp::SetProperty {
                        target: NodeRef::any_signal("E1"),
                        key: "title".into(),
                        value: Some(PropValue::Text("Vandalised".into())),
                        when: Condition::Always,
                    },
                },
                ProjectedOp {
                    seq: 999,
                    entity: "Z".into(),
                    op: GraphOp::UpsertNode {
                        node: NodeKey::new(Label::Tension, "Z"),
                        props: Default::default(),
                    },
                },
            ])
            .unwrap();

        let report = o.audit(false).unwrap();
        assert!(!report.is_empty());
        assert_eq!(report.unexpected_nodes, vec!["Tension:Z".to_string()]);
        let title = report
            .property_mismatches
            .iter()
            .find(|m| m.key == "title")
            .unwrap();
        assert_eq!(title.target, "Gathering:E1");
        assert_eq!(
            title.expected.as_ref().unwrap()["value"]["value"],
            "Cleanup"
        );
        assert_eq!(
            title.actual.as_ref().unwrap()["value"]["value"],
            "Vandalised"
        );
    }

    #[test]
    fn missing_live_state_is_reported() {
        let o = populated();
        let empty = MemoryGraph::new();
        let cache = EmbeddingCache::open_in_memory("t").unwrap();
        let report = audit(
            o.log(),
            &cache,
            embedder().as_ref(),
            o.config(),
            &empty,
            ReplayOptions::default(),
        )
        .unwrap();
        assert!(report.missing_nodes.contains(&"Gathering:E1".to_string()));
        assert!(!report.missing_edges.is_empty());
        assert!(report.unexpected_nodes.is_empty());
    }

    #[test]
    fn stale_heat_is_reported_when_enrichment_lags() {
        let o = populated();
        // A new corroboration changes E2's diversity; nothing re-enriched yet.
        o.log()
            .append(NewEvent::new("producer", corroborated("E2", "https://c.org/2")))
            .unwrap();
        let fe = embedder();
        let rebuilt = replay(
            o.log(),
            &EmbeddingCache::open_in_memory("t").unwrap(),
            fe.as_ref(),
            o.config(),
            &ReplayOptions {
                verify_enrichment: true,
                ..ReplayOptions::default()
            },
        )
        .unwrap();
        let stale: Vec<&str> = rebuilt
            .stale_derived
            .iter()
            .map(|s| s.entity.as_str())
            .collect();
        assert_eq!(stale, vec!["E1"]);
        assert!((rebuilt.stale_derived[0].recomputed - 0.8 * 3.0).abs() < 1e-6);
    }

    #[test]
    fn unresolvable_events_are_listed() {
        let log = FactLog::open_in_memory().unwrap();
        log.append(NewEvent::new("p", corroborated("ghost", "https://a.org/x")))
            .unwrap();
        let rebuilt = replay(
            &log,
            &EmbeddingCache::open_in_memory("t").unwrap(),
            embedder().as_ref(),
            &EngineConfig::default(),
            &ReplayOptions::default(),
        )
        .unwrap();
        assert_eq!(rebuilt.unprojected, vec![1]);
    }

    #[test]
    fn identical_snapshots_diff_empty() {
        let o = populated();
        let snap = o.graph().snapshot().unwrap();
        assert!(diff(&snap, &snap).is_empty());
    }
}
