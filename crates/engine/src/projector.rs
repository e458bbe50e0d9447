//! Pure projection of events into stamped graph operations.
//!
//! `project` reads no clock and performs no writes. The only outside input is
//! the read-only embedding lookup; a cache miss is reported as a
//! [`ProjectionError`] and the event's remaining operations are still
//! emitted. Re-projecting the event later is safe because every operation
//! carries the event's seq as its stamp.

use std::collections::BTreeMap;

use serde::Serialize;
use signalfold::event::{parse_optional_date, url_host};
use signalfold::{
    signal_text, Condition, EmbeddingLookup, EntityId, Event, EventPayload, GraphOp, Label,
    NodeKey, NodeRef, ProjectedOp, PropValue, Seq, SignalCore, SourceChange,
};

pub const SOURCED_FROM: &str = "SOURCED_FROM";
pub const DISCOVERED_VIA: &str = "DISCOVERED_VIA";
pub const ACTED_IN: &str = "ACTED_IN";

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind")]
pub enum ProjectionError {
    /// The embedding for this signal is not cached yet.
    #[error("event {seq}: no cached embedding for {entity}")]
    EmbeddingUnavailable { seq: Seq, entity: EntityId },
    #[error("event {seq}: cannot map `{field}`: {reason}")]
    InvalidField {
        seq: Seq,
        field: &'static str,
        reason: String,
    },
}

impl ProjectionError {
    pub fn seq(&self) -> Seq {
        match self {
            ProjectionError::EmbeddingUnavailable { seq, .. }
            | ProjectionError::InvalidField { seq, .. } => *seq,
        }
    }

    /// Whether projecting the same event again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProjectionError::EmbeddingUnavailable { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Projection {
    pub ops: Vec<ProjectedOp>,
    pub errors: Vec<ProjectionError>,
}

/// Project `events` in order.
pub fn project(events: &[Event], embeddings: &dyn EmbeddingLookup) -> Projection {
    let mut out = Projection::default();
    for event in events {
        let mut rule = Rule::new(event, embeddings);
        rule.run();
        out.ops.extend(rule.ops);
        out.errors.extend(rule.errors);
    }
    out
}

/// Project with events partitioned by subject across `shards` threads.
///
/// Per-entity order is kept inside each shard and the results are merged back
/// by event position, so the output equals [`project`] on the same input.
pub fn project_sharded(
    events: &[Event],
    embeddings: &dyn EmbeddingLookup,
    shards: usize,
) -> Projection {
    if shards <= 1 || events.len() < 2 {
        return project(events, embeddings);
    }

    let mut assignment: Vec<Vec<usize>> = vec![Vec::new(); shards];
    for (i, event) in events.iter().enumerate() {
        assignment[crate::shard_of(event.payload.subject(), shards)].push(i);
    }

    let mut per_event: Vec<Option<(Vec<ProjectedOp>, Vec<ProjectionError>)>> =
        vec![None; events.len()];
    std::thread::scope(|scope| {
        let handles: Vec<_> = assignment
            .iter()
            .filter(|idx| !idx.is_empty())
            .map(|idx| {
                scope.spawn(move || {
                    idx.iter()
                        .map(|&i| {
                            let mut rule = Rule::new(&events[i], embeddings);
                            rule.run();
                            (i, rule.ops, rule.errors)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(results) => {
                    for (i, ops, errors) in results {
                        per_event[i] = Some((ops, errors));
                    }
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    });

    let mut out = Projection::default();
    for (ops, errors) in per_event.into_iter().flatten() {
        out.ops.extend(ops);
        out.errors.extend(errors);
    }
    out
}

/// Mapping state for a single event.
struct Rule<'a> {
    event: &'a Event,
    embeddings: &'a dyn EmbeddingLookup,
    ops: Vec<ProjectedOp>,
    errors: Vec<ProjectionError>,
}

type Props = BTreeMap<String, PropValue>;

fn text(s: &str) -> PropValue {
    PropValue::Text(s.to_string())
}

impl<'a> Rule<'a> {
    fn new(event: &'a Event, embeddings: &'a dyn EmbeddingLookup) -> Self {
        Self {
            event,
            embeddings,
            ops: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn push(&mut self, op: GraphOp) {
        self.ops.push(ProjectedOp {
            seq: self.event.seq,
            entity: self.event.payload.subject().clone(),
            op,
        });
    }

    fn upsert(&mut self, node: NodeKey, props: Props) {
        self.push(GraphOp::UpsertNode { node, props });
    }

    fn set(&mut self, target: NodeRef, key: &str, value: Option<PropValue>, when: Condition) {
        self.push(GraphOp::SetProperty {
            target,
            key: key.to_string(),
            value,
            when,
        });
    }

    fn edge(&mut self, from: NodeRef, rel: &str, to: NodeRef, props: Props) {
        self.push(GraphOp::UpsertEdge {
            from,
            rel: rel.to_string(),
            to,
            props,
        });
    }

    fn invalid(&mut self, field: &'static str, reason: impl Into<String>) {
        self.errors.push(ProjectionError::InvalidField {
            seq: self.event.seq,
            field,
            reason: reason.into(),
        });
    }

    /// Map a date-like field: empty clears, garbage is reported and skipped.
    fn set_date(&mut self, target: NodeRef, field: &'static str, raw: &str, when: Condition) {
        match parse_optional_date(raw) {
            Ok(value) => self.set(target, field, value.map(PropValue::Time), when),
            Err(e) => self.invalid(field, e.to_string()),
        }
    }

    fn run(&mut self) {
        let event = self.event;
        match &event.payload {
            EventPayload::GatheringDiscovered(e) => {
                let mut props = Props::new();
                if let Some(organizer) = &e.organizer {
                    props.insert("organizer".into(), text(organizer));
                }
                let target = self.discovered(Label::Gathering, &e.signal, props);
                self.set_date(target.clone(), "starts_at", &e.starts_at, Condition::Always);
                self.set_date(target, "ends_at", &e.ends_at, Condition::Always);
            }
            EventPayload::AidDiscovered(e) => {
                let props = Props::from([
                    ("availability".to_string(), text(&e.availability)),
                    ("is_ongoing".to_string(), PropValue::Bool(e.is_ongoing)),
                ]);
                self.discovered(Label::Aid, &e.signal, props);
            }
            EventPayload::NeedDiscovered(e) => {
                let props = Props::from([
                    ("what_needed".to_string(), text(&e.what_needed)),
                    ("urgency".to_string(), text(e.urgency.as_str())),
                ]);
                self.discovered(Label::Need, &e.signal, props);
            }
            EventPayload::TensionDiscovered(e) => {
                let props = Props::from([("severity".to_string(), text(e.severity.as_str()))]);
                self.discovered(Label::Tension, &e.signal, props);
            }
            EventPayload::GatheringRescheduled(e) => {
                let target = NodeRef::exact(Label::Gathering, e.id.clone());
                self.set_date(target.clone(), "starts_at", &e.starts_at, Condition::Always);
                self.set_date(target, "ends_at", &e.ends_at, Condition::Always);
            }
            EventPayload::SourceRegistered {
                source_id,
                url,
                weight,
            } => {
                let mut props = Props::from([
                    ("url".to_string(), text(url)),
                    ("weight".to_string(), PropValue::Float(*weight)),
                    ("active".to_string(), PropValue::Bool(true)),
                ]);
                if let Some(domain) = url_host(url) {
                    props.insert("domain".into(), PropValue::Text(domain));
                }
                self.upsert(NodeKey::new(Label::Source, source_id.clone()), props);
            }
            EventPayload::SourceChanged { source_id, change } => {
                let key = NodeKey::new(Label::Source, source_id.clone());
                self.upsert(key.clone(), Props::new());
                let target = NodeRef::Exact(key);
                match change {
                    SourceChange::Weight { new, .. } => {
                        self.set(target, "weight", Some(PropValue::Float(*new)), Condition::Always)
                    }
                    SourceChange::QualityPenalty { new, .. } => self.set(
                        target,
                        "quality_penalty",
                        Some(PropValue::Float(*new)),
                        Condition::Always,
                    ),
                    SourceChange::Active { new, .. } => {
                        self.set(target, "active", Some(PropValue::Bool(*new)), Condition::Always)
                    }
                    SourceChange::Url { new, .. } => {
                        self.set(target.clone(), "url", Some(text(new)), Condition::Always);
                        self.set(
                            target,
                            "domain",
                            url_host(new).map(PropValue::Text),
                            Condition::Always,
                        );
                    }
                }
            }
            EventPayload::SourceScraped {
                source_id,
                signals_produced,
                scraped_at,
            } => {
                let key = NodeKey::new(Label::Source, source_id.clone());
                self.upsert(key.clone(), Props::new());
                let target = NodeRef::Exact(key);
                self.push(GraphOp::Increment {
                    target: target.clone(),
                    key: "signals_produced".into(),
                    delta: *signals_produced,
                });
                self.push(GraphOp::Increment {
                    target: target.clone(),
                    key: "scrape_count".into(),
                    delta: 1,
                });
                self.set_date(target, "last_scraped", scraped_at, Condition::IfGreater);
            }
            EventPayload::SignalCorroborated {
                entity_id,
                source_url,
            } => {
                let signal = NodeRef::any_signal(entity_id.clone());
                self.evidence(signal.clone(), entity_id, source_url);
                self.set(
                    signal,
                    "last_confirmed_active",
                    Some(PropValue::Time(event.appended_at)),
                    Condition::IfGreater,
                );
            }
            EventPayload::ActorIdentified {
                actor_id,
                name,
                entity_id,
                role,
            } => {
                let actor = NodeKey::new(Label::Actor, actor_id.clone());
                self.upsert(actor.clone(), Props::from([("name".to_string(), text(name))]));
                self.edge(
                    NodeRef::Exact(actor),
                    ACTED_IN,
                    NodeRef::any_signal(entity_id.clone()),
                    Props::from([("role".to_string(), text(role))]),
                );
            }
            EventPayload::SignalExpired { entity_id, reason } => {
                let target = NodeRef::any_signal(entity_id.clone());
                self.set(target.clone(), "expired", Some(PropValue::Bool(true)), Condition::Always);
                self.set(target, "expired_reason", Some(text(reason)), Condition::Always);
            }
            EventPayload::CauseHeatComputed { entity_id, heat } => {
                self.set(
                    NodeRef::any_signal(entity_id.clone()),
                    "cause_heat",
                    Some(PropValue::Float(*heat)),
                    Condition::Always,
                );
            }
        }
    }

    /// Shared mapping for the four discovery events. Returns a reference to
    /// the signal node for kind-specific follow-ups.
    fn discovered(&mut self, label: Label, core: &SignalCore, mut props: Props) -> NodeRef {
        let seq = self.event.seq;
        let key = NodeKey::new(label, core.id.clone());
        let target = NodeRef::Exact(key.clone());

        props.insert("title".into(), text(&core.title));
        props.insert("summary".into(), text(&core.summary));
        props.insert("lat".into(), PropValue::Float(core.lat));
        props.insert("lng".into(), PropValue::Float(core.lng));
        if let Some(name) = &core.location_name {
            props.insert("location_name".into(), text(name));
        }
        if let Some(url) = &core.source_url {
            props.insert("source_url".into(), text(url));
        }
        self.upsert(key, props);

        let seen = PropValue::Time(self.event.appended_at);
        self.set(target.clone(), "first_seen", Some(seen.clone()), Condition::IfAbsent);
        self.set(target.clone(), "last_confirmed_active", Some(seen), Condition::IfGreater);

        match self.embeddings.lookup(&signal_text(&core.title, &core.summary)) {
            Ok(Some(vector)) => self.set(
                target.clone(),
                "embedding",
                Some(PropValue::Vector(vector)),
                Condition::Always,
            ),
            Ok(None) | Err(_) => self.errors.push(ProjectionError::EmbeddingUnavailable {
                seq,
                entity: core.id.clone(),
            }),
        }

        if let Some(url) = &core.source_url {
            self.evidence(target.clone(), &core.id, url);
        }
        if let Some(source_id) = &core.source_id {
            let source = NodeKey::new(Label::Source, source_id.clone());
            self.upsert(source.clone(), Props::new());
            self.edge(target.clone(), DISCOVERED_VIA, NodeRef::Exact(source), Props::new());
        }
        target
    }

    /// One evidence node per (signal, url) and a SOURCED_FROM edge to it.
    fn evidence(&mut self, signal: NodeRef, entity: &EntityId, url: &str) {
        let Some(domain) = url_host(url) else {
            self.invalid("source_url", format!("no host in {url:?}"));
            return;
        };
        let evidence = NodeKey::new(Label::Evidence, format!("{entity}@{url}"));
        self.upsert(
            evidence.clone(),
            Props::from([
                ("url".to_string(), text(url)),
                ("domain".to_string(), PropValue::Text(domain)),
            ]),
        );
        self.edge(signal, SOURCED_FROM, NodeRef::Exact(evidence), Props::new());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{aid, corroborated, gathering};
    use chrono::{TimeZone, Utc};
    use signalfold::{EmbeddingCache, GatheringDiscovered, GatheringRescheduled, GraphSnapshot};

    fn ev(seq: Seq, payload: EventPayload) -> Event {
        Event {
            seq,
            run_id: "run-1".into(),
            appended_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, seq as u32 % 60).unwrap(),
            payload,
        }
    }

    fn cache_with(texts: &[&str]) -> EmbeddingCache {
        let cache = EmbeddingCache::open_in_memory("test").unwrap();
        for (i, t) in texts.iter().enumerate() {
            cache.insert(t, vec![1.0, i as f32]).unwrap();
        }
        cache
    }

    fn sample_events() -> Vec<Event> {
        vec![
            ev(1, gathering("E1", "Cleanup", 10.0, 20.0)),
            ev(2, aid("A1", "Food shelf", 10.1, 20.1)),
            ev(3, corroborated("E1", "https://news.example.org/a")),
            ev(
                4,
                EventPayload::SourceScraped {
                    source_id: EntityId::from("S1"),
                    signals_produced: 4,
                    scraped_at: "2025-06-01T00:00:00Z".into(),
                },
            ),
            ev(5, corroborated("A1", "https://blog.example.com/b")),
            ev(
                6,
                EventPayload::SignalExpired {
                    entity_id: EntityId::from("E1"),
                    reason: "past".into(),
                },
            ),
        ]
    }

    #[test]
    fn projection_is_deterministic() {
        let cache = cache_with(&["Cleanup", "Food shelf"]);
        let events = sample_events();
        let a = serde_json::to_vec(&project(&events, &cache)).unwrap();
        let b = serde_json::to_vec(&project(&events, &cache)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sharded_projection_matches_sequential() {
        let cache = cache_with(&["Cleanup", "Food shelf"]);
        let events = sample_events();
        let sequential = project(&events, &cache);
        for shards in [2, 3, 8] {
            assert_eq!(project_sharded(&events, &cache, shards), sequential);
        }
    }

    #[test]
    fn discovery_maps_core_fields_and_stamps() {
        let cache = cache_with(&["Cleanup"]);
        let projection = project(&[ev(1, gathering("E1", "Cleanup", 10.0, 20.0))], &cache);
        assert!(projection.errors.is_empty(), "{:?}", projection.errors);
        assert!(projection.ops.iter().all(|op| op.seq == 1 && op.entity.as_str() == "E1"));

        let mut g = GraphSnapshot::default();
        assert!(g.apply_all(&projection.ops).iter().all(Result::is_ok));
        let e1 = g.node(&NodeKey::new(Label::Gathering, "E1")).unwrap();
        assert_eq!(e1.text("title"), Some("Cleanup"));
        assert_eq!(e1.float("lat"), Some(10.0));
        assert_eq!(e1.prop("embedding"), Some(&PropValue::Vector(vec![1.0, 0.0])));
        assert!(e1.prop("first_seen").is_some());
        // Empty date fields become explicit clears.
        assert_eq!(e1.prop("starts_at"), None);
        assert_eq!(e1.props["starts_at"].stamp, 1);
    }

    #[test]
    fn missing_embedding_is_reported_but_rest_is_projected() {
        let cache = cache_with(&[]);
        let projection = project(&[ev(7, gathering("E1", "Cleanup", 10.0, 20.0))], &cache);
        assert_eq!(
            projection.errors,
            vec![ProjectionError::EmbeddingUnavailable {
                seq: 7,
                entity: EntityId::from("E1")
            }]
        );
        assert!(projection.errors[0].is_retryable());
        assert!(projection
            .ops
            .iter()
            .any(|op| matches!(&op.op, GraphOp::UpsertNode { .. })));
    }

    #[test]
    fn unknown_kind_uses_multi_label_reference() {
        let projection = project(&[ev(3, corroborated("X9", "https://a.org/x"))], &cache_with(&[]));
        let edge = projection
            .ops
            .iter()
            .find_map(|op| match &op.op {
                GraphOp::UpsertEdge { from, rel, .. } => Some((from.clone(), rel.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(edge.0, NodeRef::any_signal("X9"));
        assert_eq!(edge.1, SOURCED_FROM);
    }

    #[test]
    fn scrape_counts_are_relative_increments() {
        let projection = project(&sample_events()[3..4], &cache_with(&[]));
        let increments: Vec<(String, i64)> = projection
            .ops
            .iter()
            .filter_map(|op| match &op.op {
                GraphOp::Increment { key, delta, .. } => Some((key.clone(), *delta)),
                _ => None,
            })
            .collect();
        assert_eq!(
            increments,
            vec![("signals_produced".to_string(), 4), ("scrape_count".to_string(), 1)]
        );
    }

    #[test]
    fn reschedule_with_empty_end_clears_it() {
        let cache = cache_with(&["Cleanup"]);
        let mut g = GraphSnapshot::default();
        let mut first = GatheringDiscovered::new(EntityId::from("E1"), "Cleanup", 1.0, 2.0);
        first.starts_at = "2025-07-01T10:00:00Z".into();
        first.ends_at = "2025-07-01T12:00:00Z".into();
        let events = vec![
            ev(1, EventPayload::GatheringDiscovered(first)),
            ev(
                2,
                EventPayload::GatheringRescheduled(GatheringRescheduled {
                    id: EntityId::from("E1"),
                    starts_at: "2025-07-02T10:00:00Z".into(),
                    ends_at: String::new(),
                }),
            ),
        ];
        g.apply_all(&project(&events, &cache).ops);
        let e1 = g.node(&NodeKey::new(Label::Gathering, "E1")).unwrap();
        assert_eq!(
            e1.prop("starts_at").and_then(PropValue::as_time),
            Some(Utc.with_ymd_and_hms(2025, 7, 2, 10, 0, 0).unwrap())
        );
        assert_eq!(e1.prop("ends_at"), None);
    }

    #[test]
    fn source_change_sets_new_value() {
        let events = vec![ev(
            1,
            EventPayload::SourceChanged {
                source_id: EntityId::from("S1"),
                change: SourceChange::Weight { old: 1.0, new: 0.5 },
            },
        )];
        let mut g = GraphSnapshot::default();
        g.apply_all(&project(&events, &cache_with(&[])).ops);
        let s1 = g.node(&NodeKey::new(Label::Source, "S1")).unwrap();
        assert_eq!(s1.float("weight"), Some(0.5));
    }
}
