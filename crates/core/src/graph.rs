//! Property graph model and the closed operation vocabulary that writes it.
//!
//! Every property is a stamped [`Register`] and every numeric aggregate a
//! [`Counter`] that remembers which events already contributed. The state
//! after applying a set of [`ProjectedOp`]s is therefore a function of the
//! set alone: order, repetition, and retries do not change it. Replay relies
//! on this to rebuild a byte-identical graph.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EntityId, Label, Seq};

// ---------------------------------------------------------------------------
// Values and addressing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum PropValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Vector(Vec<f32>),
}

impl PropValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of `Float` and `Int` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Float(f) => Some(*f),
            PropValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            PropValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            PropValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Ordering between values of the same comparable kind.
    fn compare(&self, other: &PropValue) -> Option<Ordering> {
        match (self, other) {
            (PropValue::Int(a), PropValue::Int(b)) => Some(a.cmp(b)),
            (PropValue::Float(a), PropValue::Float(b)) => a.partial_cmp(b),
            (PropValue::Time(a), PropValue::Time(b)) => Some(a.cmp(b)),
            (PropValue::Text(a), PropValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub label: Label,
    pub id: EntityId,
}

impl NodeKey {
    pub fn new(label: Label, id: impl Into<EntityId>) -> Self {
        Self {
            label,
            id: id.into(),
        }
    }

    /// `"Label:id"`. Ids never contain control characters, so the key also
    /// sorts nodes by label.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.label, self.id)
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.label, self.id)
    }
}

/// How an operation names the node it touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeRef {
    Exact(NodeKey),
    /// The first existing node with `id` under one of `labels`, tried in
    /// order. Used when an event names an entity without its kind.
    AnyOf { labels: Vec<Label>, id: EntityId },
}

impl NodeRef {
    pub fn exact(label: Label, id: impl Into<EntityId>) -> Self {
        NodeRef::Exact(NodeKey::new(label, id))
    }

    pub fn any_signal(id: impl Into<EntityId>) -> Self {
        NodeRef::AnyOf {
            labels: Label::SIGNALS.to_vec(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Exact(key) => write!(f, "{key}"),
            NodeRef::AnyOf { labels, id } => {
                let labels: Vec<&str> = labels.iter().map(|l| l.as_str()).collect();
                write!(f, "{}:{id}", labels.join("|"))
            }
        }
    }
}

/// Write rule for [`GraphOp::SetProperty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// Highest seq wins.
    Always,
    /// Lowest seq wins.
    IfAbsent,
    /// Largest value wins, ties go to the higher seq. `None` is ignored.
    IfGreater,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum GraphOp {
    /// Create the node if absent and write `props` under the `Always` rule.
    UpsertNode {
        node: NodeKey,
        props: BTreeMap<String, PropValue>,
    },
    /// `value: None` clears the property.
    SetProperty {
        target: NodeRef,
        key: String,
        value: Option<PropValue>,
        when: Condition,
    },
    /// Both endpoints must already exist.
    UpsertEdge {
        from: NodeRef,
        rel: String,
        to: NodeRef,
        props: BTreeMap<String, PropValue>,
    },
    Increment {
        target: NodeRef,
        key: String,
        delta: i64,
    },
}

impl GraphOp {
    pub fn kind(&self) -> &'static str {
        match self {
            GraphOp::UpsertNode { .. } => "upsert_node",
            GraphOp::SetProperty { .. } => "set_property",
            GraphOp::UpsertEdge { .. } => "upsert_edge",
            GraphOp::Increment { .. } => "increment",
        }
    }
}

/// A graph operation stamped with its originating event and batching key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedOp {
    pub seq: Seq,
    pub entity: EntityId,
    pub op: GraphOp,
}

// ---------------------------------------------------------------------------
// Stored state
// ---------------------------------------------------------------------------

/// A property value plus the seq of the event that decided it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub value: Option<PropValue>,
    pub stamp: Seq,
}

impl Register {
    /// Apply a write; returns whether the register changed.
    fn write(
        slot: &mut Option<Register>,
        value: Option<PropValue>,
        seq: Seq,
        when: Condition,
    ) -> bool {
        let replace = match (when, slot.as_ref()) {
            (Condition::IfGreater, _) if value.is_none() => false,
            (_, None) => true,
            (Condition::Always, Some(cur)) => seq >= cur.stamp,
            (Condition::IfAbsent, Some(cur)) => seq < cur.stamp,
            (Condition::IfGreater, Some(cur)) => match (&value, &cur.value) {
                (_, None) => true,
                (Some(new), Some(old)) => match new.compare(old) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => seq > cur.stamp,
                    _ => false,
                },
                (None, Some(_)) => false,
            },
        };
        if !replace {
            return false;
        }
        let next = Register { value, stamp: seq };
        let changed = slot.as_ref() != Some(&next);
        *slot = Some(next);
        changed
    }
}

/// A relative counter that applies each stamp at most once.
///
/// Stamps at or below `settled` are folded into `total` and forgotten; only
/// the stamps above it are remembered individually.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub total: i64,
    #[serde(default)]
    pub settled: Seq,
    pub applied: BTreeSet<Seq>,
}

impl Counter {
    /// Add `delta` for `seq` unless that stamp already counted, then fold
    /// stamps up to `floor`.
    fn add(&mut self, seq: Seq, delta: i64, floor: Seq) -> bool {
        if seq <= self.settled || !self.applied.insert(seq) {
            return false;
        }
        self.total = self.total.saturating_add(delta);
        self.compact(floor);
        true
    }

    /// Forget individual stamps at or below `floor`. The caller guarantees
    /// that no unapplied operation at or below `floor` will ever arrive.
    pub fn compact(&mut self, floor: Seq) -> bool {
        if floor <= self.settled {
            return false;
        }
        self.applied.retain(|&stamp| stamp > floor);
        self.settled = floor;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: NodeKey,
    /// Lowest seq of any upsert of this node.
    pub created: Seq,
    pub props: BTreeMap<String, Register>,
    pub counters: BTreeMap<String, Counter>,
}

impl Node {
    fn new(key: NodeKey, created: Seq) -> Self {
        Self {
            key,
            created,
            props: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Current value of a property; cleared properties read as `None`.
    pub fn prop(&self, key: &str) -> Option<&PropValue> {
        self.props.get(key).and_then(|r| r.value.as_ref())
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.prop(key).and_then(PropValue::as_text)
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        self.prop(key).and_then(PropValue::as_f64)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.prop(key).and_then(PropValue::as_bool).unwrap_or(false)
    }

    pub fn counter(&self, key: &str) -> i64 {
        self.counters.get(key).map(|c| c.total).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub from: NodeKey,
    pub rel: String,
    pub to: NodeKey,
}

impl EdgeKey {
    pub fn storage_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.from.storage_key(),
            self.rel,
            self.to.storage_key()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub key: EdgeKey,
    pub created: Seq,
    pub props: BTreeMap<String, Register>,
}

impl Edge {
    pub fn prop(&self, key: &str) -> Option<&PropValue> {
        self.props.get(key).and_then(|r| r.value.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time, read-only copy of the materialized graph.
///
/// Maps are keyed by storage key, so two snapshots holding equal state
/// serialize to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, Node>,
    pub edges: BTreeMap<String, Edge>,
}

impl GraphSnapshot {
    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.get(&key.storage_key())
    }

    pub fn resolve(&self, target: &NodeRef) -> Option<&Node> {
        match target {
            NodeRef::Exact(key) => self.node(key),
            NodeRef::AnyOf { labels, id } => labels
                .iter()
                .find_map(|label| self.node(&NodeKey::new(*label, id.clone()))),
        }
    }

    pub fn nodes_with_label(&self, label: Label) -> impl Iterator<Item = &Node> + '_ {
        let prefix = format!("{label}:");
        self.nodes
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, n)| n)
    }

    /// Outgoing edges of `from` with relationship `rel`.
    pub fn edges_from<'a>(
        &'a self,
        from: &NodeKey,
        rel: &str,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        let prefix = format!("{}\u{1f}{}\u{1f}", from.storage_key(), rel);
        self.edges
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e)
    }

    pub fn edge(&self, key: &EdgeKey) -> Option<&Edge> {
        self.edges.get(&key.storage_key())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Canonical JSON encoding. Equal graphs give equal bytes.
    pub fn to_canonical_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

// ---------------------------------------------------------------------------
// Applying operations
// ---------------------------------------------------------------------------

/// Why one operation did not take effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail")]
pub enum ApplyError {
    /// A referenced node does not exist yet. Retried once it might.
    #[error("unresolved reference: {0}")]
    Unresolved(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("timed out after {ms}ms")]
    TimedOut { ms: u64 },
    #[error("invalid operation: {0}")]
    Invalid(String),
}

impl ApplyError {
    /// Errors that may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApplyError::Invalid(_))
    }
}

/// Minimal read/write surface a store exposes to [`apply_op`].
pub(crate) trait GraphTxn {
    fn get_node(&mut self, key: &str) -> Result<Option<Node>, ApplyError>;
    fn put_node(&mut self, node: Node) -> Result<(), ApplyError>;
    fn get_edge(&mut self, key: &str) -> Result<Option<Edge>, ApplyError>;
    fn put_edge(&mut self, edge: Edge) -> Result<(), ApplyError>;
}

impl GraphTxn for GraphSnapshot {
    fn get_node(&mut self, key: &str) -> Result<Option<Node>, ApplyError> {
        Ok(self.nodes.get(key).cloned())
    }

    fn put_node(&mut self, node: Node) -> Result<(), ApplyError> {
        self.nodes.insert(node.key.storage_key(), node);
        Ok(())
    }

    fn get_edge(&mut self, key: &str) -> Result<Option<Edge>, ApplyError> {
        Ok(self.edges.get(key).cloned())
    }

    fn put_edge(&mut self, edge: Edge) -> Result<(), ApplyError> {
        self.edges.insert(edge.key.storage_key(), edge);
        Ok(())
    }
}

fn resolve_in<T: GraphTxn + ?Sized>(txn: &mut T, target: &NodeRef) -> Result<Node, ApplyError> {
    match target {
        NodeRef::Exact(key) => txn
            .get_node(&key.storage_key())?
            .ok_or_else(|| ApplyError::Unresolved(key.to_string())),
        NodeRef::AnyOf { labels, id } => {
            for label in labels {
                let key = NodeKey::new(*label, id.clone());
                if let Some(node) = txn.get_node(&key.storage_key())? {
                    return Ok(node);
                }
            }
            Err(ApplyError::Unresolved(target.to_string()))
        }
    }
}

/// Apply one operation. A failing operation writes nothing. Counters it
/// touches are compacted up to `floor`.
pub(crate) fn apply_op<T: GraphTxn + ?Sized>(
    txn: &mut T,
    op: &ProjectedOp,
    floor: Seq,
) -> Result<(), ApplyError> {
    let seq = op.seq;
    match &op.op {
        GraphOp::UpsertNode { node, props } => {
            let mut stored = match txn.get_node(&node.storage_key())? {
                Some(mut existing) => {
                    existing.created = existing.created.min(seq);
                    existing
                }
                None => Node::new(node.clone(), seq),
            };
            for (key, value) in props {
                let mut slot = stored.props.remove(key);
                Register::write(&mut slot, Some(value.clone()), seq, Condition::Always);
                if let Some(reg) = slot {
                    stored.props.insert(key.clone(), reg);
                }
            }
            txn.put_node(stored)
        }
        GraphOp::SetProperty {
            target,
            key,
            value,
            when,
        } => {
            let mut node = resolve_in(txn, target)?;
            let mut slot = node.props.remove(key);
            let changed = Register::write(&mut slot, value.clone(), seq, *when);
            if let Some(reg) = slot {
                node.props.insert(key.clone(), reg);
            }
            if changed {
                txn.put_node(node)?;
            }
            Ok(())
        }
        GraphOp::UpsertEdge {
            from,
            rel,
            to,
            props,
        } => {
            if rel.is_empty() || rel.chars().any(char::is_control) {
                return Err(ApplyError::Invalid(format!("bad relationship name {rel:?}")));
            }
            let from = resolve_in(txn, from)?.key;
            let to = resolve_in(txn, to)?.key;
            let key = EdgeKey {
                from,
                rel: rel.clone(),
                to,
            };
            let mut edge = match txn.get_edge(&key.storage_key())? {
                Some(mut existing) => {
                    existing.created = existing.created.min(seq);
                    existing
                }
                None => Edge {
                    key,
                    created: seq,
                    props: BTreeMap::new(),
                },
            };
            for (k, value) in props {
                let mut slot = edge.props.remove(k);
                Register::write(&mut slot, Some(value.clone()), seq, Condition::Always);
                if let Some(reg) = slot {
                    edge.props.insert(k.clone(), reg);
                }
            }
            txn.put_edge(edge)
        }
        GraphOp::Increment { target, key, delta } => {
            let mut node = resolve_in(txn, target)?;
            if node
                .counters
                .entry(key.clone())
                .or_default()
                .add(seq, *delta, floor)
            {
                txn.put_node(node)?;
            }
            Ok(())
        }
    }
}

impl GraphSnapshot {
    /// Apply operations in order to this in-memory graph, returning one
    /// outcome per operation.
    pub fn apply_all(&mut self, ops: &[ProjectedOp]) -> Vec<Result<(), ApplyError>> {
        self.apply_settled(ops, 0)
    }

    /// Like [`GraphSnapshot::apply_all`], folding counter stamps at or
    /// below `floor`.
    pub(crate) fn apply_settled(
        &mut self,
        ops: &[ProjectedOp],
        floor: Seq,
    ) -> Vec<Result<(), ApplyError>> {
        ops.iter().map(|op| apply_op(self, op, floor)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seq: Seq, entity: &str, op: GraphOp) -> ProjectedOp {
        ProjectedOp {
            seq,
            entity: EntityId::from(entity),
            op,
        }
    }

    fn upsert(seq: Seq, label: Label, id: &str, props: &[(&str, PropValue)]) -> ProjectedOp {
        at(
            seq,
            id,
            GraphOp::UpsertNode {
                node: NodeKey::new(label, id),
                props: props
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            },
        )
    }

    fn set(
        seq: Seq,
        id: &str,
        key: &str,
        value: Option<PropValue>,
        when: Condition,
    ) -> ProjectedOp {
        at(
            seq,
            id,
            GraphOp::SetProperty {
                target: NodeRef::any_signal(id),
                key: key.into(),
                value,
                when,
            },
        )
    }

    fn text(s: &str) -> PropValue {
        PropValue::Text(s.into())
    }

    fn sample_ops() -> Vec<ProjectedOp> {
        vec![
            upsert(1, Label::Gathering, "E1", &[("title", text("Cleanup"))]),
            upsert(2, Label::Source, "S1", &[]),
            set(3, "E1", "title", Some(text("Beach cleanup")), Condition::Always),
            set(1, "E1", "first_seen", Some(PropValue::Int(100)), Condition::IfAbsent),
            set(4, "E1", "first_seen", Some(PropValue::Int(400)), Condition::IfAbsent),
            set(4, "E1", "last_active", Some(PropValue::Int(40)), Condition::IfGreater),
            set(5, "E1", "last_active", Some(PropValue::Int(20)), Condition::IfGreater),
            at(
                6,
                "S1",
                GraphOp::Increment {
                    target: NodeRef::exact(Label::Source, "S1"),
                    key: "signals_produced".into(),
                    delta: 3,
                },
            ),
            at(
                7,
                "S1",
                GraphOp::Increment {
                    target: NodeRef::exact(Label::Source, "S1"),
                    key: "signals_produced".into(),
                    delta: 2,
                },
            ),
            at(
                8,
                "E1",
                GraphOp::UpsertEdge {
                    from: NodeRef::any_signal("E1"),
                    rel: "DISCOVERED_VIA".into(),
                    to: NodeRef::exact(Label::Source, "S1"),
                    props: BTreeMap::new(),
                },
            ),
        ]
    }

    #[test]
    fn applies_expected_state() {
        let mut g = GraphSnapshot::default();
        let outcomes = g.apply_all(&sample_ops());
        assert!(outcomes.iter().all(Result::is_ok), "{outcomes:?}");

        let e1 = g.node(&NodeKey::new(Label::Gathering, "E1")).unwrap();
        assert_eq!(e1.text("title"), Some("Beach cleanup"));
        assert_eq!(e1.prop("first_seen"), Some(&PropValue::Int(100)));
        assert_eq!(e1.prop("last_active"), Some(&PropValue::Int(40)));
        assert_eq!(e1.created, 1);

        let s1 = g.node(&NodeKey::new(Label::Source, "S1")).unwrap();
        assert_eq!(s1.counter("signals_produced"), 5);
        assert_eq!(
            g.edges_from(&e1.key, "DISCOVERED_VIA").count(),
            1
        );
    }

    #[test]
    fn applying_twice_is_identical_to_once() {
        let ops = sample_ops();
        let mut once = GraphSnapshot::default();
        once.apply_all(&ops);

        let mut twice = GraphSnapshot::default();
        twice.apply_all(&ops);
        twice.apply_all(&ops);

        assert_eq!(
            once.to_canonical_json().unwrap(),
            twice.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn counter_stamps_fold_below_the_floor() {
        let bump = |seq: Seq| {
            at(
                seq,
                "S1",
                GraphOp::Increment {
                    target: NodeRef::exact(Label::Source, "S1"),
                    key: "signals_produced".into(),
                    delta: 1,
                },
            )
        };
        let mut g = GraphSnapshot::default();
        g.apply_all(&[upsert(1, Label::Source, "S1", &[])]);

        // Floor trails each batch, the way a checkpoint does.
        for batch in 0..50 {
            let ops: Vec<ProjectedOp> = (0..20).map(|i| bump(2 + batch * 20 + i)).collect();
            let floor = batch * 20;
            let outcomes = g.apply_settled(&ops, floor);
            assert!(outcomes.iter().all(Result::is_ok));
        }

        let key = NodeKey::new(Label::Source, "S1");
        let s1 = g.node(&key).unwrap();
        assert_eq!(s1.counter("signals_produced"), 1000);
        let counter = &s1.counters["signals_produced"];
        assert_eq!(counter.settled, 980);
        assert!(counter.applied.len() <= 21, "{}", counter.applied.len());

        // Redelivering an old stamp or a recent one counts nothing.
        let before = g.clone();
        g.apply_settled(&[bump(17), bump(1001)], 980);
        assert_eq!(g, before);
    }

    #[test]
    fn counter_total_survives_compaction() {
        let mut counter = Counter::default();
        for seq in 1..=10 {
            assert!(counter.add(seq, 2, 0));
        }
        assert!(counter.compact(7));
        assert!(!counter.compact(5));
        assert_eq!(counter.total, 20);
        assert_eq!(counter.applied, [8, 9, 10].into_iter().collect());
        assert!(!counter.add(3, 2, 7));
        assert!(!counter.add(9, 2, 7));
        assert!(counter.add(11, 2, 7));
        assert_eq!(counter.total, 22);
    }

    #[test]
    fn order_does_not_matter_once_references_resolve() {
        let ops = sample_ops();
        let mut forward = GraphSnapshot::default();
        forward.apply_all(&ops);

        // Reverse order leaves references unresolved at first; retrying the
        // failures until nothing changes reaches the same state.
        let mut reversed = GraphSnapshot::default();
        let mut pending: Vec<ProjectedOp> = ops.iter().rev().cloned().collect();
        while !pending.is_empty() {
            let outcomes = reversed.apply_all(&pending);
            let next: Vec<ProjectedOp> = pending
                .iter()
                .zip(outcomes)
                .filter(|(_, r)| r.is_err())
                .map(|(op, _)| op.clone())
                .collect();
            assert!(next.len() < pending.len());
            pending = next;
        }

        assert_eq!(
            forward.to_canonical_json().unwrap(),
            reversed.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn unresolved_reference_writes_nothing() {
        let mut g = GraphSnapshot::default();
        g.apply_all(&[upsert(1, Label::Gathering, "E1", &[])]);
        let before = g.clone();

        let outcome = g.apply_all(&[at(
            2,
            "E1",
            GraphOp::UpsertEdge {
                from: NodeRef::any_signal("E1"),
                rel: "SOURCED_FROM".into(),
                to: NodeRef::exact(Label::Evidence, "missing"),
                props: BTreeMap::new(),
            },
        )]);
        assert!(matches!(outcome[0], Err(ApplyError::Unresolved(_))));
        assert_eq!(g, before);
    }

    #[test]
    fn any_of_resolves_first_existing_label() {
        let mut g = GraphSnapshot::default();
        g.apply_all(&[
            upsert(1, Label::Need, "X", &[]),
            set(2, "X", "expired", Some(PropValue::Bool(true)), Condition::Always),
        ]);
        assert!(g.node(&NodeKey::new(Label::Need, "X")).unwrap().flag("expired"));
        assert!(g.resolve(&NodeRef::any_signal("X")).is_some());
        assert!(g.resolve(&NodeRef::any_signal("Y")).is_none());
    }

    #[test]
    fn explicit_clear_and_stale_writes() {
        let mut g = GraphSnapshot::default();
        g.apply_all(&[
            upsert(1, Label::Gathering, "E1", &[]),
            set(5, "E1", "starts_at", None, Condition::Always),
            // Older write arriving late loses.
            set(3, "E1", "starts_at", Some(text("2025-01-01")), Condition::Always),
        ]);
        let e1 = g.node(&NodeKey::new(Label::Gathering, "E1")).unwrap();
        assert_eq!(e1.prop("starts_at"), None);
        assert_eq!(e1.props["starts_at"].stamp, 5);
    }

    #[test]
    fn if_greater_ties_go_to_higher_seq_and_none_is_ignored() {
        let mut g = GraphSnapshot::default();
        g.apply_all(&[
            upsert(1, Label::Gathering, "E1", &[]),
            set(7, "E1", "seen", Some(PropValue::Int(10)), Condition::IfGreater),
            set(4, "E1", "seen", Some(PropValue::Int(10)), Condition::IfGreater),
            set(9, "E1", "seen", None, Condition::IfGreater),
        ]);
        let reg = &g.node(&NodeKey::new(Label::Gathering, "E1")).unwrap().props["seen"];
        assert_eq!(reg.value, Some(PropValue::Int(10)));
        assert_eq!(reg.stamp, 7);
    }

    #[test]
    fn label_scan_and_edge_prefix_do_not_bleed() {
        let mut g = GraphSnapshot::default();
        g.apply_all(&[
            upsert(1, Label::Aid, "A1", &[]),
            upsert(2, Label::Actor, "P1", &[]),
            upsert(3, Label::Aid, "A2", &[]),
        ]);
        let aids: Vec<&str> = g
            .nodes_with_label(Label::Aid)
            .map(|n| n.key.id.as_str())
            .collect();
        assert_eq!(aids, vec!["A1", "A2"]);
    }

    #[test]
    fn snapshot_json_round_trips() {
        let mut g = GraphSnapshot::default();
        g.apply_all(&sample_ops());
        let bytes = g.to_canonical_json().unwrap();
        let back: GraphSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, g);
    }
}
