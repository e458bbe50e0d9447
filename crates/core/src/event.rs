//! Typed observations ("facts") and their structural validation.
//!
//! Payloads hold only what a producer observed. They never carry derived
//! aggregates (diversity, corroboration counts) and never name graph
//! properties; mapping to the graph is the projector's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of an event in the fact log. The first appended event is `1`;
/// `0` means "nothing processed yet".
pub type Seq = u64;

// ---------------------------------------------------------------------------
// Identifiers and labels
// ---------------------------------------------------------------------------

/// Stable identifier assigned to an entity at first observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}
impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId(s)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node label in the materialized graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Label {
    Gathering,
    Aid,
    Need,
    Tension,
    Source,
    Evidence,
    Actor,
}

impl Label {
    /// Labels a signal entity can carry. Events that reference a signal by id
    /// alone resolve against these, in this order.
    pub const SIGNALS: [Label; 4] = [Label::Gathering, Label::Aid, Label::Need, Label::Tension];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Gathering => "Gathering",
            Label::Aid => "Aid",
            Label::Need => "Need",
            Label::Tension => "Tension",
            Label::Source => "Source",
            Label::Evidence => "Evidence",
            Label::Actor => "Actor",
        }
    }

    pub fn parse(s: &str) -> Option<Label> {
        match s {
            "Gathering" => Some(Label::Gathering),
            "Aid" => Some(Label::Aid),
            "Need" => Some(Label::Need),
            "Tension" => Some(Label::Tension),
            "Source" => Some(Label::Source),
            "Evidence" => Some(Label::Evidence),
            "Actor" => Some(Label::Actor),
            _ => None,
        }
    }

    pub fn is_signal(self) -> bool {
        Self::SIGNALS.contains(&self)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordinal used for both need urgency and tension severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
    Critical,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
            Level::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Fields shared by every signal discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalCore {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    /// Page the signal was extracted from. Counts as the first piece of evidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<EntityId>,
}

impl SignalCore {
    pub fn new(id: EntityId, title: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id,
            title: title.into(),
            summary: String::new(),
            lat,
            lng,
            location_name: None,
            source_url: None,
            source_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatheringDiscovered {
    #[serde(flatten)]
    pub signal: SignalCore,
    /// RFC 3339, or empty when unknown.
    #[serde(default)]
    pub starts_at: String,
    #[serde(default)]
    pub ends_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
}

impl GatheringDiscovered {
    pub fn new(id: EntityId, title: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            signal: SignalCore::new(id, title, lat, lng),
            starts_at: String::new(),
            ends_at: String::new(),
            organizer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AidDiscovered {
    #[serde(flatten)]
    pub signal: SignalCore,
    #[serde(default)]
    pub availability: String,
    #[serde(default)]
    pub is_ongoing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedDiscovered {
    #[serde(flatten)]
    pub signal: SignalCore,
    #[serde(default)]
    pub what_needed: String,
    pub urgency: Level,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensionDiscovered {
    #[serde(flatten)]
    pub signal: SignalCore,
    pub severity: Level,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatheringRescheduled {
    pub id: EntityId,
    /// Empty clears the stored value.
    #[serde(default)]
    pub starts_at: String,
    #[serde(default)]
    pub ends_at: String,
}

/// An observed change to a source's curation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SourceChange {
    Weight { old: f64, new: f64 },
    Url { old: String, new: String },
    Active { old: bool, new: bool },
    QualityPenalty { old: f64, new: f64 },
}

fn default_weight() -> f64 {
    1.0
}

/// Every fact the log accepts. The serde tag is the event's type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    GatheringDiscovered(GatheringDiscovered),
    AidDiscovered(AidDiscovered),
    NeedDiscovered(NeedDiscovered),
    TensionDiscovered(TensionDiscovered),
    GatheringRescheduled(GatheringRescheduled),
    SourceRegistered {
        source_id: EntityId,
        url: String,
        #[serde(default = "default_weight")]
        weight: f64,
    },
    SourceChanged {
        source_id: EntityId,
        change: SourceChange,
    },
    SourceScraped {
        source_id: EntityId,
        /// Signals produced by this scrape alone, not a running total.
        signals_produced: i64,
        scraped_at: String,
    },
    SignalCorroborated {
        entity_id: EntityId,
        source_url: String,
    },
    ActorIdentified {
        actor_id: EntityId,
        name: String,
        entity_id: EntityId,
        #[serde(default)]
        role: String,
    },
    SignalExpired {
        entity_id: EntityId,
        #[serde(default)]
        reason: String,
    },
    CauseHeatComputed {
        entity_id: EntityId,
        heat: f64,
    },
}

impl EventPayload {
    /// Parse a producer-supplied JSON payload and check its structure.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ValidationError> {
        let payload: EventPayload = serde_json::from_value(value)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            EventPayload::GatheringDiscovered(_) => "GatheringDiscovered",
            EventPayload::AidDiscovered(_) => "AidDiscovered",
            EventPayload::NeedDiscovered(_) => "NeedDiscovered",
            EventPayload::TensionDiscovered(_) => "TensionDiscovered",
            EventPayload::GatheringRescheduled(_) => "GatheringRescheduled",
            EventPayload::SourceRegistered { .. } => "SourceRegistered",
            EventPayload::SourceChanged { .. } => "SourceChanged",
            EventPayload::SourceScraped { .. } => "SourceScraped",
            EventPayload::SignalCorroborated { .. } => "SignalCorroborated",
            EventPayload::ActorIdentified { .. } => "ActorIdentified",
            EventPayload::SignalExpired { .. } => "SignalExpired",
            EventPayload::CauseHeatComputed { .. } => "CauseHeatComputed",
        }
    }

    /// The entity this event is about. Graph operations derived from the
    /// event are batched and ordered under this id.
    pub fn subject(&self) -> &EntityId {
        match self {
            EventPayload::GatheringDiscovered(e) => &e.signal.id,
            EventPayload::AidDiscovered(e) => &e.signal.id,
            EventPayload::NeedDiscovered(e) => &e.signal.id,
            EventPayload::TensionDiscovered(e) => &e.signal.id,
            EventPayload::GatheringRescheduled(e) => &e.id,
            EventPayload::SourceRegistered { source_id, .. }
            | EventPayload::SourceChanged { source_id, .. }
            | EventPayload::SourceScraped { source_id, .. } => source_id,
            EventPayload::SignalCorroborated { entity_id, .. }
            | EventPayload::ActorIdentified { entity_id, .. }
            | EventPayload::SignalExpired { entity_id, .. }
            | EventPayload::CauseHeatComputed { entity_id, .. } => entity_id,
        }
    }

    /// Label and shared fields for discovery events.
    pub fn signal(&self) -> Option<(Label, &SignalCore)> {
        match self {
            EventPayload::GatheringDiscovered(e) => Some((Label::Gathering, &e.signal)),
            EventPayload::AidDiscovered(e) => Some((Label::Aid, &e.signal)),
            EventPayload::NeedDiscovered(e) => Some((Label::Need, &e.signal)),
            EventPayload::TensionDiscovered(e) => Some((Label::Tension, &e.signal)),
            _ => None,
        }
    }

    /// Check required fields and field formats. Never inspects business state.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let t = self.type_tag();
        if let Some((_, signal)) = self.signal() {
            check_signal(t, signal)?;
        }
        match self {
            EventPayload::GatheringDiscovered(e) => {
                check_date(t, "starts_at", &e.starts_at)?;
                check_date(t, "ends_at", &e.ends_at)?;
            }
            EventPayload::AidDiscovered(_)
            | EventPayload::NeedDiscovered(_)
            | EventPayload::TensionDiscovered(_) => {}
            EventPayload::GatheringRescheduled(e) => {
                check_id(t, "id", &e.id)?;
                check_date(t, "starts_at", &e.starts_at)?;
                check_date(t, "ends_at", &e.ends_at)?;
            }
            EventPayload::SourceRegistered {
                source_id,
                url,
                weight,
            } => {
                check_id(t, "source_id", source_id)?;
                check_url(t, "url", url)?;
                check_finite(t, "weight", *weight)?;
            }
            EventPayload::SourceChanged { source_id, change } => {
                check_id(t, "source_id", source_id)?;
                match change {
                    SourceChange::Weight { old, new }
                    | SourceChange::QualityPenalty { old, new } => {
                        check_finite(t, "change.old", *old)?;
                        check_finite(t, "change.new", *new)?;
                    }
                    SourceChange::Url { new, .. } => check_url(t, "change.new", new)?,
                    SourceChange::Active { .. } => {}
                }
            }
            EventPayload::SourceScraped {
                source_id,
                scraped_at,
                ..
            } => {
                check_id(t, "source_id", source_id)?;
                check_required(t, "scraped_at", scraped_at)?;
                check_date(t, "scraped_at", scraped_at)?;
            }
            EventPayload::SignalCorroborated {
                entity_id,
                source_url,
            } => {
                check_id(t, "entity_id", entity_id)?;
                check_url(t, "source_url", source_url)?;
            }
            EventPayload::ActorIdentified {
                actor_id,
                name,
                entity_id,
                ..
            } => {
                check_id(t, "actor_id", actor_id)?;
                check_id(t, "entity_id", entity_id)?;
                check_required(t, "name", name)?;
            }
            EventPayload::SignalExpired { entity_id, .. } => check_id(t, "entity_id", entity_id)?,
            EventPayload::CauseHeatComputed { entity_id, heat } => {
                check_id(t, "entity_id", entity_id)?;
                check_finite(t, "heat", *heat)?;
            }
        }
        Ok(())
    }
}

/// What a producer submits: a payload plus the run that observed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub run_id: String,
    pub payload: EventPayload,
}

impl NewEvent {
    pub fn new(run_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            run_id: run_id.into(),
            payload,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.run_id.trim().is_empty() {
            return Err(ValidationError::MissingRunId);
        }
        if self.run_id.chars().any(char::is_control) {
            return Err(ValidationError::InvalidIdentifier {
                event_type: self.payload.type_tag(),
                field: "run_id",
            });
        }
        self.payload.validate()
    }
}

/// A fact as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: Seq,
    pub run_id: String,
    pub appended_at: DateTime<Utc>,
    pub payload: EventPayload,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Why an event was rejected at append. Rejected events are never stored.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("{event_type}: missing required field `{field}`")]
    MissingField {
        event_type: &'static str,
        field: &'static str,
    },
    #[error("{event_type}: field `{field}` must be a finite number")]
    NonFinite {
        event_type: &'static str,
        field: &'static str,
    },
    #[error("{event_type}: field `{field}` is not an RFC 3339 timestamp: {value:?}")]
    InvalidDate {
        event_type: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("{event_type}: field `{field}` is not a URL with a host: {value:?}")]
    InvalidUrl {
        event_type: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("{event_type}: identifier in `{field}` contains control characters")]
    InvalidIdentifier {
        event_type: &'static str,
        field: &'static str,
    },
    #[error("run_id must not be empty")]
    MissingRunId,
}

fn check_signal(t: &'static str, s: &SignalCore) -> Result<(), ValidationError> {
    check_id(t, "id", &s.id)?;
    check_required(t, "title", &s.title)?;
    check_finite(t, "lat", s.lat)?;
    check_finite(t, "lng", s.lng)?;
    if let Some(url) = &s.source_url {
        check_url(t, "source_url", url)?;
    }
    if let Some(source_id) = &s.source_id {
        check_id(t, "source_id", source_id)?;
    }
    Ok(())
}

fn check_required(t: &'static str, field: &'static str, v: &str) -> Result<(), ValidationError> {
    if v.trim().is_empty() {
        return Err(ValidationError::MissingField {
            event_type: t,
            field,
        });
    }
    Ok(())
}

fn check_id(t: &'static str, field: &'static str, id: &EntityId) -> Result<(), ValidationError> {
    check_required(t, field, id.as_str())?;
    if id.as_str().chars().any(char::is_control) {
        return Err(ValidationError::InvalidIdentifier {
            event_type: t,
            field,
        });
    }
    Ok(())
}

fn check_finite(t: &'static str, field: &'static str, v: f64) -> Result<(), ValidationError> {
    if !v.is_finite() {
        return Err(ValidationError::NonFinite {
            event_type: t,
            field,
        });
    }
    Ok(())
}

fn check_date(t: &'static str, field: &'static str, v: &str) -> Result<(), ValidationError> {
    parse_optional_date(v).map_err(|_| ValidationError::InvalidDate {
        event_type: t,
        field,
        value: v.to_string(),
    })?;
    Ok(())
}

fn check_url(t: &'static str, field: &'static str, v: &str) -> Result<(), ValidationError> {
    if url_host(v).is_none() || v.chars().any(char::is_control) {
        return Err(ValidationError::InvalidUrl {
            event_type: t,
            field,
            value: v.to_string(),
        });
    }
    Ok(())
}

/// Parse a date-like field. Empty (or all-whitespace) means "no value".
pub fn parse_optional_date(
    value: &str,
) -> std::result::Result<Option<DateTime<Utc>>, chrono::ParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        DateTime::parse_from_rfc3339(trimmed)?.with_timezone(&Utc),
    ))
}

/// Lower-cased host of `url` without a leading `www.`, or `None` when the
/// string has no `scheme://host` shape.
pub fn url_host(url: &str) -> Option<String> {
    let (_, rest) = url.trim().split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let host = host_port.split(':').next()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }
    Some(host)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
