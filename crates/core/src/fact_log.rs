//! Durable, append-only fact log on redb.
//!
//! Sequence numbers are assigned inside a redb write transaction. redb
//! serializes writers, so the transaction is the single ordering point for
//! concurrent producers, and `commit()` makes the event durable before
//! [`FactLog::append`] returns. Readers use MVCC read transactions and are
//! never blocked by appends.

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::VecDeque;
use std::path::Path;

use crate::event::{Event, NewEvent, Seq};
use crate::{Result, SignalfoldError};

/// Events keyed by sequence number, stored as JSON.
const EVENTS: TableDefinition<u64, &str> = TableDefinition::new("events");

/// `"{run_id}\u{1f}{seq:020}" -> seq`, for per-run audit reads.
const RUNS: TableDefinition<&str, u64> = TableDefinition::new("runs");

/// Producer idempotency key -> sequence number of the original append.
const IDEMPOTENCY: TableDefinition<&str, u64> = TableDefinition::new("idempotency");

const DEFAULT_PAGE_SIZE: usize = 256;

pub struct FactLog {
    db: Database,
}

impl FactLog {
    /// Open or create a fact log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// A log that lives only as long as this value. Used by tests and
    /// scratch tooling.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(EVENTS)?;
        write_txn.open_table(RUNS)?;
        write_txn.open_table(IDEMPOTENCY)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Validate and durably append `event`, returning its sequence number.
    ///
    /// Only structural problems are rejected; a rejected event consumes no
    /// sequence number.
    pub fn append(&self, event: NewEvent) -> Result<Seq> {
        event.validate()?;
        let write_txn = self.db.begin_write()?;
        let seq = Self::write_event_in_txn(&write_txn, &event)?;
        write_txn.commit()?;
        tracing::debug!(
            seq,
            event_type = event.payload.type_tag(),
            run_id = %event.run_id,
            "appended"
        );
        Ok(seq)
    }

    /// Append `event` at most once per `idempotency_key`. A retry with a key
    /// that was already used returns the original sequence number and
    /// stores nothing.
    pub fn append_idempotent(&self, idempotency_key: &str, event: NewEvent) -> Result<Seq> {
        event.validate()?;

        // Fast path: retries never take the write lock.
        {
            let read_txn = self.db.begin_read()?;
            let idem = read_txn.open_table(IDEMPOTENCY)?;
            if let Some(existing) = idem.get(idempotency_key)?.map(|g| g.value()) {
                return Ok(existing);
            }
        }

        let write_txn = self.db.begin_write()?;
        {
            let idem = write_txn.open_table(IDEMPOTENCY)?;
            let existing = idem.get(idempotency_key)?.map(|g| g.value());
            if let Some(existing) = existing {
                return Ok(existing);
            }
        }
        let seq = Self::write_event_in_txn(&write_txn, &event)?;
        {
            let mut idem = write_txn.open_table(IDEMPOTENCY)?;
            idem.insert(idempotency_key, seq)?;
        }
        write_txn.commit()?;
        Ok(seq)
    }

    fn write_event_in_txn(write_txn: &redb::WriteTransaction, event: &NewEvent) -> Result<Seq> {
        let mut events = write_txn.open_table(EVENTS)?;
        let last = events.last()?.map(|(k, _)| k.value()).unwrap_or(0);
        let seq = last + 1;
        let stored = Event {
            seq,
            run_id: event.run_id.clone(),
            appended_at: Utc::now(),
            payload: event.payload.clone(),
        };
        let json = serde_json::to_string(&stored)?;
        events.insert(seq, json.as_str())?;

        let mut runs = write_txn.open_table(RUNS)?;
        runs.insert(run_key(&event.run_id, seq).as_str(), seq)?;
        Ok(seq)
    }

    /// Sequence number of the newest event, or `0` for an empty log.
    pub fn last_seq(&self) -> Result<Seq> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS)?;
        let last = events.last()?.map(|(k, _)| k.value()).unwrap_or(0);
        Ok(last)
    }

    pub fn get(&self, seq: Seq) -> Result<Option<Event>> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS)?;
        let json: Option<String> = events.get(seq)?.map(|g| g.value().to_string());
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Lazily iterate events with `seq >= from`, up to the log head as of
    /// this call. Later appends are not included, so the cursor is finite.
    pub fn read_from(&self, from: Seq) -> Result<EventCursor<'_>> {
        let end = self.last_seq()?;
        Ok(EventCursor::new(self, from.max(1), end))
    }

    /// Lazily iterate events with `from <= seq <= until`.
    pub fn read_range(&self, from: Seq, until: Seq) -> Result<EventCursor<'_>> {
        let end = self.last_seq()?.min(until);
        Ok(EventCursor::new(self, from.max(1), end))
    }

    /// All events appended by one producer run, in sequence order.
    pub fn read_run(&self, run_id: &str) -> Result<Vec<Event>> {
        let prefix = format!("{run_id}\u{1f}");
        let read_txn = self.db.begin_read()?;
        let runs = read_txn.open_table(RUNS)?;
        let events = read_txn.open_table(EVENTS)?;

        let mut out = Vec::new();
        for entry in runs.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            let seq = v.value();
            let json: String = events
                .get(seq)?
                .map(|g| g.value().to_string())
                .ok_or_else(|| {
                    SignalfoldError::Internal(format!("run index points at missing event {seq}"))
                })?;
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }

    fn read_page(&self, from: Seq, until: Seq) -> Result<Vec<Event>> {
        let read_txn = self.db.begin_read()?;
        let events = read_txn.open_table(EVENTS)?;
        let mut page = Vec::new();
        for entry in events.range(from..=until)? {
            let (_, v) = entry?;
            page.push(serde_json::from_str(v.value())?);
        }
        Ok(page)
    }
}

fn run_key(run_id: &str, seq: Seq) -> String {
    format!("{run_id}\u{1f}{seq:020}")
}

/// Lazy, ordered cursor over a fixed range of the log.
///
/// Each page is read in its own short read transaction. To restart after an
/// interruption, open a new cursor at [`EventCursor::position`].
pub struct EventCursor<'a> {
    log: &'a FactLog,
    next: Seq,
    end: Seq,
    page: VecDeque<Event>,
    page_size: usize,
    failed: bool,
}

impl<'a> EventCursor<'a> {
    fn new(log: &'a FactLog, next: Seq, end: Seq) -> Self {
        Self {
            log,
            next,
            end,
            page: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
            failed: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sequence number of the next event this cursor would yield.
    pub fn position(&self) -> Seq {
        self.page.front().map(|e| e.seq).unwrap_or(self.next)
    }

    /// Last sequence number this cursor will reach.
    pub fn end(&self) -> Seq {
        self.end
    }
}

impl Iterator for EventCursor<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.page.is_empty() {
            if self.next > self.end {
                return None;
            }
            let until = self
                .next
                .saturating_add(self.page_size as u64 - 1)
                .min(self.end);
            match self.log.read_page(self.next, until) {
                Ok(page) => {
                    self.page.extend(page);
                    self.next = until + 1;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
