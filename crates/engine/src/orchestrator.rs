//! Drives the projection cycle.
//!
//! ```text
//! Idle → Projecting → Applying → Enriching
//!      → ProjectingEnrichment → ApplyingEnrichment → Idle
//! ```
//!
//! The watermark and deferred work live in the graph store's [`Checkpoint`]
//! and are saved after every apply phase. A crash anywhere in the cycle
//! resumes from the last saved checkpoint; re-applying operations is safe
//! because they are idempotent.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use signalfold::{
    signal_text, Checkpoint, Embedder, EmbeddingCache, EngineConfig, Event, FactLog, GraphStore,
    NewEvent, ProjectedOp, Seq,
};
use tracing::{debug, info, warn};

use crate::enrich::{CauseHeat, Enricher};
use crate::executor::Executor;
use crate::projector::project_sharded;
use crate::replay::{self, ReplayDiscrepancy, ReplayOptions};
use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CyclePhase {
    Idle,
    Projecting,
    Applying,
    Enriching,
    ProjectingEnrichment,
    ApplyingEnrichment,
}

/// Cooperative cancellation, honored between phases only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for one project/apply pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleDetail {
    /// Events read past the watermark.
    pub events: usize,
    /// Pending events re-projected.
    pub reprojected: usize,
    pub ops_applied: usize,
    pub ops_failed: usize,
    pub projection_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub start_watermark: Seq,
    pub end_watermark: Seq,
    pub projection: CycleDetail,
    pub enrichment: CycleDetail,
    /// Seqs of facts appended by enrichers this cycle.
    pub enrichment_events: Vec<Seq>,
    pub enrichment_deferred: usize,
    /// Enrichers did not run because a backlog remains past this batch.
    pub enrichment_skipped: bool,
    pub deferred_ops: usize,
    pub pending_events: usize,
    /// The phase after which the cycle stopped on cancellation.
    pub cancelled_after: Option<CyclePhase>,
}

impl CycleReport {
    /// Nothing new was read or written.
    pub fn is_idle(&self) -> bool {
        self.projection.events == 0
            && self.enrichment.events == 0
            && self.enrichment_events.is_empty()
    }
}

pub struct Orchestrator<G: GraphStore> {
    log: Arc<FactLog>,
    cache: Arc<EmbeddingCache>,
    embedder: Arc<dyn Embedder>,
    graph: Arc<G>,
    config: EngineConfig,
    executor: Executor,
    enrichers: Vec<Box<dyn Enricher>>,
    phase: Mutex<CyclePhase>,
    /// Cycles in a row that skipped enrichment because of a backlog.
    skipped_enrichments: AtomicUsize,
}

impl<G: GraphStore> Orchestrator<G> {
    /// An orchestrator with the default cause-heat enricher.
    pub fn new(
        log: Arc<FactLog>,
        cache: Arc<EmbeddingCache>,
        embedder: Arc<dyn Embedder>,
        graph: Arc<G>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let enrichers: Vec<Box<dyn Enricher>> = vec![Box::new(CauseHeat::from_config(&config))];
        Ok(Self {
            log,
            cache,
            embedder,
            graph,
            executor: Executor::from_config(&config),
            config,
            enrichers,
            phase: Mutex::new(CyclePhase::Idle),
            skipped_enrichments: AtomicUsize::new(0),
        })
    }

    pub fn with_enrichers(mut self, enrichers: Vec<Box<dyn Enricher>>) -> Self {
        self.enrichers = enrichers;
        self
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase.lock().map(|p| *p).unwrap_or(CyclePhase::Idle)
    }

    fn enter(&self, phase: CyclePhase) {
        if let Ok(mut p) = self.phase.lock() {
            *p = phase;
        }
        debug!(?phase, "phase");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &FactLog {
        &self.log
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.graph.load_checkpoint().map_err(EngineError::Graph)
    }

    /// Run one cycle. Returns immediately with an idle report when there is
    /// nothing past the watermark and no deferred work.
    pub fn run_cycle(&self, cancel: &CancelToken) -> Result<CycleReport> {
        let result = self.cycle(cancel);
        self.enter(CyclePhase::Idle);
        result
    }

    fn cycle(&self, cancel: &CancelToken) -> Result<CycleReport> {
        let mut cp = self.checkpoint()?;
        let head = self.log.last_seq().map_err(EngineError::Log)?;
        let mut report = CycleReport {
            start_watermark: cp.watermark,
            end_watermark: cp.watermark,
            ..CycleReport::default()
        };
        if head <= cp.watermark && cp.is_settled() {
            return Ok(report);
        }

        // Project + Apply
        let until = head.min(cp.watermark.saturating_add(self.config.batch_size as u64));
        self.enter(CyclePhase::Projecting);
        let (events, reprojected) = self.read_batch(&cp, until, true)?;
        let ops = self.project(&events, &mut cp, &mut report.projection);
        report.projection.events = events.len() - reprojected;
        report.projection.reprojected = reprojected;
        if self.stop(cancel, CyclePhase::Projecting, &mut report) {
            return Ok(report);
        }

        self.enter(CyclePhase::Applying);
        self.apply(ops, until, &mut cp, &mut report.projection)?;
        report.end_watermark = cp.watermark;
        if self.stop(cancel, CyclePhase::Applying, &mut report) {
            return Ok(self.finish(report, &cp));
        }

        if until < head {
            let skipped = self.skipped_enrichments.fetch_add(1, Ordering::SeqCst) + 1;
            if skipped < self.config.max_skipped_enrichments {
                report.enrichment_skipped = true;
                debug!(until, head, skipped, "backlog remains; enrichment waits for catch-up");
                return Ok(self.finish(report, &cp));
            }
            info!(until, head, skipped, "backlog persists; enriching the partial graph");
        }
        self.skipped_enrichments.store(0, Ordering::SeqCst);

        // Enrich
        self.enter(CyclePhase::Enriching);
        self.enrich(&mut report)?;
        if self.stop(cancel, CyclePhase::Enriching, &mut report) {
            return Ok(self.finish(report, &cp));
        }

        // Project + Apply enrichment facts
        let head = self.log.last_seq().map_err(EngineError::Log)?;
        if head > cp.watermark {
            let until = head.min(cp.watermark.saturating_add(self.config.batch_size as u64));
            self.enter(CyclePhase::ProjectingEnrichment);
            let (events, _) = self.read_batch(&cp, until, false)?;
            let ops = self.project(&events, &mut cp, &mut report.enrichment);
            report.enrichment.events = events.len();
            if self.stop(cancel, CyclePhase::ProjectingEnrichment, &mut report) {
                return Ok(self.finish(report, &cp));
            }

            self.enter(CyclePhase::ApplyingEnrichment);
            self.apply(ops, until, &mut cp, &mut report.enrichment)?;
            report.end_watermark = cp.watermark;
        }

        Ok(self.finish(report, &cp))
    }

    fn stop(&self, cancel: &CancelToken, after: CyclePhase, report: &mut CycleReport) -> bool {
        if cancel.is_cancelled() {
            info!(?after, "cycle cancelled");
            report.cancelled_after = Some(after);
            return true;
        }
        false
    }

    fn finish(&self, mut report: CycleReport, cp: &Checkpoint) -> CycleReport {
        report.deferred_ops = cp.deferred.len();
        report.pending_events = cp.pending.len();
        info!(
            from = report.start_watermark,
            to = report.end_watermark,
            events = report.projection.events,
            applied = report.projection.ops_applied + report.enrichment.ops_applied,
            failed = report.projection.ops_failed + report.enrichment.ops_failed,
            enrichment_events = report.enrichment_events.len(),
            deferred_ops = report.deferred_ops,
            pending_events = report.pending_events,
            "cycle finished"
        );
        report
    }

    /// Events in `(watermark, until]`, preceded by pending events when asked.
    /// Returns the events and how many of them were pending re-projections.
    fn read_batch(
        &self,
        cp: &Checkpoint,
        until: Seq,
        with_pending: bool,
    ) -> Result<(Vec<Event>, usize)> {
        let mut events = Vec::new();
        if with_pending {
            for &seq in &cp.pending {
                if let Some(event) = self.log.get(seq).map_err(EngineError::Log)? {
                    events.push(event);
                }
            }
        }
        let reprojected = events.len();
        for event in self
            .log
            .read_range(cp.watermark + 1, until)
            .map_err(EngineError::Log)?
        {
            events.push(event.map_err(EngineError::Log)?);
        }
        Ok((events, reprojected))
    }

    /// Warm the cache for discovery texts, then project. Events whose
    /// embedding is still missing become pending, unless their text can
    /// never be embedded.
    fn project(
        &self,
        events: &[Event],
        cp: &mut Checkpoint,
        detail: &mut CycleDetail,
    ) -> Vec<ProjectedOp> {
        let unembeddable = warm_cache(events, &self.cache, self.embedder.as_ref());
        let projection = project_sharded(events, self.cache.as_ref(), self.config.apply_workers);

        for event in events {
            cp.pending.remove(&event.seq);
        }
        for error in &projection.errors {
            if error.is_retryable() && !unembeddable.contains(&error.seq()) {
                cp.pending.insert(error.seq());
            } else {
                warn!(%error, "event cannot be fully projected");
            }
        }
        detail.projection_errors = projection.errors.len();
        projection.ops
    }

    fn apply(
        &self,
        ops: Vec<ProjectedOp>,
        until: Seq,
        cp: &mut Checkpoint,
        detail: &mut CycleDetail,
    ) -> Result<()> {
        // New operations first, so retried ones can find referents they create.
        let deferred = std::mem::take(&mut cp.deferred);
        let retried = deferred.len();
        let mut all = ops;
        all.extend(deferred);

        let report = self.executor.apply(&all, self.graph.as_ref());
        detail.ops_applied += report.applied();
        detail.ops_failed += report.failed();
        cp.deferred = report.retryable_failures(&all);
        cp.watermark = cp.watermark.max(until);
        if report.failed() > cp.deferred.len() {
            warn!(
                dropped = report.failed() - cp.deferred.len(),
                "operations failed permanently"
            );
        }
        debug!(
            retried,
            applied = report.applied(),
            deferred = cp.deferred.len(),
            "apply finished"
        );
        self.graph.save_checkpoint(cp).map_err(EngineError::Graph)
    }

    fn enrich(&self, report: &mut CycleReport) -> Result<()> {
        let snapshot = self.graph.snapshot().map_err(EngineError::Graph)?;
        for enricher in &self.enrichers {
            let outcome = enricher.enrich(&snapshot, &self.cache, self.embedder.as_ref());
            report.enrichment_deferred += outcome.deferred.len();
            for payload in outcome.events {
                let seq = self
                    .log
                    .append(NewEvent::new(self.config.enrichment_run_id.clone(), payload))
                    .map_err(EngineError::Log)?;
                report.enrichment_events.push(seq);
            }
            debug!(enricher = enricher.name(), "enricher finished");
        }
        Ok(())
    }

    /// Cycle until a cycle reads nothing new, `max_cycles` is reached, or the
    /// token is cancelled.
    pub fn run_until_idle(
        &self,
        cancel: &CancelToken,
        max_cycles: usize,
    ) -> Result<Vec<CycleReport>> {
        let mut reports = Vec::new();
        for _ in 0..max_cycles {
            let report = self.run_cycle(cancel)?;
            let done = report.is_idle() || report.cancelled_after.is_some();
            reports.push(report);
            if done {
                break;
            }
        }
        Ok(reports)
    }

    /// Replay the log up to the live watermark and diff against the live graph.
    pub fn audit(&self, verify_enrichment: bool) -> Result<ReplayDiscrepancy> {
        let cp = self.checkpoint()?;
        replay::audit(
            &self.log,
            &self.cache,
            self.embedder.as_ref(),
            &self.config,
            self.graph.as_ref(),
            ReplayOptions {
                from: 0,
                until: Some(cp.watermark),
                verify_enrichment,
            },
        )
    }
}

/// Resolve every discovery text through the cache so projection can find it.
/// Failures are left for the projector to report. Returns the events whose
/// text can never be embedded.
pub(crate) fn warm_cache(
    events: &[Event],
    cache: &EmbeddingCache,
    embedder: &dyn Embedder,
) -> BTreeSet<Seq> {
    let mut unembeddable = BTreeSet::new();
    for event in events {
        if let Some((_, core)) = event.payload.signal() {
            let text = signal_text(&core.title, &core.summary);
            if let Err(error) = cache.get_or_compute(&text, embedder) {
                warn!(seq = event.seq, entity = %core.id, %error, "embedding unavailable");
                if error.is_permanent() {
                    unembeddable.insert(event.seq);
                }
            }
        }
    }
    unembeddable
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
