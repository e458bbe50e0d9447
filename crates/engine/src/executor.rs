//! Applies projected operations to a [`GraphStore`].
//!
//! Consecutive operations for one entity form a batch and go to the store in
//! a single call. Batches are spread over worker threads by entity hash, so
//! batches for the same entity always land on the same worker and run in
//! input order. There is no ordering across entities.

use std::time::{Duration, Instant};

use serde::Serialize;
use signalfold::{ApplyError, EngineConfig, EntityId, GraphStore, ProjectedOp, Seq};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Executor {
    workers: usize,
    max_retries: u32,
    backoff: Duration,
    timeout: Duration,
}

/// Outcome of one input operation, at the same index as the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpOutcome {
    pub seq: Seq,
    pub entity: EntityId,
    pub result: Result<(), ApplyError>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub outcomes: Vec<OpOutcome>,
    pub batches: usize,
}

impl ApplyReport {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.applied()
    }

    /// Failed input operations that are worth another attempt later.
    pub fn retryable_failures(&self, ops: &[ProjectedOp]) -> Vec<ProjectedOp> {
        ops.iter()
            .zip(&self.outcomes)
            .filter(|(_, o)| matches!(&o.result, Err(e) if e.is_retryable()))
            .map(|(op, _)| op.clone())
            .collect()
    }
}

impl Executor {
    pub fn new(workers: usize, max_retries: u32, backoff: Duration, timeout: Duration) -> Self {
        Self {
            workers: workers.max(1),
            max_retries,
            backoff,
            timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.apply_workers,
            config.apply_max_retries,
            config.apply_backoff(),
            config.apply_timeout(),
        )
    }

    /// Apply `ops` and report every operation's outcome. Failures never stop
    /// the remaining work.
    pub fn apply<G: GraphStore + ?Sized>(&self, ops: &[ProjectedOp], graph: &G) -> ApplyReport {
        let batches = entity_batches(ops);
        let mut per_worker: Vec<Vec<(usize, usize)>> = vec![Vec::new(); self.workers];
        for &(start, end) in &batches {
            per_worker[crate::shard_of(&ops[start].entity, self.workers)].push((start, end));
        }

        let mut results: Vec<Option<(Result<(), ApplyError>, u32)>> = vec![None; ops.len()];
        std::thread::scope(|scope| {
            let handles: Vec<_> = per_worker
                .iter()
                .filter(|b| !b.is_empty())
                .map(|assigned| {
                    scope.spawn(move || {
                        let mut done = Vec::new();
                        for &(start, end) in assigned {
                            let outcomes = self.run_batch(&ops[start..end], graph);
                            done.extend(
                                outcomes
                                    .into_iter()
                                    .enumerate()
                                    .map(|(i, outcome)| (start + i, outcome)),
                            );
                        }
                        done
                    })
                })
                .collect();
            for handle in handles {
                match handle.join() {
                    Ok(done) => {
                        for (i, outcome) in done {
                            results[i] = Some(outcome);
                        }
                    }
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
        });

        let outcomes = ops
            .iter()
            .zip(results)
            .map(|(op, slot)| {
                let (result, attempts) = slot.unwrap_or_else(|| {
                    (Err(ApplyError::Backend("operation was never scheduled".into())), 0)
                });
                OpOutcome {
                    seq: op.seq,
                    entity: op.entity.clone(),
                    result,
                    attempts,
                }
            })
            .collect();

        ApplyReport {
            outcomes,
            batches: batches.len(),
        }
    }

    /// One entity batch: a single store call, then per-op retries of
    /// backend failures with exponential backoff until the retry budget or
    /// the batch deadline runs out.
    fn run_batch<G: GraphStore + ?Sized>(
        &self,
        batch: &[ProjectedOp],
        graph: &G,
    ) -> Vec<(Result<(), ApplyError>, u32)> {
        let deadline = Instant::now() + self.timeout;
        let mut outcomes: Vec<(Result<(), ApplyError>, u32)> =
            vec![(Err(ApplyError::Backend("not attempted".into())), 0); batch.len()];
        let mut todo: Vec<usize> = (0..batch.len()).collect();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let subset: Vec<ProjectedOp> = todo.iter().map(|&i| batch[i].clone()).collect();
            let results = match graph.apply_batch(&subset) {
                Ok(results) if results.len() == subset.len() => results,
                Ok(results) => vec![
                    Err(ApplyError::Backend(format!(
                        "store returned {} outcomes for {} operations",
                        results.len(),
                        subset.len()
                    )));
                    subset.len()
                ],
                Err(e) => vec![Err(ApplyError::Backend(e.to_string())); subset.len()],
            };

            let mut retry = Vec::new();
            for (&i, result) in todo.iter().zip(results) {
                let backend_failure = matches!(result, Err(ApplyError::Backend(_)));
                outcomes[i] = (result, attempt);
                if backend_failure {
                    retry.push(i);
                }
            }
            if retry.is_empty() {
                break;
            }
            if attempt > self.max_retries {
                warn!(
                    entity = %batch[0].entity,
                    failed = retry.len(),
                    attempts = attempt,
                    "giving up on operations after retries"
                );
                break;
            }

            let wait = self.backoff.saturating_mul(1u32 << (attempt - 1).min(16));
            if Instant::now() + wait >= deadline {
                let ms = self.timeout.as_millis() as u64;
                for &i in &retry {
                    outcomes[i].0 = Err(ApplyError::TimedOut { ms });
                }
                warn!(entity = %batch[0].entity, failed = retry.len(), "batch deadline exceeded");
                break;
            }
            debug!(
                entity = %batch[0].entity,
                retrying = retry.len(),
                attempt,
                backoff_ms = wait.as_millis() as u64,
                "retrying failed operations"
            );
            std::thread::sleep(wait);
            todo = retry;
        }
        outcomes
    }
}

/// Half-open index ranges of consecutive operations sharing an entity.
fn entity_batches(ops: &[ProjectedOp]) -> Vec<(usize, usize)> {
    let mut batches = Vec::new();
    let mut start = 0;
    for i in 1..=ops.len() {
        if i == ops.len() || ops[i].entity != ops[start].entity {
            if start < i {
                batches.push((start, i));
            }
            start = i;
        }
    }
    batches
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
