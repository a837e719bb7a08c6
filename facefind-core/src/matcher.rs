//! Progressive top-K matching over a candidate pool.
//!
//! A session resolves the query descriptor, then walks the pool in
//! fixed-size batches. Candidates inside a batch are scored by a bounded
//! set of workers; the batch is a barrier, and only the scheduler touches
//! the best-of list and progress counters, strictly between batches.
//! A snapshot is published after every batch so callers can act on
//! partial results before the scan finishes.

use crate::descriptor::{Descriptor, DescriptorError, DescriptorSource, ImageInput};
use crate::pool::{Candidate, CandidatePool, DescriptorSlot, PoolError};
use crate::session::{CancelHandle, MatchHandle, MatchSnapshot, MatchState, Progress};
use crate::threshold::{self, Fallback, ResultKind};
use crate::vector;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MatchError {
    #[error("Query image could not be resolved: {0}")]
    Query(#[from] DescriptorError),
    #[error("Candidate pool failed: {0}")]
    Pool(#[from] PoolError),
    #[error("Match session aborted unexpectedly: {0}")]
    Internal(String),
}

/// Options for one match session
#[derive(Debug, Clone, PartialEq)]
pub struct MatchConfig {
    /// Candidates per batch
    pub batch_size: usize,
    /// Maximum simultaneous in-flight scorings
    pub concurrency: usize,
    /// Maximum candidates ever considered
    pub pool_ceiling: usize,
    /// Best-of list capacity
    pub top_k: usize,
    /// Minimum publishable score
    pub threshold: f32,
    pub fallback: Fallback,
    /// Per-call limit for each descriptor resolution
    pub resolve_timeout: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 24,
            concurrency: 4,
            pool_ceiling: 2000,
            top_k: 60,
            threshold: 0.45,
            fallback: Fallback::Strict,
            resolve_timeout: Duration::from_secs(15),
        }
    }
}

/// A candidate with its similarity to the query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f32,
    /// Position in pool enumeration order, used to break ties
    pub ordinal: usize,
}

/// Why a visited candidate produced no score
#[derive(Debug, Clone, PartialEq)]
pub enum Unscored {
    Descriptor(DescriptorError),
    /// Descriptor present but empty, non-finite, or of the wrong dimension
    Unusable { dim: usize, expected: usize },
    /// Skipped because the session was cancelled
    Aborted,
}

/// Final state of a session that was not failed
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// `Completed` or `Cancelled`
    pub state: MatchState,
    pub results: Vec<ScoredCandidate>,
    pub kind: ResultKind,
    pub progress: Progress,
    pub unscored: usize,
    /// Full best-of list before threshold filtering
    pub best_of: Vec<ScoredCandidate>,
}

/// Descending score, earlier enumeration first on ties
fn rank(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.ordinal.cmp(&b.ordinal))
}

/// Starts progressive match sessions against a shared pool
#[derive(Clone)]
pub struct Matcher {
    source: Arc<DescriptorSource>,
    pool: Arc<dyn CandidatePool>,
}

impl Matcher {
    pub fn new(source: Arc<DescriptorSource>, pool: Arc<dyn CandidatePool>) -> Self {
        Self { source, pool }
    }

    /// Spawn a session on the current tokio runtime
    pub fn start(&self, query: ImageInput, config: MatchConfig) -> MatchHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelHandle::new();
        let session = Session::new(
            Arc::clone(&self.source),
            Arc::clone(&self.pool),
            config,
            cancel.clone(),
            tx,
        );
        let task = tokio::spawn(session.run(query));
        MatchHandle::new(rx, cancel, task)
    }

    /// Run a session to completion on the calling task
    pub async fn run(
        &self,
        query: ImageInput,
        config: MatchConfig,
        cancel: CancelHandle,
        updates: mpsc::UnboundedSender<MatchSnapshot>,
    ) -> Result<MatchOutcome, MatchError> {
        Session::new(
            Arc::clone(&self.source),
            Arc::clone(&self.pool),
            config,
            cancel,
            updates,
        )
        .run(query)
        .await
    }
}

type BatchOutcome = (usize, Candidate, Result<f32, Unscored>);

/// Run-state of one session; owned exclusively by its scheduler task
struct Session {
    source: Arc<DescriptorSource>,
    pool: Arc<dyn CandidatePool>,
    config: MatchConfig,
    cancel: CancelHandle,
    updates: mpsc::UnboundedSender<MatchSnapshot>,
    state: MatchState,
    best_of: Vec<ScoredCandidate>,
    published: Vec<ScoredCandidate>,
    kind: ResultKind,
    progress: Progress,
    unscored: usize,
}

impl Session {
    fn new(
        source: Arc<DescriptorSource>,
        pool: Arc<dyn CandidatePool>,
        mut config: MatchConfig,
        cancel: CancelHandle,
        updates: mpsc::UnboundedSender<MatchSnapshot>,
    ) -> Self {
        config.batch_size = config.batch_size.max(1);
        config.concurrency = config.concurrency.max(1);

        Self {
            source,
            pool,
            config,
            cancel,
            updates,
            state: MatchState::Idle,
            best_of: Vec::new(),
            published: Vec::new(),
            kind: ResultKind::Confident,
            progress: Progress::default(),
            unscored: 0,
        }
    }

    /// Drive the session from `Preparing` to a terminal state.
    ///
    /// Cancellation is observed while the query resolves, at the start of
    /// every batch, while waiting for workers, and after each barrier; a
    /// batch interrupted by cancellation is never merged.
    async fn run(mut self, query: ImageInput) -> Result<MatchOutcome, MatchError> {
        let start = Instant::now();
        log::info!(
            "Starting match session (batch={}, concurrency={}, top_k={}, threshold={:.2})",
            self.config.batch_size,
            self.config.concurrency,
            self.config.top_k,
            self.config.threshold
        );

        self.state = MatchState::Preparing;
        self.emit(None);

        // Step 1: resolve the query, unless the caller gives up first
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.token().cancelled() => None,
            resolved = self.resolve_query(&query) => Some(resolved),
        };
        let query = match resolved {
            Some(Ok(descriptor)) => descriptor,
            Some(Err(e)) => return Err(self.fail(e)),
            None => {
                log::debug!("Match session cancelled while resolving the query");
                return Ok(self.finish(MatchState::Cancelled, start));
            }
        };
        log::debug!("Query descriptor ready ({} dims)", query.len());

        // Step 2: fix the scan window for the whole session
        let total = match self.pool.size().await {
            Ok(size) => size.min(self.config.pool_ceiling),
            Err(e) => return Err(self.fail(e.into())),
        };
        self.progress.total = total;
        self.state = MatchState::Scanning;
        self.emit(None);

        // Step 3: walk the pool batch by batch
        let mut offset = 0;
        while offset < total {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(MatchState::Cancelled, start));
            }

            let count = self.config.batch_size.min(total - offset);
            let batch = match self.pool.slice(offset, count).await {
                Ok(batch) if batch.len() == count => batch,
                Ok(batch) => {
                    let e = PoolError::Enumeration(format!(
                        "expected {} candidates at offset {}, pool returned {}",
                        count,
                        offset,
                        batch.len()
                    ));
                    return Err(self.fail(e.into()));
                }
                Err(e) => return Err(self.fail(e.into())),
            };

            let batch_start = Instant::now();
            let outcomes = self.score_batch(&query, batch, offset).await;

            if self.cancel.is_cancelled() {
                log::debug!("Discarding batch at offset {} after cancellation", offset);
                return Ok(self.finish(MatchState::Cancelled, start));
            }

            self.merge(outcomes, count);
            self.progress.done += count;
            offset += count;
            log::debug!(
                "⏱️  Batch {}..{}: {}ms, best so far {:.3}",
                offset - count,
                offset,
                batch_start.elapsed().as_millis(),
                self.best_of.first().map(|e| e.score).unwrap_or(f32::NAN)
            );
            self.emit(None);
        }

        Ok(self.finish(MatchState::Completed, start))
    }

    /// Resolve the selfie; a descriptor with non-finite values is rejected
    async fn resolve_query(&self, query: &ImageInput) -> Result<Descriptor, MatchError> {
        let descriptor = self
            .source
            .resolve_with_timeout(query, self.config.resolve_timeout)
            .await?;
        if !vector::is_usable(&descriptor, descriptor.len()) {
            return Err(MatchError::Query(DescriptorError::Transport(
                "provider returned a non-finite query descriptor".to_string(),
            )));
        }
        Ok(descriptor)
    }

    /// Score one batch with at most `concurrency` workers in flight
    async fn score_batch(
        &self,
        query: &Descriptor,
        batch: Vec<Candidate>,
        offset: usize,
    ) -> Vec<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut workers = JoinSet::new();
        let mut outcomes = Vec::with_capacity(batch.len());

        for (idx, candidate) in batch.into_iter().enumerate() {
            let ordinal = offset + idx;

            let permit = tokio::select! {
                biased;
                _ = self.cancel.token().cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                outcomes.push((ordinal, candidate, Err(Unscored::Aborted)));
                continue;
            };

            let source = Arc::clone(&self.source);
            let query = query.clone();
            let timeout = self.config.resolve_timeout;
            workers.spawn(async move {
                let _permit = permit;
                let outcome = score_candidate(&source, &query, &candidate, timeout).await;
                (ordinal, candidate, outcome)
            });
        }

        // Barrier: wait for every worker, or stop waiting as soon as the
        // session is cancelled and leave in-flight calls to settle unobserved
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.token().cancelled() => {
                    if !workers.is_empty() {
                        log::debug!("Detaching {} in-flight workers after cancellation", workers.len());
                    }
                    workers.detach_all();
                    break;
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => log::warn!("Scoring worker failed: {}", e),
                    None => break,
                },
            }
        }

        outcomes
    }

    /// Fold a settled batch into the best-of list.
    ///
    /// Every visited candidate without a score counts as unscored, whatever
    /// the reason. A re-scored id replaces its earlier entry, then the list
    /// is re-sorted by (score desc, ordinal asc) and cut to `top_k`, so the
    /// result does not depend on the order workers finished in.
    fn merge(&mut self, outcomes: Vec<BatchOutcome>, count: usize) {
        let mut scored = 0;
        for (ordinal, candidate, outcome) in outcomes {
            match outcome {
                Ok(score) => {
                    scored += 1;
                    self.best_of.retain(|entry| entry.candidate.id != candidate.id);
                    self.best_of.push(ScoredCandidate {
                        candidate,
                        score,
                        ordinal,
                    });
                }
                Err(Unscored::Descriptor(DescriptorError::NoFace)) => {
                    log::debug!("No face in candidate {}", candidate.id);
                }
                Err(reason) => {
                    log::warn!("Candidate {} unscored: {:?}", candidate.id, reason);
                }
            }
        }
        self.unscored += count - scored;

        self.best_of.sort_by(rank);
        self.best_of.truncate(self.config.top_k);
    }

    /// Apply the threshold policy to the current best-of list and publish
    /// the resulting snapshot with the session's state and counters
    fn emit(&mut self, error: Option<MatchError>) {
        let (results, kind) =
            threshold::publish(&self.best_of, self.config.threshold, self.config.fallback);
        self.published = results;
        self.kind = kind;

        let snapshot = MatchSnapshot {
            results: self.published.clone(),
            kind,
            progress: self.progress,
            state: self.state,
            unscored: self.unscored,
            error,
        };
        // The caller may have stopped listening; the scan still runs to its end
        let _ = self.updates.send(snapshot);
    }

    /// End the session in `Completed` or `Cancelled`, publishing the
    /// terminal snapshot. The published results become the outcome.
    fn finish(mut self, state: MatchState, start: Instant) -> MatchOutcome {
        self.state = state;
        self.emit(None);

        log::info!(
            "Match session {:?}: {} results from {}/{} candidates ({} unscored) in {}ms",
            state,
            self.published.len(),
            self.progress.done,
            self.progress.total,
            self.unscored,
            start.elapsed().as_millis()
        );

        MatchOutcome {
            state,
            results: self.published,
            kind: self.kind,
            progress: self.progress,
            unscored: self.unscored,
            best_of: self.best_of,
        }
    }

    /// Mark the session `Failed` and publish the error on the terminal snapshot
    fn fail(&mut self, error: MatchError) -> MatchError {
        log::warn!("Match session failed: {}", error);
        self.state = MatchState::Failed;
        self.emit(Some(error.clone()));
        error
    }
}

/// Resolve a candidate's descriptor if needed and score it against the query
async fn score_candidate(
    source: &DescriptorSource,
    query: &Descriptor,
    candidate: &Candidate,
    timeout: Duration,
) -> Result<f32, Unscored> {
    let descriptor = match &candidate.descriptor {
        DescriptorSlot::Ready(descriptor) => descriptor.clone(),
        DescriptorSlot::Deferred(input) => source
            .resolve_with_timeout(input, timeout)
            .await
            .map_err(Unscored::Descriptor)?,
    };

    if !vector::is_usable(&descriptor, query.len()) {
        return Err(Unscored::Unusable {
            dim: descriptor.len(),
            expected: query.len(),
        });
    }

    Ok(vector::similarity(query, &descriptor))
}
