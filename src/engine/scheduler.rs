//! Scheduler: claims batches, pairs items with tokens, verifies them
//! concurrently, and applies the outcome policy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::AdaptiveDelay;
use crate::error::Result;
use crate::model::{Outcome, QueueCounts, WorkItem};
use crate::pool::{Admission, TokenLease, TokenPool};
use crate::queue::{Requeue, WorkQueue};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_batch_span, start_check_span};
use crate::verifier::Verifier;

/// Tuning for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Items claimed and verified concurrently per batch.
    pub batch_size: usize,
    /// How often to look for new tokens while the pool is exhausted.
    pub token_poll_interval: Duration,
    /// Longest a batch waits for a token before releasing unpaired items.
    pub token_wait_ceiling: Duration,
    /// Pause between batches, by success ratio.
    pub delay: AdaptiveDelay,
    /// Consecutive fully-failed batches before a cool-down.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            token_poll_interval: Duration::from_secs(5),
            token_wait_ceiling: Duration::from_secs(60),
            delay: AdaptiveDelay::default(),
            failure_threshold: 10,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// What a run did, reported when it exits.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub batches: u64,
    /// Verification calls dispatched.
    pub attempts: u64,
    pub committed: u64,
    pub requeued: u64,
    /// Items committed with the terminal-failure verdict.
    pub exhausted: u64,
    pub cooldowns: u64,
    /// Exited on the stop signal rather than an empty queue.
    pub stopped: bool,
    pub counts: QueueCounts,
}

impl RunSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            batches: 0,
            attempts: 0,
            committed: 0,
            requeued: 0,
            exhausted: 0,
            cooldowns: 0,
            stopped: false,
            counts: QueueCounts::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchReport {
    attempted: usize,
    successes: usize,
}

/// Drives items from the work queue through the verifier.
pub struct Scheduler<V: Verifier> {
    queue: Arc<WorkQueue>,
    pool: Arc<TokenPool>,
    verifier: Arc<V>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl<V: Verifier> Clone for Scheduler<V> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            pool: Arc::clone(&self.pool),
            verifier: Arc::clone(&self.verifier),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<V: Verifier> Scheduler<V> {
    pub fn new(
        queue: Arc<WorkQueue>,
        pool: Arc<TokenPool>,
        verifier: Arc<V>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            verifier,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop submitting batches. Verifications already in flight finish and
    /// their outcomes are applied before [`Scheduler::run`] returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until no pending items remain or [`Scheduler::shutdown`] is called.
    ///
    /// Per-item failures are absorbed. Only storage errors end the run with
    /// `Err`.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::new(Uuid::new_v4());
        info!(
            run_id = %summary.run_id,
            batch_size = self.config.batch_size,
            "scheduler started"
        );

        if let Admission::Exhausted = self.pool.refresh().await? {
            warn!("no tokens available at start, will poll");
        }

        let mut failed_streak = 0u32;
        let mut next_delay: Option<Duration> = None;

        loop {
            if self.shutdown.is_cancelled() {
                summary.stopped = true;
                break;
            }
            if self.queue.is_drained().await && self.queue.reload_pending().await? == 0 {
                info!("no pending items remain");
                break;
            }
            if let Some(delay) = next_delay.take() {
                metrics::batch_delay_ms().record(delay.as_secs_f64() * 1000.0, &[]);
                if !self.pause(delay).await {
                    summary.stopped = true;
                    break;
                }
            }
            if failed_streak >= self.config.failure_threshold.max(1) {
                warn!(
                    failed_batches = failed_streak,
                    cooldown = ?self.config.cooldown,
                    "too many consecutive failed batches, cooling down"
                );
                summary.cooldowns += 1;
                if !self.pause(self.config.cooldown).await {
                    summary.stopped = true;
                    break;
                }
                failed_streak = 0;
            }

            summary.batches += 1;
            let span = start_batch_span(&summary.run_id, summary.batches);
            let report = self
                .run_batch(&mut summary)
                .instrument(span)
                .await
                .inspect_err(|e| error!("batch aborted: {e}"))?;

            if report.successes == 0 {
                failed_streak += 1;
            } else {
                failed_streak = 0;
            }
            next_delay = Some(
                self.config
                    .delay
                    .for_batch(report.successes, report.attempted),
            );
        }

        summary.finished_at = Some(Utc::now());
        summary.counts = self.queue.counts().await;
        info!(
            run_id = %summary.run_id,
            batches = summary.batches,
            committed = summary.committed,
            exhausted = summary.exhausted,
            stopped = summary.stopped,
            pending = summary.counts.pending,
            positive = summary.counts.positive,
            negative = summary.counts.negative,
            "scheduler finished"
        );
        Ok(summary)
    }

    async fn run_batch(&self, summary: &mut RunSummary) -> Result<BatchReport> {
        let items = self.queue.claim_batch(self.config.batch_size).await;
        if items.is_empty() {
            return Ok(BatchReport::default());
        }
        info!(claimed = items.len(), "batch claimed");

        // Pair every item with a token before dispatching anything.
        let mut paired: Vec<(WorkItem, TokenLease)> = Vec::with_capacity(items.len());
        let mut items = items.into_iter();
        while let Some(item) = items.next() {
            match self.lease_token().await? {
                Some(lease) => paired.push((item, lease)),
                None => {
                    let mut unpaired = vec![item];
                    unpaired.extend(items.by_ref());
                    warn!(
                        released = unpaired.len(),
                        "no token within wait ceiling, releasing unpaired items"
                    );
                    for item in &unpaired {
                        self.queue.release(item).await;
                    }
                }
            }
        }

        if self.shutdown.is_cancelled() {
            for (item, lease) in paired {
                self.pool.release(lease).await;
                self.queue.release(&item).await;
            }
            return Ok(BatchReport::default());
        }

        let outcomes = self.dispatch(paired).await;
        let mut report = BatchReport {
            attempted: outcomes.len(),
            successes: 0,
        };
        summary.attempts += outcomes.len() as u64;

        for (item, lease, outcome) in outcomes {
            metrics::verify_outcomes().add(1, &[KeyValue::new("outcome", outcome.as_str())]);
            if self.apply(item, lease, outcome, summary).await? {
                report.successes += 1;
            }
        }

        info!(
            attempted = report.attempted,
            successes = report.successes,
            "batch completed"
        );
        Ok(report)
    }

    /// Verify every pair concurrently and wait for all of them.
    async fn dispatch(
        &self,
        paired: Vec<(WorkItem, TokenLease)>,
    ) -> Vec<(WorkItem, TokenLease, Outcome)> {
        let mut tasks = JoinSet::new();
        let mut in_flight: Vec<Option<(WorkItem, TokenLease)>> = Vec::with_capacity(paired.len());

        for (idx, (item, lease)) in paired.into_iter().enumerate() {
            let verifier = Arc::clone(&self.verifier);
            let token = lease.token().clone();
            let task_item = item.clone();
            let span = start_check_span(&item);
            tasks.spawn(
                async move {
                    let outcome = verifier.check(&task_item, &token).await;
                    record_outcome(&tracing::Span::current(), outcome);
                    (idx, outcome)
                }
                .instrument(span),
            );
            in_flight.push(Some((item, lease)));
        }

        let mut outcomes = Vec::with_capacity(in_flight.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    if let Some((item, lease)) = in_flight[idx].take() {
                        outcomes.push((item, lease, outcome));
                    }
                }
                Err(e) => error!("verification task failed: {e}"),
            }
        }
        // A task that died without reporting concluded nothing.
        for (item, lease) in in_flight.into_iter().flatten() {
            outcomes.push((item, lease, Outcome::Transient));
        }
        outcomes
    }

    /// Apply the outcome policy to one verified item. Returns whether the
    /// item was conclusively verified.
    async fn apply(
        &self,
        item: WorkItem,
        lease: TokenLease,
        outcome: Outcome,
        summary: &mut RunSummary,
    ) -> Result<bool> {
        debug!(%item, token = %lease.token(), %outcome, "applying outcome");
        match outcome.verdict() {
            Some(verdict) => {
                self.pool.record_success(lease).await?;
                self.queue.commit(&item, verdict).await?;
                summary.committed += 1;
                Ok(true)
            }
            None => {
                if outcome == Outcome::AuthInvalid {
                    // Only the token is blamed; the item goes back unchanged.
                    self.pool.record_invalid(lease).await?;
                } else {
                    self.pool.release(lease).await;
                }
                metrics::items_requeued().add(1, &[KeyValue::new("cause", outcome.as_str())]);
                match self.queue.requeue(&item).await? {
                    Requeue::Pending { .. } => summary.requeued += 1,
                    Requeue::Exhausted { .. } => {
                        summary.committed += 1;
                        summary.exhausted += 1;
                    }
                    Requeue::Unknown => {}
                }
                Ok(false)
            }
        }
    }

    /// Lease a token, polling the token store until one shows up, the wait
    /// ceiling passes, or the stop signal fires.
    async fn lease_token(&self) -> Result<Option<TokenLease>> {
        if let Some(lease) = self.pool.acquire().await {
            return Ok(Some(lease));
        }

        let deadline = Instant::now() + self.config.token_wait_ceiling;
        info!(
            ceiling = ?self.config.token_wait_ceiling,
            "token pool exhausted, waiting for new tokens"
        );
        loop {
            if let Admission::Admitted(n @ 1..) = self.pool.refresh().await? {
                debug!(admitted = n, "new tokens arrived");
            }
            if let Some(lease) = self.pool.acquire().await {
                return Ok(Some(lease));
            }
            let now = Instant::now();
            if now >= deadline || self.shutdown.is_cancelled() {
                return Ok(None);
            }
            let wait = self.config.token_poll_interval.min(deadline - now);
            if !self.pause(wait).await {
                return Ok(None);
            }
        }
    }

    /// Sleep unless stopped first. Returns `false` on stop.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
