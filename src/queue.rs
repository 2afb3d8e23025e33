//! Work queue: the durable pending set, the two result sets, and the
//! in-memory claim and retry bookkeeping that sits on top of them.
//!
//! All state lives behind one lock. Every mutation is written to the
//! backing store before the in-memory view changes, so a storage failure
//! never leaves memory ahead of disk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{QueueCounts, Verdict, WorkItem};
use crate::storage::{KeySetStore, RetryPolicy, Stores};
use crate::telemetry::metrics;

/// What happened when a worker tried to claim an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    AlreadyClaimed,
    /// Not in the pending set (never ingested, or already committed).
    NotPending,
}

/// What happened when an item was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    Committed(Verdict),
    /// Already in a result set. Nothing moved.
    AlreadyCommitted(Verdict),
    /// Not known to the queue at all.
    Unknown,
}

/// What happened when a failed item was handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Back in the pending set after `retries` requeues.
    Pending { retries: u32 },
    /// Retry budget exhausted; committed with the terminal-failure verdict.
    Exhausted { attempts: u32 },
    /// Not pending; nothing to requeue.
    Unknown,
}

/// Result of ingesting an input list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub admitted: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

#[derive(Default)]
struct QueueState {
    /// Pending items in processing order. Claimed items stay here until
    /// they are committed or requeued.
    pending: Vec<WorkItem>,
    pending_set: HashSet<WorkItem>,
    claimed: HashSet<WorkItem>,
    positive: HashSet<WorkItem>,
    negative: HashSet<WorkItem>,
    /// Requeue count per item, cleared on commit.
    retries: HashMap<WorkItem, u32>,
}

impl QueueState {
    fn verdict_of(&self, item: &WorkItem) -> Option<Verdict> {
        if self.positive.contains(item) {
            Some(Verdict::Positive)
        } else if self.negative.contains(item) {
            Some(Verdict::Negative)
        } else {
            None
        }
    }

    fn knows(&self, item: &WorkItem) -> bool {
        self.pending_set.contains(item) || self.verdict_of(item).is_some()
    }

    fn push_pending(&mut self, item: WorkItem) {
        self.pending_set.insert(item.clone());
        self.pending.push(item);
    }

    fn drop_pending(&mut self, item: &WorkItem) {
        if self.pending_set.remove(item) {
            self.pending.retain(|p| p != item);
        }
        self.claimed.remove(item);
    }

    fn counts(&self) -> QueueCounts {
        QueueCounts {
            pending: self.pending.len() - self.claimed.len(),
            claimed: self.claimed.len(),
            positive: self.positive.len(),
            negative: self.negative.len(),
        }
    }
}

/// Durable, deduplicated work queue with atomic claim, commit and requeue.
pub struct WorkQueue {
    pending_store: Arc<dyn KeySetStore>,
    positive_store: Arc<dyn KeySetStore>,
    negative_store: Arc<dyn KeySetStore>,
    retry: RetryPolicy,
    max_retries: u32,
    state: Mutex<QueueState>,
}

impl WorkQueue {
    /// Load the queue from its stores and persist any cleanup.
    ///
    /// Malformed lines are dropped. Pending items that already have a result
    /// (a commit interrupted between its two writes) are dropped from the
    /// pending store. Items found in both result sets keep the positive
    /// verdict and are dropped from the negative store.
    pub async fn open(stores: &Stores, max_retries: u32, retry: RetryPolicy) -> Result<Self> {
        let (state, cleanup) = read_state(stores, retry).await?;

        if cleanup.overlapping > 0 {
            let positive = as_key_set(&state.positive);
            let removed = retry
                .run("retain", &stores.negative, move |s| {
                    s.retain(&mut |k: &str| !positive.contains(k))
                })
                .await?;
            warn!(removed, "dropped negative results that are also positive");
        }

        if cleanup.stale_pending > 0 {
            let mut committed = as_key_set(&state.positive);
            committed.extend(as_key_set(&state.negative));
            let removed = retry
                .run("retain", &stores.pending, move |s| {
                    let mut seen = HashSet::new();
                    s.retain(&mut |k: &str| {
                        WorkItem::parse(k).is_ok()
                            && !committed.contains(k)
                            && seen.insert(k.to_string())
                    })
                })
                .await?;
            info!(
                removed,
                kept = state.pending.len(),
                "cleaned pending store on open"
            );
        }

        Ok(Self::with_state(stores, max_retries, retry, state))
    }

    /// Load the queue without writing to any store. For monitors that only
    /// read counts while another process owns the queue.
    pub async fn load(stores: &Stores, max_retries: u32, retry: RetryPolicy) -> Result<Self> {
        let (state, _) = read_state(stores, retry).await?;
        Ok(Self::with_state(stores, max_retries, retry, state))
    }

    fn with_state(stores: &Stores, max_retries: u32, retry: RetryPolicy, state: QueueState) -> Self {
        Self {
            pending_store: Arc::clone(&stores.pending),
            positive_store: Arc::clone(&stores.positive),
            negative_store: Arc::clone(&stores.negative),
            retry,
            max_retries,
            state: Mutex::new(state),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Add items to the pending set, skipping anything the queue or the
    /// stores already know about (pending, claimed, or committed).
    ///
    /// Only the new items are appended, so items another process ingested
    /// or committed since this queue was loaded are left alone.
    pub async fn ingest<I, S>(&self, items: I) -> Result<IngestReport>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = IngestReport::default();
        let mut state = self.state.lock().await;

        let mut stored = HashSet::new();
        for store in [&self.pending_store, &self.positive_store, &self.negative_store] {
            stored.extend(self.retry.run("list", store, |s| s.list()).await?);
        }

        let mut fresh = Vec::new();
        let mut seen = HashSet::new();
        for raw in items {
            let raw = raw.as_ref();
            if raw.trim().is_empty() {
                continue;
            }
            report.received += 1;
            let item = match WorkItem::parse(raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "skipping invalid input line");
                    report.invalid += 1;
                    continue;
                }
            };
            if state.knows(&item)
                || stored.contains(item.as_str())
                || !seen.insert(item.clone())
            {
                report.duplicates += 1;
                continue;
            }
            fresh.push(item);
        }

        if !fresh.is_empty() {
            let keys = as_keys(&fresh);
            self.retry
                .run("append_all", &self.pending_store, move |s| s.append_all(&keys))
                .await?;
            report.admitted = fresh.len();
            for item in fresh {
                state.push_pending(item);
            }
        }

        info!(
            received = report.received,
            admitted = report.admitted,
            duplicates = report.duplicates,
            invalid = report.invalid,
            "ingested items"
        );
        Ok(report)
    }

    /// Pick up items another writer appended to the pending store.
    pub async fn reload_pending(&self) -> Result<usize> {
        let lines = self
            .retry
            .run("list", &self.pending_store, |s| s.list())
            .await?;
        let mut state = self.state.lock().await;
        let mut added = 0;
        for item in parse_stored(lines, "pending") {
            if !state.knows(&item) {
                state.push_pending(item);
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "picked up externally ingested items");
        }
        Ok(added)
    }

    /// Up to `n` pending items that nobody has claimed, without claiming them.
    pub async fn peek_batch(&self, n: usize) -> Vec<WorkItem> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .filter(|item| !state.claimed.contains(*item))
            .take(n)
            .cloned()
            .collect()
    }

    /// Claim one item for the calling worker.
    pub async fn claim(&self, item: &WorkItem) -> Claim {
        let mut state = self.state.lock().await;
        if !state.pending_set.contains(item) {
            return Claim::NotPending;
        }
        if !state.claimed.insert(item.clone()) {
            return Claim::AlreadyClaimed;
        }
        debug!(%item, "claimed");
        Claim::Claimed
    }

    /// Peek and claim up to `n` items under a single lock.
    pub async fn claim_batch(&self, n: usize) -> Vec<WorkItem> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let batch: Vec<WorkItem> = state
            .pending
            .iter()
            .filter(|item| !state.claimed.contains(*item))
            .take(n)
            .cloned()
            .collect();
        state.claimed.extend(batch.iter().cloned());
        batch
    }

    /// Drop a claim without charging a retry. Returns whether it was claimed.
    pub async fn release(&self, item: &WorkItem) -> bool {
        let released = self.state.lock().await.claimed.remove(item);
        if released {
            debug!(%item, "released claim");
        }
        released
    }

    /// Move an item into a result set. Committing twice is a no-op.
    pub async fn commit(&self, item: &WorkItem, verdict: Verdict) -> Result<Commit> {
        let mut state = self.state.lock().await;
        self.commit_locked(&mut state, item, verdict).await
    }

    /// Hand a failed item back for another attempt, or commit it with the
    /// terminal-failure verdict once its retry budget is spent.
    pub async fn requeue(&self, item: &WorkItem) -> Result<Requeue> {
        let mut state = self.state.lock().await;
        if !state.pending_set.contains(item) {
            warn!(%item, "requeue of an item that is not pending");
            return Ok(Requeue::Unknown);
        }

        let retries = {
            let count = state.retries.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if retries > self.max_retries {
            warn!(
                %item,
                attempts = retries,
                max_retries = self.max_retries,
                "retry budget exhausted, committing terminal failure"
            );
            self.commit_locked(&mut state, item, Verdict::TERMINAL_FAILURE)
                .await?;
            return Ok(Requeue::Exhausted { attempts: retries });
        }

        // Requeued items go to the back so fresh items get a turn first.
        state.claimed.remove(item);
        state.pending.retain(|p| p != item);
        state.pending.push(item.clone());

        info!(%item, retries, max_retries = self.max_retries, "requeued");
        Ok(Requeue::Pending { retries })
    }

    async fn commit_locked(
        &self,
        state: &mut QueueState,
        item: &WorkItem,
        verdict: Verdict,
    ) -> Result<Commit> {
        if let Some(existing) = state.verdict_of(item) {
            debug!(%item, %existing, requested = %verdict, "already committed");
            state.claimed.remove(item);
            return Ok(Commit::AlreadyCommitted(existing));
        }
        if !state.pending_set.contains(item) {
            warn!(%item, "commit of an item the queue never admitted");
            return Ok(Commit::Unknown);
        }

        // Result first: a crash between the two writes leaves the item in
        // both files, which `open` resolves in favour of the result.
        let result_store = match verdict {
            Verdict::Positive => &self.positive_store,
            Verdict::Negative => &self.negative_store,
        };
        let key = item.as_str().to_string();
        let result_key = key.clone();
        self.retry
            .run("append", result_store, move |s| s.append(&result_key))
            .await?;
        self.retry
            .run("remove", &self.pending_store, move |s| s.remove(&key))
            .await?;

        state.drop_pending(item);
        state.retries.remove(item);
        match verdict {
            Verdict::Positive => state.positive.insert(item.clone()),
            Verdict::Negative => state.negative.insert(item.clone()),
        };

        metrics::items_committed().add(1, &[KeyValue::new("verdict", verdict.to_string())]);
        info!(%item, %verdict, "committed");
        Ok(Commit::Committed(verdict))
    }

    pub async fn counts(&self) -> QueueCounts {
        self.state.lock().await.counts()
    }

    /// No pending items, claimed or not.
    pub async fn is_drained(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Current requeue count for an item, if it has been requeued.
    pub async fn retry_count(&self, item: &WorkItem) -> Option<u32> {
        self.state.lock().await.retries.get(item).copied()
    }

    /// Sorted snapshot of the positive result set.
    pub async fn positives(&self) -> Vec<WorkItem> {
        sorted(&self.state.lock().await.positive)
    }

    /// Sorted snapshot of the negative result set.
    pub async fn negatives(&self) -> Vec<WorkItem> {
        sorted(&self.state.lock().await.negative)
    }
}

fn parse_stored(lines: Vec<String>, store: &str) -> Vec<WorkItem> {
    lines
        .into_iter()
        .filter_map(|line| match WorkItem::parse(&line) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(store, error = %e, "dropping malformed stored item");
                None
            }
        })
        .collect()
}

fn as_keys(items: &[WorkItem]) -> Vec<String> {
    items.iter().map(|i| i.as_str().to_string()).collect()
}

fn as_key_set(items: &HashSet<WorkItem>) -> HashSet<String> {
    items.iter().map(|i| i.as_str().to_string()).collect()
}

/// What loading found that the stores should no longer hold.
#[derive(Debug, Default)]
struct Cleanup {
    /// Stored pending lines dropped: malformed, duplicate or committed.
    stale_pending: usize,
    /// Items present in both result sets.
    overlapping: usize,
}

async fn read_state(stores: &Stores, retry: RetryPolicy) -> Result<(QueueState, Cleanup)> {
    let mut state = QueueState::default();
    let mut cleanup = Cleanup::default();

    for (store, set, name) in [
        (&stores.positive, &mut state.positive, "positive"),
        (&stores.negative, &mut state.negative, "negative"),
    ] {
        let lines = retry.run("list", store, |s| s.list()).await?;
        set.extend(parse_stored(lines, name));
    }

    let before = state.negative.len();
    let positive = &state.positive;
    state.negative.retain(|item| !positive.contains(item));
    cleanup.overlapping = before - state.negative.len();

    let lines = retry.run("list", &stores.pending, |s| s.list()).await?;
    let stored = lines.len();
    for item in parse_stored(lines, "pending") {
        if state.knows(&item) {
            debug!(%item, "dropping pending duplicate or already committed item");
            continue;
        }
        state.push_pending(item);
    }
    cleanup.stale_pending = stored - state.pending.len();

    Ok((state, cleanup))
}

fn sorted(set: &HashSet<WorkItem>) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = set.iter().cloned().collect();
    items.sort();
    items
}
