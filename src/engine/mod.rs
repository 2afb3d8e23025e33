//! Verification engine: the work queue and token pool opened together over
//! one set of stores, and the scheduler loop that drives them.

pub mod scheduler;

pub use scheduler::{RunSummary, Scheduler, SchedulerConfig};

use std::path::Path;
use std::sync::Arc;

use crate::config::Tuning;
use crate::error::Result;
use crate::pool::TokenPool;
use crate::queue::WorkQueue;
use crate::storage::{RetryPolicy, Stores};
use crate::verifier::Verifier;

/// The queue and pool, sharing one set of stores.
pub struct Engine {
    pub queue: Arc<WorkQueue>,
    pub pool: Arc<TokenPool>,
    tuning: Tuning,
}

impl Engine {
    /// Open an engine over arbitrary stores.
    pub async fn open(stores: Stores, tuning: Tuning) -> Result<Self> {
        let retry = RetryPolicy::default();
        let queue = WorkQueue::open(&stores, tuning.max_retries, retry).await?;
        let pool = TokenPool::new(Arc::clone(&stores.tokens), tuning.token_limits(), retry);
        Ok(Self {
            queue: Arc::new(queue),
            pool: Arc::new(pool),
            tuning,
        })
    }

    /// Open an engine backed by files under `dir`.
    pub async fn open_dir(dir: &Path, tuning: Tuning) -> Result<Self> {
        Self::open(Stores::files(dir)?, tuning).await
    }

    /// Create an engine with in-memory stores (for testing).
    pub async fn in_memory(tuning: Tuning) -> Result<Self> {
        Self::open(Stores::in_memory(), tuning).await
    }

    /// A scheduler over this engine's queue and pool.
    pub fn scheduler<V: Verifier>(&self, verifier: Arc<V>) -> Scheduler<V> {
        Scheduler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            verifier,
            self.tuning.scheduler(),
        )
    }
}
