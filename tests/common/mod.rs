//! Shared fixtures: a scripted verifier and fast scheduler tuning.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use verifyq::backoff::AdaptiveDelay;
use verifyq::config::Tuning;
use verifyq::engine::SchedulerConfig;
use verifyq::model::{Outcome, WorkItem};
use verifyq::pool::CapabilityToken;
use tokio::time::Instant;
use verifyq::verifier::Verifier;

/// Returns scripted outcomes per item, then `fallback` once a script runs out.
pub struct ScriptedVerifier {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    fallback: Outcome,
    latency: Duration,
    calls: Mutex<Vec<(String, String)>>,
    started: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedVerifier {
    pub fn new(fallback: Outcome) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, item: &str, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(item.to_string(), outcomes.into_iter().collect());
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every `(item, token)` pair checked, in completion order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, item: &str) -> usize {
        self.calls().iter().filter(|(i, _)| i == item).count()
    }

    /// When each check began, in start order.
    pub fn start_times(&self) -> Vec<(String, Instant)> {
        self.started.lock().unwrap().clone()
    }
}

impl Verifier for ScriptedVerifier {
    async fn check(&self, item: &WorkItem, token: &CapabilityToken) -> Outcome {
        self.started
            .lock()
            .unwrap()
            .push((item.to_string(), Instant::now()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push((item.to_string(), token.expose().to_string()));
        self.scripts
            .lock()
            .unwrap()
            .get_mut(item.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.fallback)
    }
}

/// Tuning with a fixed token limit.
pub fn tuning(batch_size: usize, max_retries: u32, token_limit: u32) -> Tuning {
    Tuning {
        batch_size,
        max_retries,
        token_limit_min: token_limit,
        token_limit_max: token_limit,
        ..Tuning::default()
    }
}

/// Scheduler timings short enough for paused-clock tests.
pub fn fast_scheduler(batch_size: usize) -> SchedulerConfig {
    SchedulerConfig {
        batch_size,
        token_poll_interval: Duration::from_secs(1),
        token_wait_ceiling: Duration::from_secs(30),
        delay: AdaptiveDelay {
            healthy: Duration::from_millis(10),
            degraded: Duration::from_millis(50),
            stalled: Duration::from_millis(100),
        },
        failure_threshold: 1000,
        cooldown: Duration::from_secs(60),
    }
}

pub fn item(raw: &str) -> WorkItem {
    WorkItem::parse(raw).unwrap()
}

pub fn token(raw: &str) -> CapabilityToken {
    CapabilityToken::parse(raw).unwrap()
}
