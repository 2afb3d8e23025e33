//! Token pool: the capability tokens currently usable, how much of each
//! token's budget is spent or reserved, and retirement.
//!
//! Tokens arrive through the durable token store, written by an external
//! producer at arbitrary times. The pool only reads that store (on
//! [`TokenPool::refresh`]) and removes retired tokens from it.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use opentelemetry::KeyValue;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage::{KeySetStore, RetryPolicy};
use crate::telemetry::metrics;

/// Default per-token usage budget, drawn uniformly at admission.
pub const DEFAULT_USAGE_LIMITS: RangeInclusive<u32> = 5..=7;

/// An opaque authorization artifact. Formatting shows only a short prefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CapabilityToken(String);

impl CapabilityToken {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::Other("malformed capability token".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The raw token, for placing on the wire.
    pub fn expose(&self) -> &str {
        &self.0
    }

    fn prefix(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for CapabilityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", self.prefix())
    }
}

impl std::fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CapabilityToken({}...)", self.prefix())
    }
}

/// One reserved use of a token, held by a single in-flight verification.
///
/// Settle it with exactly one of [`TokenPool::record_success`],
/// [`TokenPool::record_invalid`] or [`TokenPool::release`].
#[derive(Debug)]
#[must_use = "a lease holds a reservation until it is settled"]
pub struct TokenLease {
    token: CapabilityToken,
}

impl TokenLease {
    pub fn token(&self) -> &CapabilityToken {
        &self.token
    }
}

/// Result of admitting tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(usize),
    /// Nothing new arrived and the pool has no tokens left.
    Exhausted,
}

/// Token state after a lease was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Active { usage: u32, limit: u32 },
    Retired,
    /// The token had already been retired by another worker.
    Stale,
}

#[derive(Debug)]
struct TokenSlot {
    token: CapabilityToken,
    usage: u32,
    limit: u32,
    in_flight: u32,
}

impl TokenSlot {
    fn has_budget(&self) -> bool {
        self.usage + self.in_flight < self.limit
    }
}

#[derive(Default)]
struct PoolState {
    slots: Vec<TokenSlot>,
    /// Next slot to try; round-robin, not least-used.
    cursor: usize,
    /// Retired this process lifetime. Never readmitted.
    retired: HashSet<CapabilityToken>,
}

impl PoolState {
    fn position(&self, token: &CapabilityToken) -> Option<usize> {
        self.slots.iter().position(|s| &s.token == token)
    }
}

/// Budgeted pool of capability tokens.
pub struct TokenPool {
    store: Arc<dyn KeySetStore>,
    retry: RetryPolicy,
    limits: RangeInclusive<u32>,
    state: Mutex<PoolState>,
}

impl TokenPool {
    pub fn new(store: Arc<dyn KeySetStore>, limits: RangeInclusive<u32>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            limits,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Reserve one use of the next token in round-robin order.
    ///
    /// `None` means no token has spare budget right now. Callers treat that
    /// as backpressure and wait, never as a failure.
    pub async fn acquire(&self) -> Option<TokenLease> {
        let mut state = self.state.lock().await;
        let len = state.slots.len();
        for offset in 0..len {
            let idx = (state.cursor + offset) % len;
            let slot = &mut state.slots[idx];
            if slot.has_budget() {
                slot.in_flight += 1;
                let token = slot.token.clone();
                state.cursor = (idx + 1) % len;
                debug!(%token, "token leased");
                return Some(TokenLease { token });
            }
        }
        None
    }

    /// Credit a conclusive verification. Retires the token once its budget
    /// is spent, whatever the outcome was.
    pub async fn record_success(&self, lease: TokenLease) -> Result<Settled> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(&lease.token) else {
            return Ok(Settled::Stale);
        };
        let slot = &mut state.slots[idx];
        slot.in_flight = slot.in_flight.saturating_sub(1);
        slot.usage += 1;
        let (usage, limit) = (slot.usage, slot.limit);
        debug!(token = %lease.token, usage, limit, "token credited");
        if usage >= limit {
            self.retire_locked(&mut state, &lease.token, "exhausted")
                .await?;
            return Ok(Settled::Retired);
        }
        Ok(Settled::Active { usage, limit })
    }

    /// Retire the token immediately; the remote service rejected it.
    pub async fn record_invalid(&self, lease: TokenLease) -> Result<Settled> {
        let mut state = self.state.lock().await;
        if self.retire_locked(&mut state, &lease.token, "invalid").await? {
            Ok(Settled::Retired)
        } else {
            Ok(Settled::Stale)
        }
    }

    /// Return a lease without crediting or blaming the token.
    pub async fn release(&self, lease: TokenLease) -> Settled {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(&lease.token) else {
            return Settled::Stale;
        };
        let slot = &mut state.slots[idx];
        slot.in_flight = slot.in_flight.saturating_sub(1);
        Settled::Active {
            usage: slot.usage,
            limit: slot.limit,
        }
    }

    /// Add tokens to the pool, each with a fresh random usage limit. Tokens
    /// already in the pool or retired earlier are ignored.
    pub async fn admit<I, S>(&self, tokens: I) -> Admission
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock().await;
        let mut admitted = 0;
        for raw in tokens {
            let token = match CapabilityToken::parse(raw.as_ref()) {
                Ok(token) => token,
                Err(_) => {
                    warn!("dropping malformed token");
                    continue;
                }
            };
            if state.retired.contains(&token) || state.position(&token).is_some() {
                continue;
            }
            let limit = self.draw_limit();
            debug!(%token, limit, "token admitted");
            state.slots.push(TokenSlot {
                token,
                usage: 0,
                limit,
                in_flight: 0,
            });
            admitted += 1;
        }

        if admitted > 0 {
            info!(admitted, pool = state.slots.len(), "tokens admitted");
            Admission::Admitted(admitted)
        } else if state.slots.is_empty() {
            Admission::Exhausted
        } else {
            Admission::Admitted(0)
        }
    }

    /// Admit whatever the external producer has appended to the token store.
    pub async fn refresh(&self) -> Result<Admission> {
        let tokens = self.retry.run("list", &self.store, |s| s.list()).await?;
        Ok(self.admit(tokens).await)
    }

    /// Append a token to the durable store. Producer side of the token feed.
    pub async fn feed(&self, token: &str) -> Result<()> {
        let token = CapabilityToken::parse(token)?;
        let key = token.expose().to_string();
        self.retry
            .run("append", &self.store, move |s| s.append(&key))
            .await?;
        info!(%token, "token appended to store");
        Ok(())
    }

    /// Tokens not yet retired.
    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.slots.is_empty()
    }

    /// Tokens that could be leased right now.
    pub async fn available(&self) -> usize {
        let state = self.state.lock().await;
        state.slots.iter().filter(|s| s.has_budget()).count()
    }

    /// Current `(usage, limit)` of a token still in the pool.
    pub async fn usage(&self, token: &CapabilityToken) -> Option<(u32, u32)> {
        let state = self.state.lock().await;
        state
            .position(token)
            .map(|idx| (state.slots[idx].usage, state.slots[idx].limit))
    }

    fn draw_limit(&self) -> u32 {
        rand::rng().random_range(self.limits.clone())
    }

    /// Remove a token from the pool and the store. Returns `false` if it was
    /// already retired.
    async fn retire_locked(
        &self,
        state: &mut PoolState,
        token: &CapabilityToken,
        reason: &'static str,
    ) -> Result<bool> {
        let Some(idx) = state.position(token) else {
            return Ok(false);
        };
        let key = token.expose().to_string();
        self.retry
            .run("remove", &self.store, move |s| s.remove(&key))
            .await?;

        state.slots.remove(idx);
        if idx < state.cursor {
            state.cursor -= 1;
        }
        if state.cursor >= state.slots.len() {
            state.cursor = 0;
        }
        state.retired.insert(token.clone());

        metrics::tokens_retired().add(1, &[KeyValue::new("reason", reason)]);
        match reason {
            "invalid" => warn!(%token, remaining = state.slots.len(), "token rejected, retired"),
            _ => info!(%token, remaining = state.slots.len(), "token budget spent, retired"),
        }
        Ok(true)
    }
}
