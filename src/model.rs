//! Core data model.
//!
//! A work item is an identifier that needs verifying. A verification attempt
//! produces an [`Outcome`]; conclusive outcomes become a [`Verdict`] and land
//! in exactly one result set.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// An opaque identifier to verify against the remote service.
///
/// Stored one per line, so an item is a non-empty string with no whitespace
/// or control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkItem(String);

impl WorkItem {
    /// Parse a stored line into a work item. Surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidItem(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WorkItem {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<WorkItem> for String {
    fn from(item: WorkItem) -> Self {
        item.0
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Classified result of one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The remote service confirmed the item exists.
    Positive,
    /// The remote service confirmed the item does not exist.
    Negative,
    /// The token was rejected. Says nothing about the item.
    AuthInvalid,
    /// The remote service asked us to slow down.
    RateLimited,
    /// Timeout, reset connection, or an unrecognized response.
    Transient,
    /// The remote service failed on its side.
    ServerError,
}

impl Outcome {
    /// The verdict for conclusive outcomes, `None` for everything retryable.
    pub fn verdict(self) -> Option<Verdict> {
        match self {
            Outcome::Positive => Some(Verdict::Positive),
            Outcome::Negative => Some(Verdict::Negative),
            Outcome::AuthInvalid
            | Outcome::RateLimited
            | Outcome::Transient
            | Outcome::ServerError => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Positive => "positive",
            Outcome::Negative => "negative",
            Outcome::AuthInvalid => "auth_invalid",
            Outcome::RateLimited => "rate_limited",
            Outcome::Transient => "transient",
            Outcome::ServerError => "server_error",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Which result set an item is committed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Positive,
    Negative,
}

impl Verdict {
    /// Default verdict for items that exhausted their retry budget.
    pub const TERMINAL_FAILURE: Verdict = Verdict::Negative;
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Positive => "positive",
            Verdict::Negative => "negative",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

/// Snapshot of queue and result sizes. The only state a completion monitor
/// needs to see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Pending and not currently claimed.
    pub pending: usize,
    pub claimed: usize,
    pub positive: usize,
    pub negative: usize,
}

impl QueueCounts {
    pub fn committed(&self) -> usize {
        self.positive + self.negative
    }

    /// Every item ever admitted, given the one-directional lifecycle.
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.committed()
    }

    /// Queue drained and at least one result exported.
    ///
    /// Empty can be transient if more items are ingested later, so monitors
    /// should compare counts rather than latch on this.
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.claimed == 0 && self.committed() > 0
    }
}
