//! # verifyq
//!
//! Verifies a list of identifiers against a remote service that grants a
//! bounded number of checks per capability token.
//!
//! Provides a durable deduplicated work queue, a budgeted token pool, a
//! total outcome classifier, and a batch scheduler with adaptive backoff,
//! all observable through tracing and OpenTelemetry.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod pool;
pub mod queue;
pub mod storage;
pub mod telemetry;
pub mod verifier;
