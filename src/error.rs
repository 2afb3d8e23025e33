//! Error types for verifyq.
//!
//! Per-item verification failures are never errors; they are outcomes the
//! scheduler absorbs. Only storage and configuration failures surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage {op} failed after {attempts} attempt(s): {source}")]
    Storage {
        op: &'static str,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid item {0:?}")]
    InvalidItem(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
