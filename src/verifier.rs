//! Verifier: one remote check for one (item, token) pair.
//!
//! Classification is a fixed, total table from [`RawResponse`] to
//! [`Outcome`]. Anything unrecognized is `Transient`, so an unexpected
//! response leads to a retry rather than a lost item.

use std::future::Future;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Outcome, WorkItem};
use crate::pool::CapabilityToken;

/// Performs a single verification. Implementations hold no per-call state;
/// all budget bookkeeping lives in the token pool.
pub trait Verifier: Send + Sync + 'static {
    fn check(
        &self,
        item: &WorkItem,
        token: &CapabilityToken,
    ) -> impl Future<Output = Outcome> + Send;
}

/// What came back from the wire, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// An HTTP response. `body` is `None` when it was not JSON.
    Status { code: u16, body: Option<Value> },
    Timeout,
    ConnectionReset,
    /// Any other transport failure.
    Other(String),
}

/// Map a raw response to an outcome. Total: every input has exactly one
/// outcome, defaulting to `Transient`.
pub fn classify(raw: &RawResponse, exists_field: &str) -> Outcome {
    match raw {
        RawResponse::Status { code: 200, body } => {
            match body.as_ref().and_then(|b| b.get(exists_field)).and_then(Value::as_bool) {
                Some(true) => Outcome::Positive,
                Some(false) => Outcome::Negative,
                None => Outcome::Transient,
            }
        }
        RawResponse::Status { code: 401 | 403, .. } => Outcome::AuthInvalid,
        RawResponse::Status { code: 429, .. } => Outcome::RateLimited,
        RawResponse::Status { code: 500..=599, .. } => Outcome::ServerError,
        RawResponse::Status { .. } => Outcome::Transient,
        RawResponse::Timeout | RawResponse::ConnectionReset | RawResponse::Other(_) => {
            Outcome::Transient
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP verifier
// ---------------------------------------------------------------------------

/// Request shape for [`HttpVerifier`].
#[derive(Debug, Clone)]
pub struct HttpVerifierConfig {
    pub url: String,
    /// Header carrying the token.
    pub token_header: String,
    /// Prepended to the token in the header value.
    pub token_prefix: String,
    /// JSON body field holding the item.
    pub item_field: String,
    /// Boolean response field saying whether the item exists.
    pub exists_field: String,
    pub timeout: Duration,
    pub proxy: Option<SecretString>,
}

impl HttpVerifierConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token_header: "authorization".to_string(),
            token_prefix: "Bearer ".to_string(),
            item_field: "id".to_string(),
            exists_field: "exists".to_string(),
            timeout: Duration::from_secs(20),
            proxy: None,
        }
    }
}

/// Verifies items with a JSON POST to a configured endpoint.
pub struct HttpVerifier {
    client: reqwest::Client,
    config: HttpVerifierConfig,
}

impl HttpVerifier {
    pub fn new(config: HttpVerifierConfig) -> Result<Self> {
        reqwest::header::HeaderName::from_bytes(config.token_header.as_bytes()).map_err(|e| {
            Error::Config(format!("invalid token header {:?}: {e}", config.token_header))
        })?;
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(10)));
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.expose_secret())
                .map_err(|e| Error::Config(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        Ok(Self {
            client: builder.build()?,
            config,
        })
    }

    async fn send(&self, item: &WorkItem, token: &CapabilityToken) -> RawResponse {
        let mut body = serde_json::Map::new();
        body.insert(
            self.config.item_field.clone(),
            Value::String(item.as_str().to_string()),
        );

        let response = self
            .client
            .post(&self.config.url)
            .header(
                self.config.token_header.as_str(),
                format!("{}{}", self.config.token_prefix, token.expose()),
            )
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let code = response.status().as_u16();
                let body = response.json::<Value>().await.ok();
                RawResponse::Status { code, body }
            }
            Err(e) => transport_failure(&e),
        }
    }
}

impl Verifier for HttpVerifier {
    async fn check(&self, item: &WorkItem, token: &CapabilityToken) -> Outcome {
        let raw = self.send(item, token).await;
        let outcome = classify(&raw, &self.config.exists_field);
        debug!(%item, %token, ?raw, %outcome, "verification classified");
        outcome
    }
}

fn transport_failure(e: &reqwest::Error) -> RawResponse {
    if e.is_timeout() {
        RawResponse::Timeout
    } else if e.is_connect() || is_reset(e) {
        RawResponse::ConnectionReset
    } else {
        RawResponse::Other(e.to_string())
    }
}

fn is_reset(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        source = err.source();
    }
    false
}
