//! Secret handling utilities.
//!
//! Re-exports secrecy types and redacts credentials embedded in URLs before
//! they reach a log line.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a URL with any `user:password@` section replaced by `***@`.
pub fn redact_url(secret: &SecretString) -> String {
    let url = secret.expose_secret();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    let host = match rest.rsplit_once('@') {
        Some((_, host)) => format!("***@{host}"),
        None => rest.to_string(),
    };
    match scheme {
        Some(scheme) => format!("{scheme}://{host}"),
        None => host,
    }
}
