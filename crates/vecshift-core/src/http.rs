//! HTTP helpers for REST-based backends.

use reqwest::Client;
use std::time::Duration;

use crate::error::Error;

/// Default HTTP timeout for REST backends.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates a configured HTTP client with request and connect timeouts.
#[must_use]
pub fn create_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Maps a non-success HTTP status to an [`Error`].
pub fn handle_http_error(status_code: u16, body: &str, backend: &str) -> Error {
    match status_code {
        429 => Error::RateLimit(60),
        401 | 403 => Error::Authentication(format!("{backend} auth failed: {body}")),
        _ => Error::Http(format!("{backend} error {status_code}: {body}")),
    }
}
