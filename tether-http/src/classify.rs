//! Mapping of transport failures onto [`tether_core::Error`].
//!
//! Classification happens here, where the reqwest error is still typed, so
//! the resilience layer never inspects messages.

use reqwest::{Response, StatusCode};
use std::time::Duration;
use tether_core::{Error, Result};

/// Classify a reqwest failure.
///
/// `timeout` is the deadline the request ran under and is reported on
/// [`Error::Timeout`].
pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        Error::Timeout(timeout)
    } else if let Some(status) = err.status() {
        Error::http(status.as_u16(), err.to_string())
    } else if err.is_decode() {
        Error::Serialization(err.to_string())
    } else if err.is_builder() {
        Error::Validation(err.to_string())
    } else {
        // Connect, request and body errors all mean the service was not
        // reached or the exchange broke off.
        Error::Network(err.to_string())
    }
}

/// Pass success responses through and turn every other status into an error
/// carrying the response body.
///
/// `422 Unprocessable Entity` becomes [`Error::Validation`].
pub async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("unknown status").to_string()
    } else {
        body
    };

    if status == StatusCode::UNPROCESSABLE_ENTITY {
        Err(Error::Validation(message))
    } else {
        Err(Error::http(status.as_u16(), message))
    }
}
