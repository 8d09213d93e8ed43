//! Error types for the image pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the image pipeline
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Connection-level failure talking to the remote host
    #[error("HTTP transport error for {locator}: {source}")]
    Transport {
        locator: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request exceeded the pool's fixed timeout
    #[error("Request for {locator} timed out after {timeout:?}")]
    Timeout { locator: String, timeout: Duration },

    /// Remote host answered with a non-success status
    #[error("Unexpected HTTP status {status} for {locator}")]
    HttpStatus { locator: String, status: u16 },

    /// Locator could not be turned into a fetchable URL
    #[error("Invalid resource locator: {0}")]
    InvalidLocator(String),

    // =========================================================================
    // Decode Errors
    // =========================================================================
    /// Bytes could not be decoded into a bitmap
    #[error("Failed to decode image for {locator}: {reason}")]
    Decode { locator: String, reason: String },

    /// Image codec error
    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Durable cache store failure
    #[error("Durable store error: {0}")]
    DurableStore(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure outcome shared by every requester attached to one fetch.
///
/// [`Error`] is not `Clone` (it wraps `reqwest::Error` and `std::io::Error`), so the
/// coordinator reduces it to this value before publishing it to joiners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// The request timed out
    #[error("request timed out")]
    Timeout,

    /// Connection or protocol failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("HTTP status {0}")]
    Status(u16),

    /// Downsampling and direct decode both failed
    #[error("undecodable image data")]
    Decode,

    /// The fetch task went away without producing a result
    #[error("fetch abandoned before completion")]
    Abandoned,
}

impl From<&Error> for FetchFailure {
    fn from(error: &Error) -> Self {
        match error {
            Error::Timeout { .. } => FetchFailure::Timeout,
            Error::HttpStatus { status, .. } => FetchFailure::Status(*status),
            Error::Decode { .. } | Error::Image(_) => FetchFailure::Decode,
            other => FetchFailure::Transport(other.to_string()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_timeout_failure() {
        let err = Error::Timeout {
            locator: "https://img/a.jpg".to_string(),
            timeout: Duration::from_secs(15),
        };
        assert_eq!(FetchFailure::from(&err), FetchFailure::Timeout);
        assert!(err.to_string().contains("timed out after 15s"));
    }

    #[test]
    fn test_status_maps_to_status_failure() {
        let err = Error::HttpStatus {
            locator: "https://img/a.jpg".to_string(),
            status: 404,
        };
        assert_eq!(FetchFailure::from(&err), FetchFailure::Status(404));
    }

    #[test]
    fn test_decode_maps_to_decode_failure() {
        let err = Error::Decode {
            locator: "https://img/a.jpg".to_string(),
            reason: "truncated".to_string(),
        };
        assert_eq!(FetchFailure::from(&err), FetchFailure::Decode);
    }

    #[test]
    fn test_other_errors_map_to_transport() {
        let err = Error::InvalidLocator("not a url".to_string());
        match FetchFailure::from(&err) {
            FetchFailure::Transport(msg) => assert!(msg.contains("not a url")),
            other => panic!("unexpected failure: {other:?}"),
        }
    }
}
