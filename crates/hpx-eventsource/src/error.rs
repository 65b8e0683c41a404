//! Error handling for the EventSource client.

use thiserror::Error;

/// The main result type used throughout the crate.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for connection setup and transport operations.
///
/// Errors that happen while a session is running are never returned to the
/// caller; the driver converts them into [`SseEvent::Error`](crate::SseEvent)
/// and decides whether to reconnect.
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP protocol errors (wraps hyper::Error)
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Socket level errors (DNS, refused connections, resets)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake and configuration errors
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// A header name or value could not be encoded
    #[error("Invalid header: {message}")]
    InvalidHeader { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// The server finished the event stream
    #[error("stream ended")]
    StreamEnded,
}

impl From<http::header::InvalidHeaderValue> for TransportError {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::InvalidHeader {
            message: e.to_string(),
        }
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        Self::InvalidHeader {
            message: e.to_string(),
        }
    }
}

impl TransportError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a TLS error from a message.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(rustls::Error::General(message.into()))
    }

    /// Create a timeout error.
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an end-of-stream error.
    pub fn stream_ended() -> Self {
        Self::StreamEnded
    }
}
