//! Streaming error taxonomy.
//!
//! Only configuration and transient network errors ever reach a caller.
//! Protocol desync, undecodable frames and cancellation are recovered
//! inside the engine and never produce a `StreamError`.

use thiserror::Error;

/// Error delivered to a session's error callback.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("empty stream url")]
    EmptySource,

    #[error("invalid stream url '{url}': {reason}")]
    InvalidSource { url: String, reason: String },

    #[error("packaged decoder unavailable: {0}")]
    DecoderUnavailable(String),

    #[error("stream request failed with HTTP {0}")]
    HttpStatus(u16),

    #[error("stream connection failed: {0}")]
    Connect(String),

    #[error("stream read failed: {0}")]
    Read(String),

    #[error("playback failed: {0}")]
    Playback(String),
}

/// Coarse classification used to decide whether a caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad locator or missing backend. Retrying without changes will fail again.
    Configuration,
    /// Network or playback failure. `reconnect` may succeed.
    Transient,
}

impl StreamError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::EmptySource
            | StreamError::InvalidSource { .. }
            | StreamError::DecoderUnavailable(_) => ErrorCategory::Configuration,
            StreamError::HttpStatus(_)
            | StreamError::Connect(_)
            | StreamError::Read(_)
            | StreamError::Playback(_) => ErrorCategory::Transient,
        }
    }

    pub(crate) fn from_ureq(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => StreamError::HttpStatus(code),
            ureq::Error::Transport(transport) => StreamError::Connect(transport.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_transient() {
        assert_eq!(StreamError::EmptySource.category(), ErrorCategory::Configuration);
        assert_eq!(
            StreamError::DecoderUnavailable("no backend".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(StreamError::HttpStatus(503).category(), ErrorCategory::Transient);
        assert_eq!(
            StreamError::Read("reset by peer".into()).category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn status_error_message_includes_code() {
        assert_eq!(
            StreamError::HttpStatus(401).to_string(),
            "stream request failed with HTTP 401"
        );
    }
}
