//! Relay errors

use thiserror::Error;

/// Errors raised while handling one inbound stream.
///
/// All of them stay inside the task handling that stream; the dispatcher
/// turns them into an [`Outcome`](crate::Outcome).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed request: {0}")]
    Parse(String),

    #[error("No target for {0:?}")]
    NoTarget(String),

    #[error("Failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("Handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl RelayError {
    pub(crate) fn parse(reason: impl Into<String>) -> Self {
        RelayError::Parse(reason.into())
    }

    pub(crate) fn unexpected_eof(context: &str) -> Self {
        RelayError::Stream(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            context.to_string(),
        ))
    }
}
