//! Error types for the relay
//!
//! Errors fall into three groups:
//! - [`FramingError`]: the byte stream is corrupt, the connection must close
//! - [`ProtocolError`]: a well-framed request is semantically invalid, answered
//!   with `status: error` and the session continues
//! - [`RelayError`]: transport failures seen by an outbound connection or the
//!   proxy (lost connection, timeout, backend unavailable)

use std::time::Duration;

/// Failures decoding the newline-delimited JSON stream.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A frame grew past the configured maximum before its delimiter arrived.
    #[error("frame exceeds maximum size of {max_bytes} bytes")]
    FrameTooLarge { max_bytes: usize },

    /// The frame is not valid JSON (or not valid UTF-8).
    #[error("malformed JSON frame: {reason}")]
    MalformedJson { reason: String },

    /// Valid JSON that does not match the message envelope (object with a string `id`).
    #[error("invalid message envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A well-framed request whose payload cannot be served.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown request kind '{0}'")]
    UnknownKind(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{operator}' expects {expected} operand(s), got {actual}")]
    Arity {
        operator: String,
        expected: &'static str,
        actual: usize,
    },

    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

/// Transport and availability failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("connection lost")]
    ConnectionLost,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("correlation id '{0}' is already in flight on this connection")]
    DuplicateId(String),

    #[error("service unavailable")]
    ServiceUnavailable,
}

impl RelayError {
    /// Whether the proxy should treat this failure as a backend outage.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Connect { .. } | RelayError::ConnectionLost | RelayError::Timeout(_)
        )
    }
}
