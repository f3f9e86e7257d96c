//! Message-only stand-in for errors that have to cross the process boundary.
//!
//! Only the rendered message and an optional coarse kind survive. Concrete
//! error types, source chains and backtraces are dropped on the sending side.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Configuration,
    Execution,
    Encoding,
    Cancelled,
    Callback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub message: String,
    pub kind: Option<ErrorKind>,
}

impl ErrorEnvelope {
    pub fn new(message: impl Into<String>, kind: Option<ErrorKind>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn from_error(err: &anyhow::Error, kind: ErrorKind) -> Self {
        Self::new(err.to_string(), Some(kind))
    }

    /// `Ok` maps to no envelope, `Err` to an envelope carrying its message.
    pub fn wrap<T>(result: &anyhow::Result<T>, kind: ErrorKind) -> Option<Self> {
        result
            .as_ref()
            .err()
            .map(|err| Self::from_error(err, kind))
    }

    pub fn into_error(self) -> RemoteError {
        RemoteError {
            message: self.message,
            kind: self.kind,
        }
    }

    /// Inverse of [`ErrorEnvelope::wrap`] for replies without a value.
    pub fn check(envelope: Option<Self>) -> Result<(), RemoteError> {
        envelope.map_or(Ok(()), |envelope| Err(envelope.into_error()))
    }
}

/// Error rebuilt on the receiving side of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    message: String,
    kind: Option<ErrorKind>,
}

impl RemoteError {
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }
}
