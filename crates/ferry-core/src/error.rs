use ferry_plugin_sdk::{Type, TypeParseError};
use thiserror::Error;

use crate::envelope::RemoteError;

/// Failures of the connection itself. Never retried by this crate.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("frame of {0} bytes exceeds the transport limit")]
    FrameTooLarge(usize),

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed")]
    ConnectionClosed,

    /// Error string reported by the remote side in place of a reply.
    #[error("{0}")]
    ServerError(String),

    #[error("method `{0}` is not of the form <endpoint>.<method>")]
    MalformedMethod(String),

    #[error("can't find service `{0}`")]
    UnknownService(String),

    #[error("can't find method `{0}`")]
    UnknownMethod(String),

    #[error("service `{0}` is already registered")]
    DuplicateService(String),

    #[error("server already started; its registry is closed")]
    ServerStarted,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("cbor encode: {0}")]
    CborEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("cbor decode: {0}")]
    CborDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("type `{0}` is not registered with the legacy codec")]
    Unregistered(String),

    #[error("decoded value has type {found}, expected {expected}")]
    TypeMismatch { expected: Type, found: Type },

    #[error(transparent)]
    TypeExpr(#[from] TypeParseError),

    #[error("malformed spec message: {0}")]
    MalformedSpec(String),
}

/// Errors surfaced by host-side stubs.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{method} failed: {source}")]
    Transport {
        method: String,
        #[source]
        source: TransportError,
    },

    #[error("configuration value {index} could not be encoded: {source}")]
    Configuration {
        index: usize,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Domain error reported by the plugin, message preserved verbatim.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("callback server: {0}")]
    CallbackServer(#[source] TransportError),
}

impl BridgeError {
    pub fn transport(method: impl Into<String>, source: TransportError) -> Self {
        BridgeError::Transport {
            method: method.into(),
            source,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, BridgeError::Transport { .. })
    }
}
