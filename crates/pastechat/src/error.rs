use thiserror::Error;

use crate::session::SessionState;

/// A pasted blob that does not have the expected discriminated shape.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed exchange text: {0}")]
    MalformedInput(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("{operation} is not allowed while the session is {state:?}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("malformed remote description: {0}")]
    MalformedRemoteDescription(#[source] CodecError),
    #[error("rejected by transport: {0}")]
    RejectedByTransport(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Failures reported by a [`TransportCapability`](crate::transport::TransportCapability).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport rejected input: {0}")]
    Rejected(String),
    #[error("transport channel closed")]
    ChannelClosed,
}

/// Everything a caller-facing operation can fail with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Failures of a [`SessionHandle`](crate::handle::SessionHandle) request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("session task has stopped")]
    Stopped,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("data channel label must not be empty")]
    EmptyLabel,
    #[error("ice server entry has no urls")]
    MissingIceUrls,
    #[error("unsupported ice server url {0}")]
    UnsupportedIceUrl(String),
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("global subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

pub(crate) fn to_rejected<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Rejected(err.to_string())
}
