use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("inbound message has no EventType")]
    MissingEventType,
    #[error("unknown EventType {0:?}")]
    UnknownEventType(String),
    #[error("{kind} message has no EventPayload")]
    MissingPayload { kind: String },
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("method return for {key} without a pending call")]
    UnexpectedReturn { key: String },
    #[error("viewable property carries a non-id value: {0}")]
    InvalidViewModelId(Value),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("transport shut down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("view model id must not be empty")]
    EmptyViewModelId,
    #[error("cannot send a null message")]
    NullMessage,
    #[error("{class} has no method {method:?}")]
    UnknownMethod { class: String, method: String },
    #[error("method {method:?} returns {found}, not {expected}")]
    WrongReturnKind {
        method: String,
        expected: String,
        found: String,
    },
    #[error("property accessor {method:?} takes no arguments, got {arity}")]
    ParameterizedAccessor { method: String, arity: usize },
    #[error("property behind {accessor:?} could not be resolved")]
    Unresolved { accessor: String },
    #[error("session disconnected before the request completed")]
    Disconnected,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
