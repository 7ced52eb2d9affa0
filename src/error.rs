//! Error types for gantry.

use thiserror::Error;

/// Main error type for all framework operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message length above the configured maximum.
    #[error("message too long ({len} > {max})")]
    MessageTooLong { len: u32, max: u32 },

    /// Message length below the configured minimum.
    #[error("message too short ({len} < {min})")]
    MessageTooShort { len: u32, min: u32 },

    /// Wire message id that no registration covers.
    #[error("message id {0} is not registered")]
    UnknownMessageId(String),

    /// Marshal/route called with a type that was never registered.
    #[error("message type {0} is not registered")]
    UnregisteredType(&'static str),

    /// Non-blocking chanrpc enqueue found the command channel full.
    #[error("chanrpc channel full")]
    ChannelFull,

    /// Call delivered to (or queued on) a chanrpc server that is shutting down.
    #[error("chanrpc server closed")]
    ServerClosed,

    /// Async call issued above the caller's outstanding-call capacity.
    #[error("too many calls")]
    TooManyCalls,

    /// Chanrpc call id with no registered function.
    #[error("function {0} is not registered")]
    FunctionNotFound(&'static str),

    /// Registered function arity does not match the call shape.
    #[error("function {0}: return arity mismatch")]
    ArityMismatch(&'static str),

    /// Connection closed (locally or by the peer).
    #[error("connection closed")]
    ConnectionClosed,

    /// A chanrpc handler panicked; contains the panic message.
    #[error("handler panicked: {0}")]
    Handler(String),

    /// JSON processor encode/decode failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protobuf processor decode failure.
    #[error("protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    /// WebSocket protocol or handshake failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TLS material could not be loaded or applied.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Malformed cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCronExpr(String),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
