//! Error types for calcwire.

use thiserror::Error;

/// Main error type for transport and protocol operations.
///
/// Call outcomes visible to callers are expressed as [`Status`](crate::Status);
/// `RpcError` covers everything that goes wrong underneath a call.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid frame, wrong flags, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No route registered for the given method ID.
    #[error("Unknown method ID: {0}")]
    UnknownMethod(u16),

    /// The direction was already completed or failed.
    #[error("Call {0} is closed")]
    CallClosed(u32),

    /// The call's deadline passed before the frame could be sent.
    #[error("Call {0} exceeded its deadline")]
    DeadlineExceeded(u32),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
