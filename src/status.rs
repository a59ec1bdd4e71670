//! Structured call failures.
//!
//! A [`Status`] is what a callee attaches to its direction of a call in place
//! of a response. It travels on the wire as the payload of an `ERROR` frame.
//!
//! # Example
//!
//! ```
//! use calcwire::{Code, Status};
//!
//! let status = Status::invalid_argument("number sent: -1");
//! assert_eq!(status.code(), Code::InvalidArgument);
//! assert!(status.message().contains("-1"));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::MsgPackCodec;
use crate::error::RpcError;

/// Failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// The caller abandoned the call.
    Cancelled,
    /// Unclassified failure.
    Unknown,
    /// Caller-supplied input violates a precondition.
    InvalidArgument,
    /// The caller's deadline elapsed before the call completed.
    DeadlineExceeded,
    /// Too many concurrent calls.
    ResourceExhausted,
    /// No handler is registered for the method.
    Unimplemented,
    /// Broken invariant inside the framework.
    Internal,
    /// The connection is gone.
    Unavailable,
}

impl Code {
    /// Stable lowercase name, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::ResourceExhausted => "resource_exhausted",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure outcome: category plus human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Create a status with the given code and description.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// Failure category.
    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Human-readable description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Decode the payload of an `ERROR` frame. A payload that is not a
    /// valid status becomes `Unknown`.
    pub(crate) fn from_wire(payload: &[u8]) -> Self {
        MsgPackCodec::decode(payload).unwrap_or_else(|e| {
            Status::new(Code::Unknown, format!("undecodable failure payload: {e}"))
        })
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Io(_) | RpcError::ConnectionClosed => Status::unavailable(err.to_string()),
            RpcError::UnknownMethod(_) => Status::unimplemented(err.to_string()),
            RpcError::CallClosed(_) => Status::cancelled(err.to_string()),
            RpcError::DeadlineExceeded(_) => Status::deadline_exceeded(err.to_string()),
            RpcError::MsgPackEncode(_)
            | RpcError::MsgPackDecode(_)
            | RpcError::Protocol(_)
            | RpcError::BackpressureTimeout => Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_message() {
        let status = Status::invalid_argument("number sent: -4");
        assert_eq!(status.to_string(), "invalid_argument: number sent: -4");
    }

    #[test]
    fn test_status_survives_codec() {
        let status = Status::deadline_exceeded("too slow");
        let bytes = MsgPackCodec::encode(&status).unwrap();
        let decoded: Status = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_from_wire_falls_back_to_unknown() {
        let status = Status::from_wire(&[0xc1]);
        assert_eq!(status.code(), Code::Unknown);

        let bytes = MsgPackCodec::encode(&Status::internal("boom")).unwrap();
        assert_eq!(Status::from_wire(&bytes), Status::internal("boom"));
    }

    #[test]
    fn test_from_rpc_error() {
        assert_eq!(Status::from(RpcError::ConnectionClosed).code(), Code::Unavailable);
        assert_eq!(Status::from(RpcError::UnknownMethod(9)).code(), Code::Unimplemented);
        assert_eq!(
            Status::from(RpcError::Protocol("bad flags".to_string())).code(),
            Code::Internal
        );
        assert_eq!(Status::from(RpcError::CallClosed(3)).code(), Code::Cancelled);
    }
}
