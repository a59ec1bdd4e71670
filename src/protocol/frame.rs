//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use calcwire::protocol::{Frame, FrameKind, Header};
//! use bytes::Bytes;
//!
//! let header = Header::for_kind(1, FrameKind::Message, true, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.call_id(), 42);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{FrameKind, Header, HEADER_SIZE};
use crate::error::Result;

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the method ID.
    #[inline]
    pub fn method_id(&self) -> u16 {
        self.header.method_id
    }

    /// Get the call ID.
    #[inline]
    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    /// Frame kind (open, message, end, error, cancel).
    #[inline]
    pub fn kind(&self) -> Result<FrameKind> {
        self.header.kind()
    }

    /// Check if direction is callee to caller.
    #[inline]
    pub fn is_to_caller(&self) -> bool {
        self.header.is_to_caller()
    }
}

/// Build a complete frame as a single byte vector.
///
/// The writer task uses vectored writes instead; this is for tests and
/// one-off encodings.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    #[test]
    fn test_frame_accessors() {
        let header = Header::new(3, flags::TO_CALLER | flags::END, 9, 0);
        let frame = Frame::new(header, Bytes::new());

        assert_eq!(frame.method_id(), 3);
        assert_eq!(frame.call_id(), 9);
        assert_eq!(frame.kind().unwrap(), FrameKind::End);
        assert!(frame.is_to_caller());
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_build_frame_layout() {
        let header = Header::for_kind(1, FrameKind::Message, false, 42, 5);
        let bytes = build_frame(&header, b"hello");

        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        assert_eq!(&bytes[..HEADER_SIZE], &header.encode());
        assert_eq!(&bytes[HEADER_SIZE..], b"hello");
    }
}
