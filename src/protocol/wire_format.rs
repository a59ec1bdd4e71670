//! Wire format encoding and decoding.
//!
//! Implements the 11-byte header format:
//! ```text
//! ┌──────────┬───────┬──────────┬──────────┐
//! │ Method ID│ Flags │ Call ID  │ Length   │
//! │ 2 bytes  │ 1 byte│ 4 bytes  │ 4 bytes  │
//! │ uint16 BE│       │ uint32 BE│ uint32 BE│
//! └──────────┴───────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.
//!
//! Every frame belongs to one direction of one call. The caller opens a call
//! with an `OPEN` frame, then both sides send message frames and terminate
//! their own direction with `END` (normal completion) or `ERROR` (failure,
//! payload is an encoded [`Status`](crate::Status)). The caller may abandon
//! the call at any time with `CANCEL`.

use crate::error::{Result, RpcError};

/// Header size in bytes (fixed, exactly 11).
pub const HEADER_SIZE: usize = 11;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved method ID (never use).
pub const RESERVED_METHOD_ID: u16 = 0;

/// Flag constants for the protocol.
pub mod flags {
    /// Direction: callee to caller (1) or caller to callee (0).
    pub const TO_CALLER: u8 = 0b0000_0001;
    /// First caller frame of a call.
    pub const OPEN: u8 = 0b0000_0010;
    /// Sender completed its direction.
    pub const END: u8 = 0b0000_0100;
    /// Sender failed its direction; payload is a Status.
    pub const ERROR: u8 = 0b0000_1000;
    /// Caller abandoned the call.
    pub const CANCEL: u8 = 0b0001_0000;

    /// Reserved bits mask (bits 5-7).
    pub const RESERVED_MASK: u8 = 0b1110_0000;

    /// Bits that select the frame kind; at most one may be set.
    pub const KIND_MASK: u8 = OPEN | END | ERROR | CANCEL;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// What a frame means for the call it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Caller starts a call.
    Open,
    /// One message in the sender's direction.
    Message,
    /// Sender completed its direction.
    End,
    /// Sender failed its direction.
    Error,
    /// Caller abandoned the call.
    Cancel,
}

impl FrameKind {
    /// Flag bits for this kind (without the direction bit).
    #[inline]
    pub fn bits(self) -> u8 {
        match self {
            FrameKind::Open => flags::OPEN,
            FrameKind::Message => 0,
            FrameKind::End => flags::END,
            FrameKind::Error => flags::ERROR,
            FrameKind::Cancel => flags::CANCEL,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Method identifier (1-65535, 0 reserved).
    pub method_id: u16,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Call identifier, allocated by the caller.
    pub call_id: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(method_id: u16, flags: u8, call_id: u32, payload_length: u32) -> Self {
        Self {
            method_id,
            flags,
            call_id,
            payload_length,
        }
    }

    /// Build the header for a frame of the given kind and direction.
    pub fn for_kind(
        method_id: u16,
        kind: FrameKind,
        to_caller: bool,
        call_id: u32,
        payload_length: u32,
    ) -> Self {
        let direction = if to_caller { flags::TO_CALLER } else { 0 };
        Self::new(method_id, kind.bits() | direction, call_id, payload_length)
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use calcwire::protocol::{Header, flags};
    ///
    /// let header = Header::new(1, flags::OPEN, 42, 0);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 11);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.method_id.to_be_bytes());
        buf[2] = self.flags;
        buf[3..7].copy_from_slice(&self.call_id.to_be_bytes());
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            method_id: u16::from_be_bytes([buf[0], buf[1]]),
            flags: buf[2],
            call_id: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            payload_length: u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Method ID is not 0 (reserved)
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    /// - At most one kind bit is set, and callees never send OPEN or CANCEL
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.method_id == RESERVED_METHOD_ID {
            return Err(RpcError::Protocol("Method ID 0 is reserved".to_string()));
        }

        if self.payload_length > max_payload_size {
            return Err(RpcError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(RpcError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        let kind = self.kind()?;
        if self.is_to_caller() && matches!(kind, FrameKind::Open | FrameKind::Cancel) {
            return Err(RpcError::Protocol(format!(
                "{kind:?} frame is only valid from caller to callee"
            )));
        }

        Ok(())
    }

    /// Frame kind encoded in the flags.
    ///
    /// Fails if more than one kind bit is set.
    pub fn kind(&self) -> Result<FrameKind> {
        match self.flags & flags::KIND_MASK {
            0 => Ok(FrameKind::Message),
            flags::OPEN => Ok(FrameKind::Open),
            flags::END => Ok(FrameKind::End),
            flags::ERROR => Ok(FrameKind::Error),
            flags::CANCEL => Ok(FrameKind::Cancel),
            other => Err(RpcError::Protocol(format!(
                "Conflicting frame kind bits: {other:#010b}"
            ))),
        }
    }

    /// Check if direction is callee to caller.
    #[inline]
    pub fn is_to_caller(&self) -> bool {
        flags::has_flag(self.flags, flags::TO_CALLER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(4, flags::TO_CALLER | flags::END, 42, 0);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(0x0102, 0x03, 0x04050607, 0x08090A0B);
        let bytes = header.encode();

        assert_eq!(bytes, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[0u8; HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn test_for_kind_sets_direction() {
        let to_callee = Header::for_kind(2, FrameKind::End, false, 7, 0);
        assert!(!to_callee.is_to_caller());
        assert_eq!(to_callee.kind().unwrap(), FrameKind::End);

        let to_caller = Header::for_kind(2, FrameKind::Message, true, 7, 3);
        assert!(to_caller.is_to_caller());
        assert_eq!(to_caller.kind().unwrap(), FrameKind::Message);
    }

    #[test]
    fn test_validate_reserved_method() {
        let header = Header::new(RESERVED_METHOD_ID, 0, 1, 0);
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_validate_payload_limit() {
        let header = Header::new(1, 0, 1, 101);
        let err = header.validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_reserved_bits() {
        let header = Header::new(1, 0b1000_0000, 1, 0);
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_conflicting_kind_bits() {
        let header = Header::new(1, flags::END | flags::ERROR, 1, 0);
        assert!(header.kind().is_err());
        assert!(header.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());
    }

    #[test]
    fn test_callee_cannot_open_or_cancel() {
        let open = Header::new(1, flags::TO_CALLER | flags::OPEN, 1, 0);
        assert!(open.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());

        let cancel = Header::new(1, flags::TO_CALLER | flags::CANCEL, 1, 0);
        assert!(cancel.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_err());

        let cancel_from_caller = Header::new(1, flags::CANCEL, 1, 0);
        assert!(cancel_from_caller.validate(DEFAULT_MAX_PAYLOAD_SIZE).is_ok());
    }
}
