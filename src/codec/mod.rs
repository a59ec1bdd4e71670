//! Codec module - serialization of message payloads.
//!
//! The RPC core treats messages as typed values; this is the one place where
//! they become bytes. [`MsgPackCodec`] encodes with `rmp-serde` and hands out
//! `bytes::Bytes` so payloads move into frames without another copy.

mod msgpack;

pub use msgpack::MsgPackCodec;
