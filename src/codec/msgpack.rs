//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named` (struct-as-map) so that a
//! message stays decodable when fields are added or reordered.
//!
//! # Example
//!
//! ```
//! use calcwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Request {
//!     first_number: i64,
//!     second_number: i64,
//! }
//!
//! let req = Request { first_number: 3, second_number: 10 };
//! let encoded = MsgPackCodec::encode(&req).unwrap();
//! let decoded: Request = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, req);
//! ```

use bytes::Bytes;

use crate::error::Result;

/// MessagePack codec for message payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value into a frame-ready payload.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode payload bytes into a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
