//! Message streams for the two directions of a call.
//!
//! [`Inbound`] and [`Outbound`] carry raw payloads and enforce the direction
//! lifecycle. [`Streaming`], [`Sink`] and [`ResponseHandle`] layer MsgPack
//! encoding on top and are what handlers and callers use.

mod direction;
mod typed;

pub use direction::{Inbound, InboundEvent, Outbound};
pub(crate) use direction::{deliver, queue_capacity, Delivery};
pub use typed::{ResponseHandle, Sink, StreamEvent, Streaming};
