//! Handler module - routing and per-call dispatch.
//!
//! Provides:
//! - [`Router`] - maps method IDs to handlers
//! - [`ServerCall`] - one incoming call, split into typed streams by handlers
//!
//! Handlers are plain async closures in one of four shapes, one per
//! [`Pattern`](crate::call::Pattern). The framework reads the request,
//! runs the closure and ends the response direction: `END` when the closure
//! returns `Ok`, `ERROR` with the returned [`Status`](crate::Status)
//! otherwise.
//!
//! # Example
//!
//! ```
//! use calcwire::call::{MethodDescriptor, Pattern};
//! use calcwire::handler::Router;
//! use calcwire::{Sink, Status};
//!
//! static COUNTDOWN: MethodDescriptor = MethodDescriptor {
//!     name: "Countdown",
//!     id: 1,
//!     pattern: Pattern::ServerStreaming,
//! };
//!
//! let router = Router::new().server_streaming(&COUNTDOWN, |n: u32, sink: Sink<u32>| async move {
//!     for i in (0..n).rev() {
//!         sink.send(&i).await.map_err(Status::from)?;
//!     }
//!     Ok::<_, Status>(())
//! });
//! # assert_eq!(router.len(), 1);
//! ```

mod context;
mod registry;

pub use context::ServerCall;
pub use registry::{
    BidiStreamingHandler, BoxFuture, ClientStreamingHandler, Handler, Router,
    ServerStreamingHandler, UnaryHandler,
};
