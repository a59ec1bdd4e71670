//! # calcwire
//!
//! A calculator service over a small framed RPC protocol that supports all
//! four call shapes: unary, server-streaming, client-streaming and
//! bidirectional streaming.
//!
//! ## Architecture
//!
//! - **Protocol**: 11-byte big-endian header (method ID, flags, call ID,
//!   payload length) followed by a MsgPack payload. Many calls share one
//!   connection, keyed by call ID.
//! - **Calls**: each call has two directions (caller to callee and back),
//!   each independently open, completed (`END`) or failed (`ERROR`).
//! - **Server**: [`Server`] routes `OPEN` frames to handlers registered on a
//!   [`Router`](handler::Router).
//! - **Client**: [`Channel`] opens calls and hands back typed
//!   [`Sink`]/[`Streaming`] halves.
//!
//! ## Example
//!
//! ```no_run
//! use calcwire::calculator::{self, CalculatorClient};
//! use calcwire::{CallOptions, Channel, Server};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let server = Server::new(calculator::router());
//! tokio::spawn(async move { server.serve_connection(server_io).await });
//!
//! let client = CalculatorClient::new(Channel::connect(client_io))
//!     .with_options(CallOptions::new().with_deadline(Duration::from_secs(5)));
//! assert_eq!(client.add(3, 10).await?, 13);
//! assert_eq!(client.prime_factors(120).await?, vec![2, 2, 2, 3, 5]);
//! # Ok(())
//! # }
//! ```

pub mod calculator;
pub mod call;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod status;
pub mod stream;

mod client;
mod server;
mod writer;

pub use call::{CallOptions, CallState, MethodDescriptor, Pattern, ServiceDescriptor};
pub use client::{Channel, ChannelBuilder};
pub use config::{ChannelConfig, Config, ServerConfig};
pub use error::{Result, RpcError};
pub use server::{Server, ServerBuilder};
pub use status::{Code, Status};
pub use stream::{ResponseHandle, Sink, StreamEvent, Streaming};
pub use writer::WriterConfig;
