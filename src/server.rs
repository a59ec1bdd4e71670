//! Callee side: accepts calls and runs handlers.
//!
//! Each connection gets one reader loop, one writer task and one task per
//! call. The reader routes caller frames by call ID:
//!
//! - `OPEN` looks up the method, reserves a concurrency permit and spawns
//!   the handler. Unknown methods are refused with `Unimplemented`, calls
//!   over the limit with `ResourceExhausted`.
//! - Message, `END` and `ERROR` frames are forwarded to the call's inbound
//!   stream. A caller `ERROR` also fails the response direction, so the
//!   handler's outcome is suppressed. The reader never waits on a call: a
//!   handler with `call_buffer` unread requests has its call failed with
//!   `ResourceExhausted`.
//! - `CANCEL` removes the call and aborts its task.
//!
//! When the connection ends, every live call is failed and aborted.
//!
//! # Example
//!
//! ```no_run
//! use calcwire::calculator;
//! use calcwire::Server;
//! use tokio::net::TcpListener;
//!
//! # async fn run() -> calcwire::Result<()> {
//! let server = Server::builder(calculator::router())
//!     .max_concurrent_calls(64)
//!     .build();
//! server.serve(TcpListener::bind("127.0.0.1:50055").await?).await
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::AbortHandle;

use crate::call::CallState;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::{Router, ServerCall};
use crate::protocol::{Frame, FrameBuffer, FrameKind};
use crate::status::Status;
use crate::stream::{deliver, queue_capacity, Delivery, Inbound, InboundEvent, Outbound};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for [`Server`].
pub struct ServerBuilder {
    router: Router,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of calls running at once per connection.
    ///
    /// Default: 256
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.config.max_concurrent_calls = limit;
        self
    }

    /// Set how many unread requests are buffered per call before the call
    /// fails with `ResourceExhausted`.
    ///
    /// Default: 8192
    pub fn call_buffer(mut self, capacity: usize) -> Self {
        self.config.call_buffer = capacity;
        self
    }

    /// Set the largest accepted frame payload.
    ///
    /// Default: 16 MB
    pub fn max_payload_size(mut self, bytes: u32) -> Self {
        self.config.max_payload_size = bytes;
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                router: self.router,
                config: self.config,
            }),
        }
    }
}

/// A callee serving one [`Router`] on any number of connections.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    router: Router,
    config: ServerConfig,
}

impl Server {
    pub fn builder(router: Router) -> ServerBuilder {
        ServerBuilder {
            router,
            config: ServerConfig::default(),
        }
    }

    pub fn new(router: Router) -> Self {
        Self::builder(router).build()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Serve calls on one connection until the peer goes away.
    ///
    /// # Errors
    ///
    /// I/O failures and framing violations. A clean EOF is `Ok`.
    pub async fn serve_connection<IO>(&self, io: IO) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (writer, writer_task) = spawn_writer_task(writer, &self.inner.config.writer);

        let connection = Connection {
            server: Arc::clone(&self.inner),
            writer,
            calls: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(self.inner.config.max_concurrent_calls)),
        };

        let result = connection.read_loop(reader).await;
        if let Err(e) = &result {
            tracing::warn!("Connection read loop failed: {}", e);
        }
        connection.close();
        drop(connection);

        match writer_task.await {
            Ok(Err(e)) => tracing::debug!("Writer ended with error: {}", e),
            Err(e) => tracing::debug!("Writer task failed: {}", e),
            Ok(Ok(())) => {}
        }

        result
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(%local, "Serving");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, "Could not set TCP_NODELAY: {}", e);
            }

            let server = self.clone();
            tokio::spawn(async move {
                tracing::debug!(%peer, "Connection accepted");
                match server.serve_connection(stream).await {
                    Ok(()) => tracing::debug!(%peer, "Connection closed"),
                    Err(e) => tracing::warn!(%peer, "Connection failed: {}", e),
                }
            });
        }
    }

    /// Like [`serve`](Self::serve), returning once `signal` resolves.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.serve(listener) => result,
            () = signal => {
                tracing::info!("Shutting down");
                Ok(())
            }
        }
    }
}

/// A live call as tracked by the connection reader.
struct CallEntry {
    inbound: mpsc::Sender<InboundEvent>,
    responses: Outbound,
    task: AbortHandle,
}

struct Connection {
    server: Arc<ServerInner>,
    writer: WriterHandle,
    calls: Arc<DashMap<u32, CallEntry>>,
    permits: Arc<Semaphore>,
}

impl Connection {
    async fn read_loop<R>(&self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frame_buffer = FrameBuffer::with_max_payload(self.server.config.max_payload_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                tracing::debug!("Peer closed the connection");
                return Ok(());
            }

            for frame in frame_buffer.push(&buf[..n])? {
                self.handle_frame(frame).await?;
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Result<()> {
        let call_id = frame.call_id();
        if frame.is_to_caller() {
            tracing::warn!(call_id, "Ignoring callee frame sent to the server");
            return Ok(());
        }

        match frame.kind()? {
            FrameKind::Open => self.open_call(&frame).await,
            FrameKind::Message => self.forward(call_id, InboundEvent::Message(frame.payload)),
            FrameKind::End => self.forward(call_id, InboundEvent::Completed),
            FrameKind::Error => {
                let status = Status::from_wire(frame.payload());
                if let Some(entry) = self.calls.get(&call_id) {
                    entry.responses.state_handle().finish(CallState::Failed);
                }
                tracing::debug!(call_id, "Caller failed: {}", status);
                self.forward(call_id, InboundEvent::Failed(status));
            }
            FrameKind::Cancel => self.cancel_call(call_id),
        }
        Ok(())
    }

    async fn open_call(&self, frame: &Frame) {
        let method_id = frame.method_id();
        let call_id = frame.call_id();

        if self.calls.contains_key(&call_id) {
            tracing::warn!(call_id, "Duplicate OPEN for a live call, ignoring");
            return;
        }

        let Some(method) = self.server.router.method(method_id) else {
            tracing::warn!(call_id, method_id, "Call to unknown method");
            let status = Status::unimplemented(format!("unknown method id {method_id}"));
            self.reject(method_id, call_id, status).await;
            return;
        };

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            tracing::warn!(call_id, method = method.name, "Concurrent call limit reached");
            let status = Status::resource_exhausted("too many concurrent calls");
            self.reject(method_id, call_id, status).await;
            return;
        };

        let (tx, rx) = mpsc::channel(queue_capacity(self.server.config.call_buffer));
        let outbound = Outbound::new(method_id, call_id, true, self.writer.clone());
        let responses = outbound.clone();
        let inbound = Inbound::new(call_id, rx).with_peer(outbound.state_handle());

        let handler = match self
            .server
            .router
            .dispatch(ServerCall::new(method, inbound, outbound))
        {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(call_id, method = method.name, "Dispatch failed: {}", e);
                return;
            }
        };

        // The task waits until its entry is registered, so its own removal
        // can never run first.
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let calls = Arc::clone(&self.calls);
        let task = tokio::spawn(async move {
            let _permit = permit;
            if ready_rx.await.is_err() {
                return;
            }
            let state = handler.await;
            calls.remove(&call_id);
            tracing::debug!(call_id, method = method.name, ?state, "Call finished");
        });

        self.calls.insert(
            call_id,
            CallEntry {
                inbound: tx,
                responses,
                task: task.abort_handle(),
            },
        );
        let _ = ready_tx.send(());
        tracing::debug!(call_id, method = method.name, pattern = %method.pattern, "Call opened");
    }

    /// Fail a call that never got a handler.
    async fn reject(&self, method_id: u16, call_id: u32, status: Status) {
        let outbound = Outbound::new(method_id, call_id, true, self.writer.clone());
        if let Err(e) = outbound.fail(&status).await {
            tracing::warn!(call_id, "Could not reject call: {}", e);
        }
    }

    /// Hand a caller frame to its call without waiting on the call's queue.
    fn forward(&self, call_id: u32, event: InboundEvent) {
        let Some(sender) = self.calls.get(&call_id).map(|entry| entry.inbound.clone()) else {
            tracing::debug!(call_id, "Frame for unknown or finished call");
            return;
        };
        match deliver(&sender, event) {
            Delivery::Queued => {}
            Delivery::Closed => tracing::debug!(call_id, "Handler no longer reads requests"),
            Delivery::Overflow => self.overflow(call_id),
        }
    }

    /// Fail a call whose handler fell behind on its requests.
    fn overflow(&self, call_id: u32) {
        let Some((_, entry)) = self.calls.remove(&call_id) else {
            return;
        };
        entry.task.abort();
        tracing::warn!(call_id, "Handler fell behind on requests, failing call");

        let status = Status::resource_exhausted("too many unread requests");
        tokio::spawn(async move {
            if let Err(e) = entry.responses.fail(&status).await {
                tracing::debug!(call_id, "Could not fail call: {}", e);
            }
        });
    }

    fn cancel_call(&self, call_id: u32) {
        match self.calls.remove(&call_id) {
            Some((_, entry)) => {
                entry.responses.state_handle().finish(CallState::Failed);
                entry.task.abort();
                tracing::debug!(call_id, "Call cancelled by caller");
            }
            None => tracing::debug!(call_id, "CANCEL for unknown or finished call"),
        }
    }

    /// Fail and abort every live call.
    fn close(&self) {
        let live = self.calls.len();
        self.calls.retain(|_, entry| {
            entry.responses.state_handle().finish(CallState::Failed);
            entry.task.abort();
            false
        });
        if live > 0 {
            tracing::debug!(live, "Connection closed with live calls");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{MethodDescriptor, Pattern};
    use crate::codec::MsgPackCodec;
    use crate::protocol::{build_frame, Header};
    use crate::status::Code;
    use crate::stream::Streaming;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    static ECHO: MethodDescriptor = MethodDescriptor {
        name: "Echo",
        id: 1,
        pattern: Pattern::Unary,
    };

    static HANG: MethodDescriptor = MethodDescriptor {
        name: "Hang",
        id: 2,
        pattern: Pattern::Unary,
    };

    static STALL: MethodDescriptor = MethodDescriptor {
        name: "Stall",
        id: 3,
        pattern: Pattern::ClientStreaming,
    };

    fn router() -> Router {
        Router::new()
            .unary(&ECHO, |s: String| async move { Ok::<_, Status>(s) })
            .unary(&HANG, |_: ()| async move {
                std::future::pending::<()>().await;
                Ok::<_, Status>(())
            })
            .client_streaming(&STALL, |requests: Streaming<u32>| async move {
                // Hold the stream without ever reading it.
                let _requests = requests;
                std::future::pending::<()>().await;
                Ok::<_, Status>(0u32)
            })
    }

    fn caller_frame(method_id: u16, kind: FrameKind, call_id: u32, payload: &[u8]) -> Vec<u8> {
        let header = Header::for_kind(method_id, kind, false, call_id, payload.len() as u32);
        build_frame(&header, payload)
    }

    /// Read frames until `count` have arrived.
    async fn read_frames(io: &mut DuplexStream, count: usize) -> Vec<Frame> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = [0u8; 1024];
        while frames.len() < count {
            let n = io.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }
        frames
    }

    #[test]
    fn test_builder_configuration() {
        let server = Server::builder(router())
            .max_concurrent_calls(4)
            .call_buffer(8)
            .max_payload_size(1024)
            .max_pending_frames(16)
            .channel_capacity(16)
            .backpressure_timeout(Duration::from_millis(100))
            .build();

        let config = server.config();
        assert_eq!(config.max_concurrent_calls, 4);
        assert_eq!(config.call_buffer, 8);
        assert_eq!(config.max_payload_size, 1024);
        assert_eq!(config.writer.max_pending_frames, 16);
        assert_eq!(config.writer.backpressure_timeout_ms, 100);
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let (mut client, server_io) = duplex(4096);
        let server = Server::new(router());
        let serving = tokio::spawn(async move { server.serve_connection(server_io).await });

        client
            .write_all(&caller_frame(9, FrameKind::Open, 1, &[]))
            .await
            .unwrap();

        let frames = read_frames(&mut client, 1).await;
        assert_eq!(frames[0].kind().unwrap(), FrameKind::Error);
        assert!(frames[0].is_to_caller());
        let status: Status = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert_eq!(status.code(), Code::Unimplemented);

        drop(client);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_call_limit_is_resource_exhausted() {
        let (mut client, server_io) = duplex(4096);
        let server = Server::builder(router()).max_concurrent_calls(1).build();
        let serving = tokio::spawn(async move { server.serve_connection(server_io).await });

        let unit = MsgPackCodec::encode(&()).unwrap();
        let mut bytes = caller_frame(2, FrameKind::Open, 1, &[]);
        bytes.extend(caller_frame(2, FrameKind::Message, 1, &unit));
        bytes.extend(caller_frame(2, FrameKind::Open, 3, &[]));
        client.write_all(&bytes).await.unwrap();

        let frames = read_frames(&mut client, 1).await;
        assert_eq!(frames[0].call_id(), 3);
        let status: Status = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert_eq!(status.code(), Code::ResourceExhausted);

        drop(client);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_frees_call_slot() {
        let (mut client, server_io) = duplex(4096);
        let server = Server::builder(router()).max_concurrent_calls(1).build();
        let serving = tokio::spawn(async move { server.serve_connection(server_io).await });

        let unit = MsgPackCodec::encode(&()).unwrap();
        let mut bytes = caller_frame(2, FrameKind::Open, 1, &[]);
        bytes.extend(caller_frame(2, FrameKind::Message, 1, &unit));
        bytes.extend(caller_frame(2, FrameKind::Cancel, 1, &[]));
        client.write_all(&bytes).await.unwrap();

        // The aborted task releases its permit shortly after the CANCEL.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = MsgPackCodec::encode(&"hi").unwrap();
        let mut bytes = caller_frame(1, FrameKind::Open, 3, &[]);
        bytes.extend(caller_frame(1, FrameKind::Message, 3, &request));
        bytes.extend(caller_frame(1, FrameKind::End, 3, &[]));
        client.write_all(&bytes).await.unwrap();

        let frames = read_frames(&mut client, 2).await;
        assert!(frames.iter().all(|f| f.call_id() == 3));
        assert_eq!(frames[0].kind().unwrap(), FrameKind::Message);
        assert_eq!(frames[1].kind().unwrap(), FrameKind::End);
        let echoed: String = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert_eq!(echoed, "hi");

        drop(client);
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_framing_violation_ends_connection() {
        let (mut client, server_io) = duplex(4096);
        let server = Server::new(router());
        let serving = tokio::spawn(async move { server.serve_connection(server_io).await });

        // Reserved flag bits set.
        let header = Header::new(1, 0b1000_0000, 1, 0);
        client.write_all(&header.encode()).await.unwrap();

        assert!(serving.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_lagging_handler_does_not_block_other_calls() {
        let (mut client, server_io) = duplex(64 * 1024);
        let server = Server::builder(router()).call_buffer(2).build();
        tokio::spawn(async move { server.serve_connection(server_io).await });

        let one = MsgPackCodec::encode(&1u32).unwrap();
        let mut bytes = caller_frame(3, FrameKind::Open, 1, &[]);
        for _ in 0..5 {
            bytes.extend(caller_frame(3, FrameKind::Message, 1, &one));
        }
        client.write_all(&bytes).await.unwrap();

        let frames = read_frames(&mut client, 1).await;
        assert_eq!(frames[0].kind().unwrap(), FrameKind::Error);
        assert_eq!(frames[0].call_id(), 1);
        let status: Status = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert_eq!(status.code(), Code::ResourceExhausted);

        let ping = MsgPackCodec::encode(&"ping").unwrap();
        let mut bytes = caller_frame(1, FrameKind::Open, 2, &[]);
        bytes.extend(caller_frame(1, FrameKind::Message, 2, &ping));
        bytes.extend(caller_frame(1, FrameKind::End, 2, &[]));
        client.write_all(&bytes).await.unwrap();

        let frames = read_frames(&mut client, 2).await;
        assert_eq!(frames[0].call_id(), 2);
        assert_eq!(MsgPackCodec::decode::<String>(frames[0].payload()).unwrap(), "ping");
        assert_eq!(frames[1].kind().unwrap(), FrameKind::End);
    }
}
