//! Caller side: opens calls on a connection.
//!
//! A [`Channel`] owns one connection. Calls get increasing IDs starting at
//! 1; a reader task routes callee frames back to the call they belong to.
//! Any number of calls may be in flight at once, and the channel is cheap
//! to clone.
//!
//! # Example
//!
//! ```no_run
//! use calcwire::calculator::{self, AddRequest, AddResponse};
//! use calcwire::{CallOptions, Channel};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = Channel::connect_tcp("127.0.0.1:50055").await?;
//! let response: AddResponse = channel
//!     .unary(&calculator::ADD, &AddRequest { first: 3, second: 10 }, CallOptions::default())
//!     .await?;
//! assert_eq!(response.sum, 13);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::call::{CallGuard, CallOptions, MethodDescriptor, Pattern, PendingCalls};
use crate::config::ChannelConfig;
use crate::error::Result;
use crate::protocol::{Frame, FrameBuffer, FrameKind, Header};
use crate::status::Status;
use crate::stream::{
    deliver, queue_capacity, Delivery, Inbound, InboundEvent, Outbound, ResponseHandle, Sink,
    Streaming,
};
use crate::writer::{spawn_writer_task, OutboundFrame, WeakWriterHandle, WriterHandle};

/// Read buffer size per connection.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for [`Channel`].
#[derive(Debug, Clone, Default)]
pub struct ChannelBuilder {
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Deadline for calls whose [`CallOptions`] do not set one.
    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.config.default_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    /// Set how many unread responses are buffered per call before the call
    /// is cancelled with `ResourceExhausted`.
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

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Start a channel over an established connection.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn connect<IO>(self, io: IO) -> Channel
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (writer, writer_task) = spawn_writer_task(writer, &self.config.writer);
        let calls = Arc::new(PendingCalls::new());

        tokio::spawn(read_task(
            reader,
            Arc::clone(&calls),
            writer.downgrade(),
            self.config.max_payload_size,
        ));

        Channel {
            inner: Arc::new(ChannelInner {
                writer,
                calls,
                next_call_id: AtomicU32::new(1),
                config: self.config,
                _writer_task: writer_task,
            }),
        }
    }

    /// Connect over TCP.
    pub async fn connect_tcp<A: ToSocketAddrs>(self, addr: A) -> Result<Channel> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(self.connect(stream))
    }
}

/// A connection to a callee.
///
/// The connection closes once every clone of the channel and every call
/// started on it have been dropped.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    writer: WriterHandle,
    calls: Arc<PendingCalls>,
    next_call_id: AtomicU32,
    config: ChannelConfig,
    _writer_task: JoinHandle<Result<()>>,
}

impl Channel {
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::new()
    }

    /// [`ChannelBuilder::connect`] with default settings.
    pub fn connect<IO>(io: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        ChannelBuilder::new().connect(io)
    }

    /// [`ChannelBuilder::connect_tcp`] with default settings.
    pub async fn connect_tcp<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        ChannelBuilder::new().connect_tcp(addr).await
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Number of calls still waiting for callee frames.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Whether the writer has stopped, i.e. the connection is unusable.
    pub fn is_closed(&self) -> bool {
        self.inner.writer.is_closed()
    }

    /// One request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        method: &'static MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> std::result::Result<Resp, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        check_pattern(method, Pattern::Unary)?;
        let (outbound, inbound) = self.start_call(method, options).await?;

        let requests = Sink::<Req>::new(outbound);
        requests.send(request).await?;
        requests.complete().await?;

        ResponseHandle::new(Streaming::new(inbound)).response().await
    }

    /// One request, a stream of responses.
    ///
    /// Dropping the returned stream before it ends cancels the call.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &'static MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> std::result::Result<Streaming<Resp>, Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        check_pattern(method, Pattern::ServerStreaming)?;
        let (outbound, inbound) = self.start_call(method, options).await?;

        let requests = Sink::<Req>::new(outbound);
        requests.send(request).await?;
        requests.complete().await?;

        Ok(Streaming::new(inbound))
    }

    /// A stream of requests, one response.
    ///
    /// Complete the sink (or drop it) to let the callee respond.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &'static MethodDescriptor,
        options: CallOptions,
    ) -> std::result::Result<(Sink<Req>, ResponseHandle<Resp>), Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        check_pattern(method, Pattern::ClientStreaming)?;
        let (outbound, inbound) = self.start_call(method, options).await?;
        Ok((
            Sink::new(outbound),
            ResponseHandle::new(Streaming::new(inbound)),
        ))
    }

    /// Independent request and response streams.
    pub async fn bidi_streaming<Req, Resp>(
        &self,
        method: &'static MethodDescriptor,
        options: CallOptions,
    ) -> std::result::Result<(Sink<Req>, Streaming<Resp>), Status>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        check_pattern(method, Pattern::BidiStreaming)?;
        let (outbound, inbound) = self.start_call(method, options).await?;
        Ok((Sink::new(outbound), Streaming::new(inbound)))
    }

    /// Register a new call and send its `OPEN` frame.
    async fn start_call(
        &self,
        method: &'static MethodDescriptor,
        options: CallOptions,
    ) -> Result<(Outbound, Inbound)> {
        let inner = &self.inner;
        let call_id = inner.next_call_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::channel(queue_capacity(inner.config.call_buffer));
        inner.calls.insert(call_id, tx);

        let deadline = options
            .deadline
            .or_else(|| inner.config.default_deadline())
            .map(|timeout| Instant::now() + timeout);
        let guard = CallGuard::new(method.id, call_id, Arc::clone(&inner.calls), inner.writer.clone());
        let inbound = Inbound::new(call_id, rx)
            .with_deadline(deadline)
            .with_guard(guard);
        let outbound = Outbound::request(method.id, call_id, inner.writer.clone(), deadline);

        outbound.open().await?;
        tracing::debug!(call_id, method = method.name, pattern = %method.pattern, "Call started");

        Ok((outbound, inbound))
    }
}

fn check_pattern(method: &MethodDescriptor, expected: Pattern) -> std::result::Result<(), Status> {
    if method.pattern == expected {
        return Ok(());
    }
    Err(Status::internal(format!(
        "method {} is {}, called as {}",
        method.name, method.pattern, expected
    )))
}

async fn read_task<R>(
    reader: R,
    calls: Arc<PendingCalls>,
    writer: WeakWriterHandle,
    max_payload_size: u32,
)
where
    R: AsyncRead + Unpin,
{
    let status = match read_loop(reader, &calls, &writer, max_payload_size).await {
        Ok(()) => {
            tracing::debug!("Callee closed the connection");
            Status::unavailable("connection closed")
        }
        Err(e) => {
            tracing::warn!("Channel read loop failed: {}", e);
            Status::unavailable(format!("connection failed: {e}"))
        }
    };

    // Fail whatever is still waiting.
    let pending: Vec<_> = calls.iter().map(|entry| entry.value().clone()).collect();
    calls.clear();
    for sender in pending {
        deliver(&sender, InboundEvent::Failed(status.clone()));
    }
}

async fn read_loop<R>(
    mut reader: R,
    calls: &PendingCalls,
    writer: &WeakWriterHandle,
    max_payload_size: u32,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        for frame in frame_buffer.push(&buf[..n])? {
            route_frame(calls, writer, frame)?;
        }
    }
}

/// Hand a callee frame to its call. Never waits on a call's queue, so one
/// slow reader cannot hold up the rest of the connection.
fn route_frame(calls: &PendingCalls, writer: &WeakWriterHandle, frame: Frame) -> Result<()> {
    let call_id = frame.call_id();
    let frame_method = frame.method_id();
    if !frame.is_to_caller() {
        tracing::warn!(call_id, "Ignoring caller frame sent to the client");
        return Ok(());
    }

    let event = match frame.kind()? {
        FrameKind::Message => InboundEvent::Message(frame.payload),
        FrameKind::End => InboundEvent::Completed,
        FrameKind::Error => InboundEvent::Failed(Status::from_wire(frame.payload())),
        // Rejected by header validation.
        FrameKind::Open | FrameKind::Cancel => return Ok(()),
    };

    // A terminal frame ends the call's registration.
    let sender = if event.is_terminal() {
        calls.remove(&call_id).map(|(_, sender)| sender)
    } else {
        calls.get(&call_id).map(|entry| entry.value().clone())
    };
    let Some(sender) = sender else {
        tracing::debug!(call_id, "Frame for unknown or abandoned call");
        return Ok(());
    };

    match deliver(&sender, event) {
        Delivery::Queued => {}
        Delivery::Closed => tracing::debug!(call_id, "Caller stopped reading responses"),
        Delivery::Overflow => {
            calls.remove(&call_id);
            tracing::warn!(call_id, "Caller fell behind on responses, cancelling call");
            let header = Header::for_kind(frame_method, FrameKind::Cancel, false, call_id, 0);
            if let Err(e) = writer.try_send_control(OutboundFrame::empty(&header)) {
                tracing::debug!(call_id, "Could not send CANCEL: {}", e);
            }
        }
    }
    Ok(())
}
