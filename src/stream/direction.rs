//! Raw call directions.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::call::{CallGuard, CallState, DirectionState};
use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};
use crate::protocol::{FrameKind, Header};
use crate::status::Status;
use crate::writer::{OutboundFrame, WriterHandle};

/// What the receiving side of a direction observes.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// One encoded message.
    Message(Bytes),
    /// The sender completed its direction.
    Completed,
    /// The sender failed its direction, or the direction was lost.
    Failed(Status),
}

impl InboundEvent {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InboundEvent::Message(_))
    }
}

/// Queue size for a direction that buffers `buffer` messages. One extra
/// slot is kept free for the terminal event.
#[inline]
pub(crate) fn queue_capacity(buffer: usize) -> usize {
    buffer.max(1) + 1
}

/// Outcome of [`deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// The receiver fell behind; it was handed `Failed(ResourceExhausted)`
    /// in place of the event.
    Overflow,
    /// The receiver is gone.
    Closed,
}

/// Queue `event` for a direction's receiver without waiting.
///
/// Connection readers are the only producers, so a message never takes
/// the last free slot and a terminal event always fits.
pub(crate) fn deliver(sender: &mpsc::Sender<InboundEvent>, event: InboundEvent) -> Delivery {
    if sender.is_closed() {
        return Delivery::Closed;
    }
    if !event.is_terminal() && sender.capacity() <= 1 {
        let status = Status::resource_exhausted("too many unread messages");
        let _ = sender.try_send(InboundEvent::Failed(status));
        return Delivery::Overflow;
    }
    match sender.try_send(event) {
        Ok(()) => Delivery::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => Delivery::Overflow,
        Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Receiving end of one direction.
///
/// Yields messages in order, then exactly one terminal event, then `None`.
pub struct Inbound {
    call_id: u32,
    rx: mpsc::Receiver<InboundEvent>,
    deadline: Option<Instant>,
    done: bool,
    // Opposite direction, failed together with this one.
    peer: Option<Arc<DirectionState>>,
    guard: Option<CallGuard>,
}

impl Inbound {
    pub(crate) fn new(call_id: u32, rx: mpsc::Receiver<InboundEvent>) -> Self {
        Self {
            call_id,
            rx,
            deadline: None,
            done: false,
            peer: None,
            guard: None,
        }
    }

    pub(crate) fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub(crate) fn with_peer(mut self, peer: Arc<DirectionState>) -> Self {
        self.peer = Some(peer);
        self
    }

    pub(crate) fn with_guard(mut self, guard: CallGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Whether the terminal event has been delivered.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Wait for the next event.
    ///
    /// An elapsed deadline yields `Failed(DeadlineExceeded)` and abandons the
    /// call. A direction that vanishes without a terminal frame yields
    /// `Failed(Unavailable)`.
    pub async fn next_event(&mut self) -> Option<InboundEvent> {
        if self.done {
            return None;
        }

        let received = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::debug!(call_id = self.call_id, "Deadline exceeded");
                    let status = Status::deadline_exceeded("deadline exceeded");
                    return Some(InboundEvent::Failed(self.abandon(status)));
                }
            },
            None => self.rx.recv().await,
        };

        let Some(event) = received else {
            let status = Status::unavailable("connection closed");
            return Some(InboundEvent::Failed(self.abandon(status)));
        };

        if event.is_terminal() {
            self.done = true;
            if matches!(event, InboundEvent::Failed(_)) {
                self.fail_peer();
            }
            if let Some(guard) = self.guard.take() {
                guard.release();
            }
        }

        Some(event)
    }

    /// End the direction locally with `status`, cancelling the call if this
    /// side started it.
    pub(crate) fn abandon(&mut self, status: Status) -> Status {
        self.done = true;
        self.fail_peer();
        drop(self.guard.take());
        status
    }

    fn fail_peer(&self) {
        if let Some(peer) = &self.peer {
            peer.finish(CallState::Failed);
        }
    }
}

/// Sending end of one direction.
///
/// Cheap to clone. Frames from all clones are serialized, and nothing is
/// written once the direction has completed or failed.
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<OutboundInner>,
}

struct OutboundInner {
    method_id: u16,
    call_id: u32,
    to_caller: bool,
    writer: WriterHandle,
    state: Arc<DirectionState>,
    order: Mutex<()>,
    deadline: Option<Instant>,
}

impl Outbound {
    pub(crate) fn new(method_id: u16, call_id: u32, to_caller: bool, writer: WriterHandle) -> Self {
        Self::build(method_id, call_id, to_caller, writer, None)
    }

    /// Request direction of a call started by this side. Once `deadline`
    /// passes, sends fail and the call is cancelled.
    pub(crate) fn request(
        method_id: u16,
        call_id: u32,
        writer: WriterHandle,
        deadline: Option<Instant>,
    ) -> Self {
        Self::build(method_id, call_id, false, writer, deadline)
    }

    fn build(
        method_id: u16,
        call_id: u32,
        to_caller: bool,
        writer: WriterHandle,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                method_id,
                call_id,
                to_caller,
                writer,
                state: Arc::new(DirectionState::new()),
                order: Mutex::new(()),
                deadline,
            }),
        }
    }

    /// Lifecycle cell shared with the connection loop.
    pub(crate) fn state_handle(&self) -> Arc<DirectionState> {
        Arc::clone(&self.inner.state)
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.inner.call_id
    }

    #[inline]
    pub fn state(&self) -> CallState {
        self.inner.state.get()
    }

    /// Send one encoded message.
    ///
    /// # Errors
    ///
    /// [`RpcError::CallClosed`] once the direction is terminal, and
    /// [`RpcError::DeadlineExceeded`] once the call's deadline has passed.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        let _order = self.inner.order.lock().await;
        if !self.inner.state.is_open() {
            return Err(RpcError::CallClosed(self.inner.call_id));
        }
        self.write_before_deadline(FrameKind::Message, payload).await
    }

    /// Complete the direction with an `END` frame.
    pub async fn complete(&self) -> Result<()> {
        let _order = self.inner.order.lock().await;
        if self.inner.deadline.is_none() {
            if !self.inner.state.finish(CallState::Completed) {
                return Err(RpcError::CallClosed(self.inner.call_id));
            }
            return self.write(FrameKind::End, Bytes::new()).await;
        }

        // With a deadline the direction only completes once END is queued.
        if !self.inner.state.is_open() {
            return Err(RpcError::CallClosed(self.inner.call_id));
        }
        self.write_before_deadline(FrameKind::End, Bytes::new()).await?;
        self.inner.state.finish(CallState::Completed);
        Ok(())
    }

    /// Fail the direction with an `ERROR` frame carrying `status`.
    pub async fn fail(&self, status: &Status) -> Result<()> {
        let payload = MsgPackCodec::encode(status)?;
        let _order = self.inner.order.lock().await;
        if !self.inner.state.finish(CallState::Failed) {
            return Err(RpcError::CallClosed(self.inner.call_id));
        }
        self.write(FrameKind::Error, payload).await
    }

    /// Send the `OPEN` frame that starts a call.
    pub(crate) async fn open(&self) -> Result<()> {
        self.write(FrameKind::Open, Bytes::new()).await
    }

    async fn write_before_deadline(&self, kind: FrameKind, payload: Bytes) -> Result<()> {
        let Some(deadline) = self.inner.deadline else {
            return self.write(kind, payload).await;
        };
        if Instant::now() < deadline {
            if let Ok(written) = tokio::time::timeout_at(deadline, self.write(kind, payload)).await {
                return written;
            }
        }
        self.expire();
        Err(RpcError::DeadlineExceeded(self.inner.call_id))
    }

    /// Fail the direction after its deadline and tell the callee to stop.
    fn expire(&self) {
        if !self.inner.state.finish(CallState::Failed) {
            return;
        }
        let inner = &self.inner;
        tracing::debug!(call_id = inner.call_id, "Deadline exceeded while sending");
        let header = Header::for_kind(inner.method_id, FrameKind::Cancel, false, inner.call_id, 0);
        if let Err(e) = inner.writer.try_send_control(OutboundFrame::empty(&header)) {
            tracing::debug!(call_id = inner.call_id, "Could not send CANCEL: {}", e);
        }
    }

    async fn write(&self, kind: FrameKind, payload: Bytes) -> Result<()> {
        let length = u32::try_from(payload.len()).map_err(|_| {
            RpcError::Protocol(format!("Payload of {} bytes is too large", payload.len()))
        })?;
        let header = Header::for_kind(
            self.inner.method_id,
            kind,
            self.inner.to_caller,
            self.inner.call_id,
            length,
        );
        self.inner
            .writer
            .send(OutboundFrame::new(&header, payload))
            .await
    }
}

impl Drop for OutboundInner {
    fn drop(&mut self) {
        // Dropping every handle to a request stream half-closes it.
        if self.to_caller || !self.state.finish(CallState::Completed) {
            return;
        }
        let header = Header::for_kind(self.method_id, FrameKind::End, false, self.call_id, 0);
        if let Err(e) = self.writer.try_send_control(OutboundFrame::empty(&header)) {
            tracing::debug!(call_id = self.call_id, "Could not send END on drop: {}", e);
        }
    }
}
