//! Typed streams over MsgPack-encoded messages.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::direction::{Inbound, InboundEvent, Outbound};
use crate::call::CallState;
use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::status::Status;

/// A decoded [`InboundEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent<T> {
    Message(T),
    Completed,
    Failed(Status),
}

/// Incoming stream of `T`.
///
/// Handlers receive one for the caller's requests; callers receive one for
/// streamed responses. Dropping a caller-side stream before it ends cancels
/// the call.
pub struct Streaming<T> {
    inbound: Inbound,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Streaming<T> {
    pub(crate) fn new(inbound: Inbound) -> Self {
        Self {
            inbound,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.inbound.call_id()
    }

    /// Next decoded event; `None` after the terminal event.
    ///
    /// A message that does not decode ends the stream with an `Internal`
    /// failure.
    pub async fn next_event(&mut self) -> Option<StreamEvent<T>> {
        let event = match self.inbound.next_event().await? {
            InboundEvent::Message(bytes) => match MsgPackCodec::decode::<T>(&bytes) {
                Ok(message) => StreamEvent::Message(message),
                Err(e) => {
                    tracing::warn!(call_id = self.call_id(), "Malformed message: {}", e);
                    let status = Status::internal(format!("malformed message: {e}"));
                    StreamEvent::Failed(self.inbound.abandon(status))
                }
            },
            InboundEvent::Completed => StreamEvent::Completed,
            InboundEvent::Failed(status) => StreamEvent::Failed(status),
        };
        Some(event)
    }

    /// Next message: `Ok(None)` once the sender completed, `Err` if it failed.
    pub async fn message(&mut self) -> std::result::Result<Option<T>, Status> {
        match self.next_event().await {
            Some(StreamEvent::Message(message)) => Ok(Some(message)),
            Some(StreamEvent::Completed) | None => Ok(None),
            Some(StreamEvent::Failed(status)) => Err(status),
        }
    }

    /// Drain the stream into a vector.
    pub async fn collect(mut self) -> std::result::Result<Vec<T>, Status> {
        let mut messages = Vec::new();
        while let Some(message) = self.message().await? {
            messages.push(message);
        }
        Ok(messages)
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("call_id", &self.inbound.call_id())
            .field("finished", &self.inbound.is_finished())
            .finish()
    }
}

/// Outgoing stream of `T`.
///
/// Handlers get one for responses, callers one for requests. Once the sink
/// has completed or failed, further sends return
/// [`RpcError::CallClosed`](crate::RpcError::CallClosed).
pub struct Sink<T> {
    outbound: Outbound,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            outbound: self.outbound.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> Sink<T> {
    pub(crate) fn new(outbound: Outbound) -> Self {
        Self {
            outbound,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.outbound.call_id()
    }

    #[inline]
    pub fn state(&self) -> CallState {
        self.outbound.state()
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.state() == CallState::Open
    }

    /// Encode `message` and queue it on the direction.
    ///
    /// Encoding happens before the returned future is first polled, so the
    /// future does not borrow `message`.
    pub fn send(&self, message: &T) -> impl Future<Output = Result<()>> + Send + '_ {
        let payload = MsgPackCodec::encode(message);
        async move { self.outbound.send(payload?).await }
    }

    pub async fn complete(&self) -> Result<()> {
        self.outbound.complete().await
    }

    pub async fn fail(&self, status: Status) -> Result<()> {
        self.outbound.fail(&status).await
    }
}

impl<T> fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("call_id", &self.outbound.call_id())
            .field("state", &self.outbound.state())
            .finish()
    }
}

/// Pending single response of a client-streaming or unary call.
#[derive(Debug)]
pub struct ResponseHandle<T> {
    stream: Streaming<T>,
}

impl<T: DeserializeOwned> ResponseHandle<T> {
    pub(crate) fn new(stream: Streaming<T>) -> Self {
        Self { stream }
    }

    /// Wait for the response and the completion that follows it.
    pub async fn response(mut self) -> std::result::Result<T, Status> {
        let mut response = None;
        loop {
            match self.stream.next_event().await {
                Some(StreamEvent::Message(message)) => {
                    if response.is_some() {
                        tracing::warn!(
                            call_id = self.stream.call_id(),
                            "Ignoring extra response message"
                        );
                    } else {
                        response = Some(message);
                    }
                }
                Some(StreamEvent::Completed) => {
                    return response
                        .ok_or_else(|| Status::internal("call completed without a response"));
                }
                Some(StreamEvent::Failed(status)) => return Err(status),
                None => return Err(Status::internal("response stream already finished")),
            }
        }
    }
}
