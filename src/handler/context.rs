//! Per-call context handed to handlers.
//!
//! A [`ServerCall`] owns both directions of one incoming call. The typed
//! adapters in [`registry`](super::registry) split it into a request
//! [`Streaming`] and a response [`Sink`], run the user handler and then end
//! the response direction with `END` or `ERROR` depending on the outcome.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::call::{CallState, MethodDescriptor};
use crate::error::RpcError;
use crate::status::Status;
use crate::stream::{Inbound, Outbound, Sink, StreamEvent, Streaming};

/// One incoming call, as seen by the callee.
pub struct ServerCall {
    method: &'static MethodDescriptor,
    inbound: Inbound,
    outbound: Outbound,
}

impl ServerCall {
    pub(crate) fn new(method: &'static MethodDescriptor, inbound: Inbound, outbound: Outbound) -> Self {
        Self {
            method,
            inbound,
            outbound,
        }
    }

    /// The method this call was opened for.
    #[inline]
    pub fn method(&self) -> &'static MethodDescriptor {
        self.method
    }

    #[inline]
    pub fn call_id(&self) -> u32 {
        self.outbound.call_id()
    }

    /// Split into a typed request stream and response sink.
    pub fn into_parts<Req, Resp>(self) -> (Streaming<Req>, Sink<Resp>)
    where
        Req: DeserializeOwned,
        Resp: Serialize,
    {
        (Streaming::new(self.inbound), Sink::new(self.outbound))
    }
}

/// Read the single request of a unary or server-streaming call.
pub(crate) async fn single_request<Req>(requests: &mut Streaming<Req>) -> Result<Req, Status>
where
    Req: DeserializeOwned,
{
    match requests.next_event().await {
        Some(StreamEvent::Message(request)) => Ok(request),
        Some(StreamEvent::Completed) | None => {
            Err(Status::invalid_argument("missing request message"))
        }
        Some(StreamEvent::Failed(status)) => Err(status),
    }
}

/// End the response direction according to the handler outcome.
///
/// Returns the final state of the direction. If it was already terminal
/// (handler ended it, or the caller failed or cancelled) the outcome is
/// dropped.
pub(crate) async fn finish<Resp>(responses: &Sink<Resp>, outcome: Result<(), Status>) -> CallState
where
    Resp: Serialize,
{
    let result = match outcome {
        Ok(()) => responses.complete().await,
        Err(status) => {
            tracing::debug!(call_id = responses.call_id(), "Call failed: {}", status);
            responses.fail(status).await
        }
    };

    match result {
        Ok(()) => {}
        Err(RpcError::CallClosed(call_id)) => {
            tracing::debug!(call_id, "Direction already closed, outcome suppressed");
        }
        Err(e) => {
            tracing::warn!(call_id = responses.call_id(), "Failed to end call: {}", e);
        }
    }

    responses.state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Pattern;
    use crate::codec::MsgPackCodec;
    use crate::protocol::{FrameBuffer, FrameKind};
    use crate::stream::InboundEvent;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use crate::Code;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::sync::mpsc;

    const ECHO: MethodDescriptor = MethodDescriptor {
        name: "Echo",
        id: 1,
        pattern: Pattern::Unary,
    };

    #[tokio::test]
    async fn test_single_request_missing() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(InboundEvent::Completed).await.unwrap();
        let mut requests: Streaming<i32> = Streaming::new(Inbound::new(1, rx));

        let status = single_request(&mut requests).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_finish_sends_error_frame() {
        let (client, mut server) = duplex(4096);
        let (writer, task) = spawn_writer_task(client, &WriterConfig::default());
        let (_tx, rx) = mpsc::channel(1);
        let call = ServerCall::new(&ECHO, Inbound::new(4, rx), Outbound::new(1, 4, true, writer));
        assert_eq!(call.call_id(), 4);
        assert_eq!(call.method().name, "Echo");

        let (_requests, responses) = call.into_parts::<i32, i32>();
        let state = finish(&responses, Err(Status::invalid_argument("nope"))).await;
        assert_eq!(state, CallState::Failed);

        // A second outcome is suppressed.
        assert_eq!(finish(&responses, Ok(())).await, CallState::Failed);

        drop(responses);
        task.await.unwrap().unwrap();

        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).await.unwrap();
        let frames = FrameBuffer::new().push(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind().unwrap(), FrameKind::Error);
        let status: Status = MsgPackCodec::decode(frames[0].payload()).unwrap();
        assert_eq!(status.message(), "nope");
    }
}
