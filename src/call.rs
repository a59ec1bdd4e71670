//! Call model: interaction patterns, method descriptors and lifecycle.
//!
//! A call has two directions (caller to callee, callee to caller). Each one
//! starts [`CallState::Open`] and ends exactly once, either
//! [`CallState::Completed`] or [`CallState::Failed`]. Terminal states are
//! final; nothing is sent on a direction after it ended.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::protocol::{FrameKind, Header};
use crate::stream::InboundEvent;
use crate::writer::{OutboundFrame, WriterHandle};

/// Cardinality of requests and responses in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// One request, one response.
    Unary,
    /// One request, a stream of responses.
    ServerStreaming,
    /// A stream of requests, one response.
    ClientStreaming,
    /// Independent request and response streams.
    BidiStreaming,
}

impl Pattern {
    /// Whether the caller sends more than one message.
    pub fn client_streams(self) -> bool {
        matches!(self, Pattern::ClientStreaming | Pattern::BidiStreaming)
    }

    /// Whether the callee sends more than one message.
    pub fn server_streams(self) -> bool {
        matches!(self, Pattern::ServerStreaming | Pattern::BidiStreaming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pattern::Unary => "unary",
            Pattern::ServerStreaming => "server-streaming",
            Pattern::ClientStreaming => "client-streaming",
            Pattern::BidiStreaming => "bidi-streaming",
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of one operation: name, wire ID and pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub name: &'static str,
    pub id: u16,
    pub pattern: Pattern,
}

/// A named, immutable table of methods.
#[derive(Debug, Clone, Copy)]
pub struct ServiceDescriptor {
    pub name: &'static str,
    pub methods: &'static [MethodDescriptor],
}

impl ServiceDescriptor {
    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&'static MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Look up a method by wire ID.
    pub fn method_by_id(&self, id: u16) -> Option<&'static MethodDescriptor> {
        self.methods.iter().find(|m| m.id == id)
    }
}

/// Lifecycle of one direction of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    Open = 0,
    Completed = 1,
    Failed = 2,
}

impl CallState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallState::Open,
            1 => CallState::Completed,
            _ => CallState::Failed,
        }
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        self != CallState::Open
    }
}

/// Shared, lock-free lifecycle cell for one direction.
///
/// Both the side that owns the direction and the connection loop (which
/// observes peer failures) may end it; the first transition wins.
#[derive(Debug)]
pub struct DirectionState(AtomicU8);

impl DirectionState {
    pub fn new() -> Self {
        Self(AtomicU8::new(CallState::Open as u8))
    }

    #[inline]
    pub fn get(&self) -> CallState {
        CallState::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.get() == CallState::Open
    }

    /// Move from `Open` to `to`. Returns false if already terminal.
    pub fn finish(&self, to: CallState) -> bool {
        self.0
            .compare_exchange(
                CallState::Open as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for DirectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call options chosen by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Hard cutoff for the whole call, measured from its start.
    pub deadline: Option<Duration>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Caller-side registry of calls awaiting callee frames.
pub(crate) type PendingCalls = DashMap<u32, mpsc::Sender<InboundEvent>>;

/// Keeps a caller-side call registered until its response stream ends.
///
/// Dropping an armed guard abandons the call: it is unregistered and a
/// `CANCEL` frame tells the callee to stop.
pub(crate) struct CallGuard {
    method_id: u16,
    call_id: u32,
    calls: Arc<PendingCalls>,
    writer: WriterHandle,
    armed: bool,
}

impl CallGuard {
    pub(crate) fn new(
        method_id: u16,
        call_id: u32,
        calls: Arc<PendingCalls>,
        writer: WriterHandle,
    ) -> Self {
        Self {
            method_id,
            call_id,
            calls,
            writer,
            armed: true,
        }
    }

    /// The response stream ended normally or by callee failure.
    pub(crate) fn release(mut self) {
        self.armed = false;
        self.calls.remove(&self.call_id);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.calls.remove(&self.call_id);
        let header = Header::for_kind(self.method_id, FrameKind::Cancel, false, self.call_id, 0);
        if let Err(e) = self.writer.try_send_control(OutboundFrame::empty(&header)) {
            tracing::debug!(call_id = self.call_id, "Could not send CANCEL: {}", e);
        } else {
            tracing::debug!(call_id = self.call_id, "Call abandoned, CANCEL sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHODS: &[MethodDescriptor] = &[
        MethodDescriptor {
            name: "Echo",
            id: 1,
            pattern: Pattern::Unary,
        },
        MethodDescriptor {
            name: "Chat",
            id: 2,
            pattern: Pattern::BidiStreaming,
        },
    ];

    const SERVICE: ServiceDescriptor = ServiceDescriptor {
        name: "test.Service",
        methods: METHODS,
    };

    #[test]
    fn test_pattern_cardinality() {
        assert!(!Pattern::Unary.client_streams());
        assert!(!Pattern::Unary.server_streams());
        assert!(Pattern::ServerStreaming.server_streams());
        assert!(Pattern::ClientStreaming.client_streams());
        assert!(Pattern::BidiStreaming.client_streams());
        assert!(Pattern::BidiStreaming.server_streams());
    }

    #[test]
    fn test_service_lookup() {
        assert_eq!(SERVICE.method("Chat").unwrap().id, 2);
        assert_eq!(SERVICE.method_by_id(1).unwrap().name, "Echo");
        assert!(SERVICE.method("Missing").is_none());
        assert!(SERVICE.method_by_id(9).is_none());
    }

    #[test]
    fn test_direction_state_first_transition_wins() {
        let state = DirectionState::new();
        assert!(state.is_open());

        assert!(state.finish(CallState::Completed));
        assert!(!state.finish(CallState::Failed));
        assert_eq!(state.get(), CallState::Completed);
        assert!(state.get().is_terminal());
    }

    #[test]
    fn test_call_options_deadline() {
        let options = CallOptions::new().with_deadline(Duration::from_millis(250));
        assert_eq!(options.deadline, Some(Duration::from_millis(250)));
        assert_eq!(CallOptions::default().deadline, None);
    }
}
