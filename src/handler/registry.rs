//! Routing table from method IDs to handlers.
//!
//! # Example
//!
//! ```
//! use calcwire::call::{MethodDescriptor, Pattern};
//! use calcwire::handler::Router;
//!
//! static DOUBLE: MethodDescriptor = MethodDescriptor {
//!     name: "Double",
//!     id: 1,
//!     pattern: Pattern::Unary,
//! };
//!
//! let router = Router::new().unary(&DOUBLE, |n: i64| async move { Ok::<_, calcwire::Status>(n * 2) });
//! assert_eq!(router.method(1).map(|m| m.name), Some("Double"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::context::{finish, single_request, ServerCall};
use crate::call::{CallState, MethodDescriptor, Pattern};
use crate::error::{Result, RpcError};
use crate::protocol::RESERVED_METHOD_ID;
use crate::status::Status;
use crate::stream::{Sink, Streaming};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Drives one call to completion and reports the final state of its
/// response direction.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, call: ServerCall) -> BoxFuture<'static, CallState>;
}

/// One request, one response.
pub struct UnaryHandler<F, Req, Resp> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<F, Req, Resp, Fut> Handler for UnaryHandler<F, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, Status>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, CallState> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let (mut requests, responses) = call.into_parts::<Req, Resp>();
            let outcome = match single_request(&mut requests).await {
                Ok(request) => match (*handler)(request).await {
                    Ok(response) => responses.send(&response).await.map_err(Status::from),
                    Err(status) => Err(status),
                },
                Err(status) => Err(status),
            };
            finish(&responses, outcome).await
        })
    }
}

/// One request, a stream of responses.
pub struct ServerStreamingHandler<F, Req, Resp> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<F, Req, Resp, Fut> Handler for ServerStreamingHandler<F, Req, Resp>
where
    F: Fn(Req, Sink<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, CallState> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let (mut requests, responses) = call.into_parts::<Req, Resp>();
            let outcome = match single_request(&mut requests).await {
                Ok(request) => (*handler)(request, responses.clone()).await,
                Err(status) => Err(status),
            };
            finish(&responses, outcome).await
        })
    }
}

/// A stream of requests, one response.
pub struct ClientStreamingHandler<F, Req, Resp> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<F, Req, Resp, Fut> Handler for ClientStreamingHandler<F, Req, Resp>
where
    F: Fn(Streaming<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, Status>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, CallState> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let (requests, responses) = call.into_parts::<Req, Resp>();
            let outcome = match (*handler)(requests).await {
                Ok(response) => responses.send(&response).await.map_err(Status::from),
                Err(status) => Err(status),
            };
            finish(&responses, outcome).await
        })
    }
}

/// Independent request and response streams.
pub struct BidiStreamingHandler<F, Req, Resp> {
    handler: Arc<F>,
    _phantom: PhantomData<fn(Req) -> Resp>,
}

impl<F, Req, Resp, Fut> Handler for BidiStreamingHandler<F, Req, Resp>
where
    F: Fn(Streaming<Req>, Sink<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    fn call(&self, call: ServerCall) -> BoxFuture<'static, CallState> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let (requests, responses) = call.into_parts::<Req, Resp>();
            let outcome = (*handler)(requests, responses.clone()).await;
            finish(&responses, outcome).await
        })
    }
}

struct Route {
    method: &'static MethodDescriptor,
    handler: Box<dyn Handler>,
}

/// Maps method IDs to handlers.
///
/// Built once before serving and shared read-only by every connection.
#[derive(Default)]
pub struct Router {
    routes: HashMap<u16, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `method`. A later registration for the same
    /// ID replaces the earlier one.
    ///
    /// # Panics
    ///
    /// Panics if `method` uses the reserved ID 0.
    pub fn route<H: Handler>(mut self, method: &'static MethodDescriptor, handler: H) -> Self {
        assert_ne!(
            method.id, RESERVED_METHOD_ID,
            "method {} uses reserved ID 0",
            method.name
        );
        if self.routes.contains_key(&method.id) {
            tracing::warn!(method = method.name, id = method.id, "Replacing existing route");
        }
        self.routes.insert(
            method.id,
            Route {
                method,
                handler: Box::new(handler),
            },
        );
        self
    }

    /// # Panics
    ///
    /// Panics if `method` is not [`Pattern::Unary`].
    pub fn unary<F, Req, Resp, Fut>(self, method: &'static MethodDescriptor, handler: F) -> Self
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, Status>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        check_pattern(method, Pattern::Unary);
        self.route(
            method,
            UnaryHandler {
                handler: Arc::new(handler),
                _phantom: PhantomData,
            },
        )
    }

    /// # Panics
    ///
    /// Panics if `method` is not [`Pattern::ServerStreaming`].
    pub fn server_streaming<F, Req, Resp, Fut>(
        self,
        method: &'static MethodDescriptor,
        handler: F,
    ) -> Self
    where
        F: Fn(Req, Sink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        check_pattern(method, Pattern::ServerStreaming);
        self.route(
            method,
            ServerStreamingHandler {
                handler: Arc::new(handler),
                _phantom: PhantomData,
            },
        )
    }

    /// # Panics
    ///
    /// Panics if `method` is not [`Pattern::ClientStreaming`].
    pub fn client_streaming<F, Req, Resp, Fut>(
        self,
        method: &'static MethodDescriptor,
        handler: F,
    ) -> Self
    where
        F: Fn(Streaming<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, Status>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        check_pattern(method, Pattern::ClientStreaming);
        self.route(
            method,
            ClientStreamingHandler {
                handler: Arc::new(handler),
                _phantom: PhantomData,
            },
        )
    }

    /// # Panics
    ///
    /// Panics if `method` is not [`Pattern::BidiStreaming`].
    pub fn bidi_streaming<F, Req, Resp, Fut>(
        self,
        method: &'static MethodDescriptor,
        handler: F,
    ) -> Self
    where
        F: Fn(Streaming<Req>, Sink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        check_pattern(method, Pattern::BidiStreaming);
        self.route(
            method,
            BidiStreamingHandler {
                handler: Arc::new(handler),
                _phantom: PhantomData,
            },
        )
    }

    /// Get the method registered under `id`.
    pub fn method(&self, id: u16) -> Option<&'static MethodDescriptor> {
        self.routes.get(&id).map(|r| r.method)
    }

    /// Get the handler registered under `id`.
    pub fn handler(&self, id: u16) -> Option<&dyn Handler> {
        self.routes.get(&id).map(|r| r.handler.as_ref())
    }

    /// All registered methods, in no particular order.
    pub fn methods(&self) -> impl Iterator<Item = &'static MethodDescriptor> + '_ {
        self.routes.values().map(|r| r.method)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Start the handler for `call`.
    pub fn dispatch(&self, call: ServerCall) -> Result<BoxFuture<'static, CallState>> {
        let id = call.method().id;
        let handler = self.handler(id).ok_or(RpcError::UnknownMethod(id))?;
        Ok(handler.call(call))
    }
}

fn check_pattern(method: &MethodDescriptor, expected: Pattern) {
    assert_eq!(
        method.pattern, expected,
        "method {} is {}, registered as {}",
        method.name, method.pattern, expected
    );
}
