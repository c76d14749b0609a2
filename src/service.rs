//! Service bindings: descriptors on one side, handlers on the other.
//!
//! A [`WebService`] pairs a [`ServiceDescriptor`] with the closures that
//! implement its methods. Descriptor lookups use the PascalCase protocol
//! name; handlers are keyed by the snake_case handler key. Handlers come
//! in two shapes per RPC kind: with or without a [`WebCall`] argument
//! carrying call metadata. The shape is fixed once at registration, and
//! because handlers are `Fn` closures no mutable state can be shared
//! between invocations.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use prost_reflect::{DynamicMessage, MethodDescriptor, ServiceDescriptor};
use tokio_stream::Stream;
use tonic::Status;
use tracing::trace;

use crate::metadata::Metadata;
use crate::names::{pascal_to_snake, snake_to_pascal};

/// A boxed future, the return shape of every registered handler.
pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The lazy message sequence produced by a server-streaming handler.
///
/// Consumed exactly once; each `next` may suspend.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<DynamicMessage, Status>> + Send>>;

type UnaryFn =
    Arc<dyn Fn(DynamicMessage, WebCall) -> BoxFuture<Result<DynamicMessage, Status>> + Send + Sync>;

type StreamingFn =
    Arc<dyn Fn(DynamicMessage, WebCall) -> BoxFuture<Result<MessageStream, Status>> + Send + Sync>;

/// Per-invocation context handed to `*_with_call` handlers. Read-only.
#[derive(Debug, Clone, Default)]
pub struct WebCall {
    metadata: Metadata,
}

impl WebCall {
    pub(crate) fn new(metadata: Metadata) -> Self {
        WebCall { metadata }
    }

    /// Inbound call metadata, normalized and key-ordered.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

#[derive(Clone)]
pub(crate) enum Handler {
    Unary(UnaryFn),
    ServerStreaming(StreamingFn),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Unary(_) => f.write_str("Handler::Unary"),
            Handler::ServerStreaming(_) => f.write_str("Handler::ServerStreaming"),
        }
    }
}

/// Whether a method produces one response message or a stream of them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RpcKind {
    /// One request message, one response message.
    Unary,
    /// One request message, a lazy sequence of response messages.
    ServerStreaming,
}

impl RpcKind {
    /// Decide the kind of `(service, method)` from the descriptor table.
    ///
    /// The lookup tolerates naming-convention drift (see
    /// [`WebService::resolve_method`]). A method whose descriptor cannot
    /// be located is treated as unary, preserving compatibility with
    /// services whose descriptor metadata is absent.
    pub fn detect(service: &WebService, method: &str) -> RpcKind {
        match service.resolve_method(method) {
            Some(descriptor) if descriptor.is_server_streaming() => RpcKind::ServerStreaming,
            _ => RpcKind::Unary,
        }
    }
}

/// A concrete service implementation plus its descriptor table.
#[derive(Clone)]
pub struct WebService {
    descriptor: ServiceDescriptor,
    handlers: HashMap<String, Handler>,
}

impl WebService {
    /// Bind an empty service to its descriptor.
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        WebService {
            descriptor,
            handlers: HashMap::new(),
        }
    }

    /// Register a unary handler that takes only the request message.
    pub fn unary<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(DynamicMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let handler: UnaryFn = Arc::new(move |request, _call| Box::pin(f(request)));
        self.handlers.insert(name.into(), Handler::Unary(handler));
        self
    }

    /// Register a unary handler that also receives the [`WebCall`].
    pub fn unary_with_call<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(DynamicMessage, WebCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let handler: UnaryFn = Arc::new(move |request, call| Box::pin(f(request, call)));
        self.handlers.insert(name.into(), Handler::Unary(handler));
        self
    }

    /// Register a server-streaming handler that takes only the request
    /// message. The returned stream is boxed internally.
    pub fn server_streaming<F, Fut, S>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(DynamicMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let handler: StreamingFn = Arc::new(move |request, _call| {
            let fut = f(request);
            Box::pin(async move { fut.await.map(|stream| Box::pin(stream) as MessageStream) })
        });
        self.handlers
            .insert(name.into(), Handler::ServerStreaming(handler));
        self
    }

    /// Register a server-streaming handler that also receives the
    /// [`WebCall`].
    pub fn server_streaming_with_call<F, Fut, S>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(DynamicMessage, WebCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, Status>> + Send + 'static,
        S: Stream<Item = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let handler: StreamingFn = Arc::new(move |request, call| {
            let fut = f(request, call);
            Box::pin(async move { fut.await.map(|stream| Box::pin(stream) as MessageStream) })
        });
        self.handlers
            .insert(name.into(), Handler::ServerStreaming(handler));
        self
    }

    /// The service's descriptor table.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Resolve a method descriptor, tolerating naming-convention drift:
    /// the key is tried verbatim, then snake→Pascal, then Pascal→snake.
    pub fn resolve_method(&self, method: &str) -> Option<MethodDescriptor> {
        let candidates = [
            method.to_owned(),
            snake_to_pascal(method),
            pascal_to_snake(method),
        ];

        for candidate in &candidates {
            if let Some(found) = self
                .descriptor
                .methods()
                .find(|descriptor| descriptor.name() == candidate)
            {
                trace!(method, resolved = candidate.as_str(), "resolved descriptor");
                return Some(found);
            }
        }

        None
    }

    /// Look up the handler for a method, trying the key verbatim and
    /// then its snake_case form.
    pub(crate) fn handler(&self, method: &str) -> Option<&Handler> {
        self.handlers
            .get(method)
            .or_else(|| self.handlers.get(&pascal_to_snake(method)))
    }
}

impl fmt::Debug for WebService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebService")
            .field("service", &self.descriptor.full_name())
            .field("handlers", &self.handlers.keys())
            .finish()
    }
}
