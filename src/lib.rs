//! grpc-web transport bridging for descriptor-driven services.
//!
//! Browsers cannot speak native gRPC: they have no access to HTTP/2
//! trailers or raw frames. `webgrpc` bridges the gap on both sides of the
//! wire. On the server it turns a single HTTP/1.1 POST carrying a
//! length-prefixed request message into an invocation of a registered
//! handler, and turns the handler's response (one message, or a stream of
//! messages) into a length-prefixed body terminated by an in-body trailer
//! frame. On the client it performs the symmetric transformation.
//!
//! Services are described at runtime by [`prost_reflect`] descriptors, so
//! no generated stubs are required; request and response payloads are
//! [`prost_reflect::DynamicMessage`] values carried in either protobuf or
//! JSON form depending on the negotiated content type.
//!
//! ## Serving
//!
//! Routing is deliberately out of scope: whatever HTTP layer you use
//! resolves the `/package.Service/Method` path and hands the method name
//! plus the request to a [`GrpcWebHandler`]:
//!
//! ```ignore
//! let service = WebService::new(descriptor)
//!     .unary("say_hello", |req| async move { Ok(req) })
//!     .server_streaming("repeat_hello", |req| async move {
//!         Ok(tokio_stream::iter(vec![Ok(req)]))
//!     });
//!
//! let handler = GrpcWebHandler::new(service);
//! // inside your router:
//! let response = handler.call("SayHello", request).await;
//! ```
//!
//! Unary responses are buffered; server-streaming responses are delivered
//! incrementally, one HTTP chunk per frame, either through the
//! [`http_body::Body`] implementation of [`WebBody`] or by writing the
//! raw chunked encoding to a transport socket with [`write_chunked`].
//!
//! ## Calling
//!
//! [`GrpcWebClient`] drives the client half over any
//! [`tower_service::Service`] that speaks HTTP, mapping transport
//! failures and HTTP status codes onto [`tonic::Status`] values.
//!
//! ## Limitations
//!
//! * Only unary and server-streaming calls are supported; grpc-web
//!   clients cannot perform client or bi-directional streaming.
//! * There is no support for message compression or web socket
//!   transports.

#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

pub use body::{write_chunked, FrameStream, WebBody};
pub use client::{GrpcWebClient, ResponseMessages};
pub use codec::MethodCodec;
pub use content_type::{negotiate, ContentKind, Encoding, Negotiation, WireFormat};
pub use cors::cors_layer;
pub use error::ProtocolError;
pub use frame::Frame;
pub use metadata::Metadata;
pub use server::{ErrorObserver, GrpcWebHandler};
pub use service::{MessageStream, RpcKind, WebCall, WebService};
pub use trailers::Trailers;

pub mod body;
pub mod client;
pub mod codec;
pub mod content_type;
pub mod cors;
pub mod error;
pub mod frame;
pub mod metadata;
pub mod names;
pub mod server;
pub mod service;
pub mod trailers;

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) mod util {
    pub(crate) mod base64 {
        use base64::{
            alphabet,
            engine::{
                general_purpose::{GeneralPurpose, GeneralPurposeConfig},
                DecodePaddingMode,
            },
        };

        pub(crate) const STANDARD: GeneralPurpose = GeneralPurpose::new(
            &alphabet::STANDARD,
            GeneralPurposeConfig::new()
                .with_encode_padding(true)
                .with_decode_padding_mode(DecodePaddingMode::Indifferent),
        );
    }
}
