//! The server-side transport adapter.
//!
//! [`GrpcWebHandler`] accepts a fully routed invocation: the HTTP layer
//! that owns URL dispatch hands over the method name and the raw
//! request. The handler validates the HTTP method and content types,
//! extracts call metadata, decodes the request frame, dispatches to the
//! unary or streaming path, and produces an `http::Response` whose body
//! is either fully buffered (unary) or chunk-per-frame (streaming).
//!
//! Failures before the handler runs map onto plain HTTP statuses: 404
//! with `X-Cascade: pass` for non-POST or unroutable methods (so
//! upstream dispatch chains can keep searching), 415 for foreign content
//! types, 422 for undecodable bodies, 500 for transport faults. Once a
//! handler has been invoked the HTTP status is committed to 200 and all
//! failures travel in-band as trailer frames.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use prost_reflect::DynamicMessage;
use tonic::{Code, Status};
use tracing::{debug, trace};

use crate::body::{FrameStream, WebBody};
use crate::codec::MethodCodec;
use crate::content_type::{negotiate, Negotiation};
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::metadata::Metadata;
use crate::service::{Handler, MessageStream, RpcKind, WebCall, WebService};
use crate::trailers;
use crate::BoxError;

/// Process-wide callback invoked for failures the pipeline itself
/// produces (undecodable requests, unencodable responses, transport
/// faults). May be called from any worker concurrently.
pub type ErrorObserver = Arc<dyn Fn(&(dyn std::error::Error + 'static)) + Send + Sync>;

// Header telling upstream dispatch chains to keep searching.
const X_CASCADE: &str = "x-cascade";
// Disables proxy buffering so streamed chunks reach the browser.
const X_ACCEL_BUFFERING: &str = "x-accel-buffering";

/// Serves grpc-web requests for one [`WebService`].
#[derive(Clone)]
pub struct GrpcWebHandler {
    service: Arc<WebService>,
    on_error: Option<ErrorObserver>,
}

impl GrpcWebHandler {
    /// Wrap a service.
    pub fn new(service: WebService) -> Self {
        GrpcWebHandler {
            service: Arc::new(service),
            on_error: None,
        }
    }

    /// Install the error observer.
    pub fn with_error_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(observer));
        self
    }

    /// The service this handler serves.
    pub fn service(&self) -> &WebService {
        &self.service
    }

    /// Handle one routed invocation.
    ///
    /// `method` is the URL path segment, typically the PascalCase
    /// protocol name; handler and descriptor lookup tolerate either
    /// naming convention. Always produces a response; failures never
    /// propagate to the caller.
    pub async fn call<B>(&self, method: &str, request: Request<B>) -> Response<WebBody>
    where
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        if request.method() != Method::POST {
            debug!(http_method = %request.method(), "rejecting non-POST grpc-web request");
            return cascade_not_found();
        }

        let negotiation = match negotiate(request.headers()) {
            Ok(negotiation) => negotiation,
            Err(e) => {
                debug!(error = %e, "rejecting request");
                return plain_response(e.http_status());
            }
        };

        let (Some(descriptor), Some(handler)) = (
            self.service.resolve_method(method),
            self.service.handler(method).cloned(),
        ) else {
            debug!(method, service = self.service.descriptor().full_name(), "unknown method");
            return cascade_not_found();
        };

        let kind = RpcKind::detect(&self.service, method);
        trace!(method, ?kind, accept = ?negotiation.response_content_type);

        let metadata = Metadata::from_headers(request.headers());
        let codec = MethodCodec::new(descriptor);

        let message = match decode_request(&codec, &negotiation, request).await {
            Ok(message) => message,
            Err(e) => {
                self.observe(&e);
                return plain_response(e.http_status());
            }
        };

        let call = WebCall::new(metadata);

        match (kind, handler) {
            (RpcKind::Unary, Handler::Unary(invoke)) => {
                self.unary_response(invoke(message, call).await, &codec, &negotiation)
            }
            (RpcKind::ServerStreaming, Handler::ServerStreaming(invoke)) => {
                // A refused stream still answers in streaming shape: a
                // single trailer frame.
                let source = match invoke(message, call).await {
                    Ok(source) => source,
                    Err(status) => {
                        Box::pin(tokio_stream::once(Err(status))) as MessageStream
                    }
                };
                self.streaming_response(source, codec, &negotiation)
            }
            (kind, _) => {
                let status = Status::internal(format!(
                    "registered handler does not match {kind:?} method {method}",
                ));
                self.unary_response(Err(status), &codec, &negotiation)
            }
        }
    }

    fn unary_response(
        &self,
        result: Result<DynamicMessage, Status>,
        codec: &MethodCodec,
        negotiation: &Negotiation,
    ) -> Response<WebBody> {
        let framed = match result {
            Ok(message) => match codec.encode_response(negotiation.response.wire, &message) {
                Ok(bytes) => {
                    let trailer = ok_trailer();
                    let payload = Frame::payload(bytes).pack();
                    let mut body = BytesMut::with_capacity(payload.len() + trailer.len());
                    body.put_slice(&payload);
                    body.put_slice(&trailer);
                    body.freeze()
                }
                Err(e) => {
                    self.observe(&e);
                    status_trailer(&Status::unknown(e.to_string()))
                }
            },
            Err(status) => status_trailer(&status),
        };

        let body = negotiation.response.encoding.encode_blob(framed);

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, negotiation.response_content_type)
            .body(WebBody::full(body))
            .unwrap()
    }

    fn streaming_response(
        &self,
        source: MessageStream,
        codec: MethodCodec,
        negotiation: &Negotiation,
    ) -> Response<WebBody> {
        let frames = FrameStream::new(
            source,
            codec,
            negotiation.response.wire,
            negotiation.response.encoding,
            self.on_error.clone(),
        );

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, negotiation.response_content_type)
            .header(
                CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            )
            .header(X_ACCEL_BUFFERING, HeaderValue::from_static("no"))
            .body(WebBody::streaming(frames))
            .unwrap()
    }

    fn observe(&self, error: &(dyn std::error::Error + 'static)) {
        if let Some(observer) = &self.on_error {
            observer(error);
        }
    }
}

impl fmt::Debug for GrpcWebHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcWebHandler")
            .field("service", &self.service)
            .finish()
    }
}

async fn decode_request<B>(
    codec: &MethodCodec,
    negotiation: &Negotiation,
    request: Request<B>,
) -> Result<DynamicMessage, ProtocolError>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let body = request
        .into_body()
        .collect()
        .await
        .map_err(|e| ProtocolError::BodyRead(e.into()))?
        .to_bytes();

    let framed = negotiation.request.encoding.decode_blob(body)?;
    let payload = Frame::unpack(framed)?
        .into_iter()
        .find(|frame| !frame.is_trailer())
        .ok_or(ProtocolError::MalformedFrame("request has no payload frame"))?;

    codec.decode_request(negotiation.request.wire, payload.into_body())
}

fn ok_trailer() -> Bytes {
    status_trailer(&Status::new(Code::Ok, "OK"))
}

fn status_trailer(status: &Status) -> Bytes {
    Frame::trailer(trailers::encode_block(status)).pack()
}

fn plain_response(status: StatusCode) -> Response<WebBody> {
    Response::builder()
        .status(status)
        .body(WebBody::empty())
        .unwrap()
}

// `pass` lets upstream dispatch chains keep searching for a handler.
fn cascade_not_found() -> Response<WebBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(X_CASCADE, HeaderValue::from_static("pass"))
        .body(WebBody::empty())
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_type::{
        Encoding, GRPC_WEB_PROTO, GRPC_WEB_TEXT_PROTO,
    };
    use crate::testing::echo_service;
    use http_body_util::Full;
    use prost_reflect::Value;

    fn shout_service() -> WebService {
        WebService::new(echo_service()).unary_with_call("say_hello", |request, call| async move {
            let text = request
                .get_field_by_name("text")
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();

            if text.is_empty() {
                return Err(Status::invalid_argument("text must not be empty"));
            }

            let suffix = call
                .metadata()
                .get_str("x_suffix")
                .unwrap_or("")
                .to_owned();

            let mut reply = DynamicMessage::new(
                echo_service().methods().next().unwrap().output(),
            );
            reply.set_field_by_name("text", Value::String(format!("{text}{suffix}")));
            Ok(reply)
        })
    }

    fn request_message(text: &str) -> Bytes {
        let codec = MethodCodec::new(echo_service().methods().next().unwrap());
        let mut message = DynamicMessage::new(codec.method().input());
        message.set_field_by_name("text", Value::String(text.to_owned()));
        codec
            .encode_request(crate::content_type::WireFormat::Proto, &message)
            .unwrap()
    }

    fn post(content_type: &str, body: Bytes) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/test.Echo/SayHello")
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(body))
            .unwrap()
    }

    async fn body_bytes(response: Response<WebBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    fn decoded_text(frame: &Frame) -> String {
        let codec = MethodCodec::new(echo_service().methods().next().unwrap());
        let message = codec
            .decode_response(crate::content_type::WireFormat::Proto, frame.body().clone())
            .unwrap();
        message
            .get_field_by_name("text")
            .unwrap()
            .as_str()
            .unwrap()
            .to_owned()
    }

    #[tokio::test]
    async fn unary_success_binary() {
        let handler = GrpcWebHandler::new(shout_service());
        let request = post(GRPC_WEB_PROTO, Frame::payload(request_message("hi")).pack());

        let response = handler.call("SayHello", request).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            GRPC_WEB_PROTO
        );

        let frames = Frame::unpack(body_bytes(response).await).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].is_trailer());
        assert_eq!(decoded_text(&frames[0]), "hi");

        let trailers = trailers::parse_block(frames[1].body());
        assert_eq!(trailers.code, Code::Ok);
        assert_eq!(trailers.message, "OK");
    }

    #[tokio::test]
    async fn unary_success_text() {
        let handler = GrpcWebHandler::new(shout_service());
        let framed = Frame::payload(request_message("hi")).pack();
        let request = post(GRPC_WEB_TEXT_PROTO, Encoding::Base64.encode_blob(framed));

        let response = handler.call("SayHello", request).await;

        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            GRPC_WEB_TEXT_PROTO
        );

        // The whole unary body is one base64 blob.
        let blob = body_bytes(response).await;
        let frames = Frame::unpack(Encoding::Base64.decode_blob(blob).unwrap()).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_trailer());
    }

    #[tokio::test]
    async fn metadata_reaches_the_handler() {
        let handler = GrpcWebHandler::new(shout_service());
        let mut request = post(GRPC_WEB_PROTO, Frame::payload(request_message("hi")).pack());
        request
            .headers_mut()
            .insert("X-Suffix", HeaderValue::from_static("!"));

        let response = handler.call("SayHello", request).await;

        let frames = Frame::unpack(body_bytes(response).await).unwrap();
        assert_eq!(decoded_text(&frames[0]), "hi!");
    }

    #[tokio::test]
    async fn status_failure_is_a_trailer_only_200() {
        let handler = GrpcWebHandler::new(shout_service());
        let request = post(GRPC_WEB_PROTO, Frame::payload(request_message("")).pack());

        let response = handler.call("SayHello", request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let frames = Frame::unpack(body_bytes(response).await).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_trailer());

        let trailers = trailers::parse_block(frames[0].body());
        assert_eq!(trailers.code, Code::InvalidArgument);
        assert_eq!(trailers.message, "text must not be empty");
    }

    #[tokio::test]
    async fn non_post_cascades_404() {
        let handler = GrpcWebHandler::new(shout_service());
        let request = Request::builder()
            .method(Method::GET)
            .header(CONTENT_TYPE, GRPC_WEB_PROTO)
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = handler.call("SayHello", request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("x-cascade").unwrap(), "pass");
    }

    #[tokio::test]
    async fn unknown_method_cascades_404() {
        let handler = GrpcWebHandler::new(shout_service());
        let request = post(GRPC_WEB_PROTO, Frame::payload(request_message("hi")).pack());

        let response = handler.call("NoSuchMethod", request).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("x-cascade").unwrap(), "pass");
    }

    #[tokio::test]
    async fn foreign_content_type_is_415() {
        let handler = GrpcWebHandler::new(shout_service());
        let request = post("application/json", Bytes::from_static(b"{}"));

        let response = handler.call("SayHello", request).await;

        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_422_and_observed() {
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = observed.clone();
        let handler = GrpcWebHandler::new(shout_service()).with_error_observer(move |error| {
            sink.lock().unwrap().push(error.to_string());
        });

        let request = post(GRPC_WEB_PROTO, Bytes::from_static(b"\x00\x00\x00"));
        let response = handler.call("SayHello", request).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(observed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_422() {
        let handler = GrpcWebHandler::new(shout_service());
        // Claims a 10-byte length-delimited field but carries 2 bytes.
        let request = post(
            GRPC_WEB_PROTO,
            Frame::payload(Bytes::from_static(b"\x0a\x0ahi")).pack(),
        );

        let response = handler.call("SayHello", request).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn handler_kind_mismatch_is_an_internal_trailer() {
        // repeat_hello is server-streaming in the descriptor but
        // registered here as unary.
        let service = WebService::new(echo_service())
            .unary("repeat_hello", |request| async move { Ok(request) });
        let handler = GrpcWebHandler::new(service);

        let request = post(GRPC_WEB_PROTO, Frame::payload(request_message("hi")).pack());
        let response = handler.call("RepeatHello", request).await;

        assert_eq!(response.status(), StatusCode::OK);
        let frames = Frame::unpack(body_bytes(response).await).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            trailers::parse_block(frames[0].body()).code,
            Code::Internal
        );
    }
}
