//! The client-side executor.
//!
//! [`GrpcWebClient`] drives the symmetric path: it frames a request
//! message, POSTs it through a generic inner HTTP [`Service`],
//! classifies the HTTP response, and runs the body back through the
//! text transform, the frame codec, and the trailer parser. Unary calls
//! yield one decoded message; server-streaming calls yield a lazily
//! decoding iterator over the buffered payload frames, so a trailer
//! carrying an error surfaces when the call returns rather than
//! mid-iteration.

use std::fmt;

use bytes::Bytes;
use http::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use http::uri::{PathAndQuery, Uri};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use prost_reflect::{DynamicMessage, MethodDescriptor};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tower_service::Service;
use tracing::trace;

use crate::codec::MethodCodec;
use crate::content_type::{Encoding, WireFormat, GRPC_WEB_PROTO};
use crate::frame::Frame;
use crate::trailers;
use crate::BoxError;

/// Executes grpc-web calls against one endpoint over an inner HTTP
/// service.
pub struct GrpcWebClient<S> {
    inner: S,
    origin: Uri,
}

impl<S> GrpcWebClient<S> {
    /// Wrap an HTTP service rooted at `origin` (scheme and authority;
    /// any path is replaced per call).
    pub fn new(inner: S, origin: Uri) -> Self {
        GrpcWebClient { inner, origin }
    }
}

impl<S> GrpcWebClient<S> {
    /// Invoke a unary method and return its single response message.
    pub async fn unary<B>(
        &mut self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        metadata: MetadataMap,
    ) -> Result<DynamicMessage, Status>
    where
        S: Service<Request<Full<Bytes>>, Response = Response<B>>,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (mut payloads, codec) = self.execute(method, request, metadata).await?;

        let payload = payloads
            .next()
            .ok_or_else(|| Status::internal("response is missing a payload frame"))?;
        codec
            .decode_response(WireFormat::Proto, payload.into_body())
            .map_err(|e| Status::internal(e.to_string()))
    }

    /// Invoke a server-streaming method and return its messages.
    ///
    /// A non-zero trailer status fails the call itself; the returned
    /// iterator only ever yields decoding failures.
    pub async fn server_streaming<B>(
        &mut self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        metadata: MetadataMap,
    ) -> Result<ResponseMessages, Status>
    where
        S: Service<Request<Full<Bytes>>, Response = Response<B>>,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let (payloads, codec) = self.execute(method, request, metadata).await?;

        Ok(ResponseMessages { payloads, codec })
    }

    async fn execute<B>(
        &mut self,
        method: &MethodDescriptor,
        request: DynamicMessage,
        metadata: MetadataMap,
    ) -> Result<(std::vec::IntoIter<Frame>, MethodCodec), Status>
    where
        S: Service<Request<Full<Bytes>>, Response = Response<B>>,
        S::Error: Into<BoxError>,
        B: http_body::Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        let codec = MethodCodec::new(method.clone());
        let payload = codec
            .encode_request(WireFormat::Proto, &request)
            .map_err(|e| Status::internal(e.to_string()))?;

        let uri = self.method_uri(method)?;
        trace!(uri = %uri, "dispatching grpc-web call");

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(Frame::payload(payload).pack()))
            .map_err(|e| Status::internal(format!("invalid request: {e}")))?;

        request.headers_mut().extend(metadata.into_headers());
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_WEB_PROTO));
        request
            .headers_mut()
            .insert(ACCEPT, HeaderValue::from_static(GRPC_WEB_PROTO));
        request
            .headers_mut()
            .insert("x-grpc-web", HeaderValue::from_static("1"));

        std::future::poll_fn(|cx| self.inner.poll_ready(cx))
            .await
            .map_err(transport_unavailable)?;
        let response = self
            .inner
            .call(request)
            .await
            .map_err(transport_unavailable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Status::new(
                code_from_http(status),
                format!("unexpected HTTP status {status}"),
            ));
        }

        let encoding = Encoding::from_headers(response.headers());
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(transport_unavailable)?
            .to_bytes();

        let framed = encoding
            .decode_blob(body)
            .map_err(|e| Status::internal(e.to_string()))?;
        let frames = Frame::unpack(framed).map_err(|e| Status::internal(e.to_string()))?;

        let trailers = frames
            .iter()
            .find(|frame| frame.is_trailer())
            .map(|frame| trailers::parse_block(frame.body()))
            .ok_or_else(|| Status::internal("response is missing a trailer frame"))?;

        if !trailers.is_ok() {
            return Err(Status::with_metadata(
                trailers.code,
                trailers.message,
                trailers.metadata,
            ));
        }

        let payloads: Vec<Frame> = frames
            .into_iter()
            .filter(|frame| !frame.is_trailer())
            .collect();

        Ok((payloads.into_iter(), codec))
    }

    fn method_uri(&self, method: &MethodDescriptor) -> Result<Uri, Status> {
        let path = format!(
            "/{}/{}",
            method.parent_service().full_name(),
            method.name()
        );

        let mut parts = self.origin.clone().into_parts();
        parts.path_and_query = Some(
            path.parse::<PathAndQuery>()
                .map_err(|e| Status::internal(format!("invalid method path: {e}")))?,
        );
        Uri::from_parts(parts).map_err(|e| Status::internal(format!("invalid endpoint: {e}")))
    }
}

impl<S> fmt::Debug for GrpcWebClient<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcWebClient")
            .field("origin", &self.origin)
            .finish()
    }
}

/// Messages of a server-streaming response, decoded on demand.
pub struct ResponseMessages {
    payloads: std::vec::IntoIter<Frame>,
    codec: MethodCodec,
}

impl Iterator for ResponseMessages {
    type Item = Result<DynamicMessage, Status>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.payloads.next()?;
        Some(
            self.codec
                .decode_response(WireFormat::Proto, frame.into_body())
                .map_err(|e| Status::internal(e.to_string())),
        )
    }
}

impl fmt::Debug for ResponseMessages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseMessages")
            .field("remaining", &self.payloads.len())
            .finish()
    }
}

fn transport_unavailable(error: impl Into<BoxError>) -> Status {
    Status::unavailable(format!("transport failure: {}", error.into()))
}

// Borrowed from the grpc http status mapping: statuses a proxy or server
// may synthesize before any grpc processing happens.
fn code_from_http(status: StatusCode) -> Code {
    match status {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    }
}
