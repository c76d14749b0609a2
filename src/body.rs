//! Response bodies and streaming delivery.
//!
//! [`FrameStream`] is the streaming state machine: it pulls messages
//! from the handler's lazy sequence one at a time, emits one encoded
//! frame per message, and terminates with exactly one trailer frame on
//! every path, including the empty sequence and mid-stream failure. A
//! frame is flushed before the next message is requested, so nothing is
//! buffered ahead of the wire.
//!
//! [`WebBody`] adapts both delivery shapes to [`http_body::Body`];
//! [`write_chunked`] produces the identical byte stream on a raw
//! transport socket for servers that hand over the connection.

use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::Response;
use http_body::{Body, Frame as BodyFrame, SizeHint};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_stream::{Stream, StreamExt};
use tonic::{Code, Status};
use tracing::debug;

use crate::codec::MethodCodec;
use crate::content_type::{Encoding, WireFormat};
use crate::frame::Frame;
use crate::server::ErrorObserver;
use crate::service::MessageStream;
use crate::trailers;

enum StreamState {
    Streaming,
    Done,
}

/// Lazily encodes a handler's message stream into grpc-web frames.
///
/// Yields one chunk per payload frame in source order, then one trailer
/// chunk. In text mode each chunk is base64-encoded independently.
pub struct FrameStream {
    source: MessageStream,
    codec: MethodCodec,
    wire: WireFormat,
    encoding: Encoding,
    on_error: Option<ErrorObserver>,
    state: StreamState,
}

impl FrameStream {
    pub(crate) fn new(
        source: MessageStream,
        codec: MethodCodec,
        wire: WireFormat,
        encoding: Encoding,
        on_error: Option<ErrorObserver>,
    ) -> Self {
        FrameStream {
            source,
            codec,
            wire,
            encoding,
            on_error,
            state: StreamState::Streaming,
        }
    }

    fn trailer_chunk(&self, status: &Status) -> Bytes {
        self.encoding
            .encode_frame(Frame::trailer(trailers::encode_block(status)).pack())
    }
}

impl Stream for FrameStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let StreamState::Done = this.state {
            return Poll::Ready(None);
        }

        let chunk = match ready!(this.source.as_mut().poll_next(cx)) {
            Some(Ok(message)) => match this.codec.encode_response(this.wire, &message) {
                Ok(bytes) => this.encoding.encode_frame(Frame::payload(bytes).pack()),
                Err(e) => {
                    // The message cannot be represented on the wire;
                    // report in-band and stop pulling from the source.
                    if let Some(observer) = &this.on_error {
                        observer(&e);
                    }
                    this.state = StreamState::Done;
                    this.trailer_chunk(&Status::unknown(e.to_string()))
                }
            },
            Some(Err(status)) => {
                this.state = StreamState::Done;
                this.trailer_chunk(&status)
            }
            None => {
                this.state = StreamState::Done;
                this.trailer_chunk(&Status::new(Code::Ok, "OK"))
            }
        };

        Poll::Ready(Some(chunk))
    }
}

impl fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameStream")
            .field("method", &self.codec.method().full_name())
            .field("wire", &self.wire)
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Response body for both delivery shapes.
///
/// Unary responses are a single buffered chunk; streaming responses
/// yield one chunk per frame. Errors never surface through the body:
/// they are reported in-band via trailer frames.
#[derive(Debug, Default)]
pub struct WebBody {
    inner: WebBodyInner,
}

#[derive(Default)]
enum WebBodyInner {
    #[default]
    Empty,
    Full(Option<Bytes>),
    Streaming(FrameStream),
}

impl WebBody {
    /// An empty body.
    pub fn empty() -> Self {
        WebBody {
            inner: WebBodyInner::Empty,
        }
    }

    /// A fully buffered body.
    pub fn full(bytes: Bytes) -> Self {
        WebBody {
            inner: WebBodyInner::Full(Some(bytes)),
        }
    }

    pub(crate) fn streaming(frames: FrameStream) -> Self {
        WebBody {
            inner: WebBodyInner::Streaming(frames),
        }
    }
}

impl Body for WebBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<BodyFrame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            WebBodyInner::Empty => Poll::Ready(None),
            WebBodyInner::Full(bytes) => {
                Poll::Ready(bytes.take().map(|data| Ok(BodyFrame::data(data))))
            }
            WebBodyInner::Streaming(frames) => Poll::Ready(
                ready!(Pin::new(frames).poll_next(cx)).map(|chunk| Ok(BodyFrame::data(chunk))),
            ),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            WebBodyInner::Empty => true,
            WebBodyInner::Full(bytes) => bytes.is_none(),
            WebBodyInner::Streaming(frames) => matches!(frames.state, StreamState::Done),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            WebBodyInner::Empty => SizeHint::with_exact(0),
            WebBodyInner::Full(bytes) => {
                SizeHint::with_exact(bytes.as_ref().map(|b| b.len() as u64).unwrap_or(0))
            }
            WebBodyInner::Streaming(_) => SizeHint::default(),
        }
    }
}

impl fmt::Debug for WebBodyInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebBodyInner::Empty => f.write_str("Empty"),
            WebBodyInner::Full(_) => f.write_str("Full"),
            WebBodyInner::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// Deliver a response by taking over the transport socket.
///
/// Writes the status line, the response headers plus `Transfer-Encoding:
/// chunked` and `Connection: keep-alive`, then one HTTP chunk per body
/// chunk (`hex length CRLF, bytes CRLF`) and the terminating
/// `0\r\n\r\n`. The chunk payloads are byte-identical to what the
/// [`http_body::Body`] implementation yields.
///
/// Once the headers have been flushed the client is committed to: any
/// later socket error stops iteration, is logged, and is swallowed.
pub async fn write_chunked<W>(io: &mut W, response: Response<WebBody>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (mut parts, body) = response.into_parts();

    parts
        .headers
        .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or("")
    )
    .into_bytes();
    for (name, value) in parts.headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    // Failures up to here propagate: nothing has been promised yet.
    io.write_all(&head).await?;
    io.flush().await?;

    match write_body(io, body).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(error = %e, "socket closed mid-stream, dropping response tail");
            Ok(())
        }
    }
}

async fn write_body<W>(io: &mut W, body: WebBody) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match body.inner {
        WebBodyInner::Empty => {}
        WebBodyInner::Full(bytes) => {
            if let Some(chunk) = bytes.filter(|b| !b.is_empty()) {
                write_chunk(io, &chunk).await?;
            }
        }
        WebBodyInner::Streaming(mut frames) => {
            while let Some(chunk) = frames.next().await {
                write_chunk(io, &chunk).await?;
            }
        }
    }

    io.write_all(b"0\r\n\r\n").await?;
    io.flush().await
}

async fn write_chunk<W>(io: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
        .await?;
    io.write_all(chunk).await?;
    io.write_all(b"\r\n").await?;
    io.flush().await
}
