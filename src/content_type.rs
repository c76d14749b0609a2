//! Content-type classification, negotiation, and the text-mode transform.
//!
//! grpc-web bodies travel in one of four media types: protobuf or JSON
//! payloads, each either raw (binary mode) or base64-wrapped (text mode,
//! for transports that cannot carry arbitrary bytes). Text mode encodes a
//! buffered unary body as one blob and each streaming frame
//! independently, so that the HTTP chunk boundary stays the frame
//! boundary.

use bytes::Bytes;
use http::{header, HeaderMap};

use crate::error::ProtocolError;
use crate::util::base64::STANDARD;
use base64::Engine as _;

/// `application/grpc-web+proto`: binary protobuf payloads.
pub const GRPC_WEB_PROTO: &str = "application/grpc-web+proto";

/// `application/grpc-web-text+proto`: base64-wrapped protobuf payloads.
pub const GRPC_WEB_TEXT_PROTO: &str = "application/grpc-web-text+proto";

/// `application/grpc-web+json`: binary JSON payloads.
pub const GRPC_WEB_JSON: &str = "application/grpc-web+json";

/// `application/grpc-web-text+json`: base64-wrapped JSON payloads.
pub const GRPC_WEB_TEXT_JSON: &str = "application/grpc-web-text+json";

/// Body-level encoding applied over the framed byte stream.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Encoding {
    /// Binary mode; the framed bytes pass through untouched.
    None,
    /// Text mode; the framed bytes are base64-wrapped.
    Base64,
}

/// Serialized form of the messages inside payload frames.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WireFormat {
    /// Protobuf binary encoding.
    Proto,
    /// Protobuf JSON mapping.
    Json,
}

/// The payload format and body encoding implied by one media type.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ContentKind {
    /// Message serialization inside payload frames.
    pub wire: WireFormat,
    /// Encoding applied over the framed body.
    pub encoding: Encoding,
}

/// Outcome of request content negotiation.
#[derive(Copy, Clone, Debug)]
pub struct Negotiation {
    /// How to decode the request body.
    pub request: ContentKind,
    /// How to encode the response body.
    pub response: ContentKind,
    /// The `Content-Type` to stamp on the response.
    pub response_content_type: &'static str,
}

impl Encoding {
    /// Classify a media type: text mode iff it contains `grpc-web-text`.
    pub fn from_content_type(value: &str) -> Encoding {
        if value.contains("grpc-web-text") {
            Encoding::Base64
        } else {
            Encoding::None
        }
    }

    /// Classify the `Content-Type` header of a response or request.
    pub fn from_headers(headers: &HeaderMap) -> Encoding {
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(Encoding::from_content_type)
            .unwrap_or(Encoding::None)
    }

    /// Undo the text transform over a whole inbound body.
    pub fn decode_blob(self, body: Bytes) -> Result<Bytes, ProtocolError> {
        match self {
            Encoding::None => Ok(body),
            Encoding::Base64 => Ok(STANDARD.decode(&body)?.into()),
        }
    }

    /// Apply the text transform over a whole buffered outbound body.
    pub fn encode_blob(self, body: Bytes) -> Bytes {
        match self {
            Encoding::None => body,
            Encoding::Base64 => STANDARD.encode(&body).into_bytes().into(),
        }
    }

    /// Apply the text transform to one streamed frame. Each frame is
    /// encoded independently so chunk boundaries survive decoding.
    pub fn encode_frame(self, frame: Bytes) -> Bytes {
        self.encode_blob(frame)
    }
}

/// Map a media type to its payload format, response header value, and
/// encoding; `None` for anything outside the recognized set.
fn classify(value: &str) -> Option<(ContentKind, &'static str)> {
    let media_type = value.split(';').next().unwrap_or("").trim();

    let canonical = match media_type {
        GRPC_WEB_PROTO => GRPC_WEB_PROTO,
        GRPC_WEB_TEXT_PROTO => GRPC_WEB_TEXT_PROTO,
        GRPC_WEB_JSON => GRPC_WEB_JSON,
        GRPC_WEB_TEXT_JSON => GRPC_WEB_TEXT_JSON,
        _ => return None,
    };

    let wire = if canonical.ends_with("+json") {
        WireFormat::Json
    } else {
        WireFormat::Proto
    };

    Some((
        ContentKind {
            wire,
            encoding: Encoding::from_content_type(canonical),
        },
        canonical,
    ))
}

fn accept_is_unspecified(accept: Option<&str>) -> bool {
    match accept {
        None => true,
        Some(value) => {
            let value = value.trim();
            value.is_empty() || value == "*/*" || value == "application/*"
        }
    }
}

/// Negotiate the request and response content kinds from the request
/// headers.
///
/// A request is accepted iff its `Content-Type` is one of the four
/// grpc-web media types and its `Accept` is either unspecified (absent,
/// empty, `*/*`, `application/*`) or also in the set. When `Accept` is
/// unspecified the response echoes the request's content type; otherwise
/// the response uses `Accept` directly.
pub fn negotiate(headers: &HeaderMap) -> Result<Negotiation, ProtocolError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    let unsupported = || {
        ProtocolError::UnsupportedMediaType(content_type.unwrap_or("<missing>").to_owned())
    };

    let (request, request_canonical) = content_type
        .and_then(classify)
        .ok_or_else(&unsupported)?;

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());

    let (response, response_content_type) = if accept_is_unspecified(accept) {
        (request, request_canonical)
    } else {
        accept.and_then(classify).ok_or_else(&unsupported)?
    };

    Ok(Negotiation {
        request,
        response,
        response_content_type,
    })
}
