//! Protocol-level failures and their HTTP renderings.
//!
//! Handler failures travel as [`tonic::Status`] and are reported in-band
//! through trailer frames; the errors here are the ones that occur before
//! a handler runs (or while encoding its output) and therefore map onto
//! plain HTTP status codes.

use http::StatusCode;
use thiserror::Error;

/// Failures produced by the grpc-web pipeline itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The length-prefixed framing was truncated or inconsistent.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A text-mode body was not valid base64.
    #[error("malformed base64 body: {0}")]
    MalformedBase64(#[from] base64::DecodeError),

    /// A request payload could not be deserialized into the method's
    /// input type.
    #[error("failed to parse message: {0}")]
    ParseError(String),

    /// A response message could not be serialized.
    #[error("failed to encode message: {0}")]
    EncodeError(String),

    /// The request's `Content-Type` or `Accept` header is not a
    /// recognized grpc-web media type.
    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),

    /// The request body could not be read from the transport.
    #[error("failed to read request body: {0}")]
    BodyRead(#[source] crate::BoxError),
}

impl ProtocolError {
    /// The HTTP status this failure is reported as when it occurs before
    /// any response bytes have been committed.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ProtocolError::MalformedFrame(_)
            | ProtocolError::MalformedBase64(_)
            | ProtocolError::ParseError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ProtocolError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ProtocolError::EncodeError(_) | ProtocolError::BodyRead(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
