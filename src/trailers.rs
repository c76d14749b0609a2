//! The in-body trailer block.
//!
//! grpc-web cannot use real HTTP/2 trailers, so the terminal status of an
//! RPC travels inside the body as the last frame: an HTTP-style header
//! block of CRLF-terminated `name:value` lines. `grpc-status`,
//! `grpc-message` and the `x-grpc-web` marker always lead, in that order;
//! user metadata follows and may not shadow them.

use bytes::{BufMut, Bytes, BytesMut};
use tonic::metadata::{
    AsciiMetadataKey, AsciiMetadataValue, BinaryMetadataKey, BinaryMetadataValue, KeyAndValueRef,
    MetadataMap,
};
use tonic::{Code, Status};
use tracing::debug;

use crate::metadata::decode_base64_lenient;
use crate::util::base64::STANDARD;
use base64::Engine as _;

/// Trailer name carrying the numeric gRPC status code.
pub const GRPC_STATUS: &str = "grpc-status";

/// Trailer name carrying the human-readable status message.
pub const GRPC_MESSAGE: &str = "grpc-message";

/// Marker trailer identifying a grpc-web response body.
pub const GRPC_WEB_MARKER: &str = "x-grpc-web";

/// Names owned by the protocol; user metadata may not duplicate them.
pub const RESERVED: [&str; 3] = [GRPC_STATUS, GRPC_MESSAGE, GRPC_WEB_MARKER];

/// A parsed trailer block.
#[derive(Debug, Clone)]
pub struct Trailers {
    /// The gRPC status code; `Unknown` when absent or non-numeric.
    pub code: Code,
    /// The status message; empty when absent.
    pub message: String,
    /// Non-reserved metadata pairs, `*-bin` values base64-decoded.
    pub metadata: MetadataMap,
}

impl Trailers {
    /// Whether the block carries a successful status.
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// Encode a status as a trailer block.
///
/// The message is emitted verbatim; callers must ensure it contains no CR
/// or LF. Reserved names in the status metadata are dropped rather than
/// duplicated; binary metadata values are base64-encoded.
pub fn encode_block(status: &Status) -> Bytes {
    let mut block = BytesMut::new();

    put_line(&mut block, GRPC_STATUS, (status.code() as i32).to_string().as_bytes());
    put_line(&mut block, GRPC_MESSAGE, status.message().as_bytes());
    put_line(&mut block, GRPC_WEB_MARKER, b"1");

    for entry in status.metadata().iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => {
                if RESERVED.contains(&key.as_str()) {
                    continue;
                }
                put_line(&mut block, key.as_str(), value.as_bytes());
            }
            KeyAndValueRef::Binary(key, value) => {
                let Ok(raw) = value.to_bytes() else {
                    debug!(key = key.as_str(), "dropping undecodable binary trailer");
                    continue;
                };
                put_line(&mut block, key.as_str(), STANDARD.encode(raw).as_bytes());
            }
        }
    }

    block.freeze()
}

fn put_line(block: &mut BytesMut, name: &str, value: &[u8]) {
    block.put_slice(name.as_bytes());
    block.put_u8(b':');
    block.put_slice(value);
    block.put_slice(b"\r\n");
}

/// Parse a trailer block.
///
/// Splits on `\r?\n`, splits each line at the first `:`, ignores lines
/// lacking a separator, and keeps the last value on duplicate names. A
/// missing or non-numeric `grpc-status` yields `Unknown`.
pub fn parse_block(block: &[u8]) -> Trailers {
    let mut code = Code::Unknown;
    let mut message = String::new();
    let mut metadata = MetadataMap::new();

    for line in block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let (name, value) = (&line[..colon], &line[colon + 1..]);
        let name = String::from_utf8_lossy(name).to_ascii_lowercase();

        match name.as_str() {
            GRPC_STATUS => {
                code = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.trim().parse::<i32>().ok())
                    .map(Code::from_i32)
                    .unwrap_or(Code::Unknown);
            }
            GRPC_MESSAGE => message = String::from_utf8_lossy(value).into_owned(),
            GRPC_WEB_MARKER => {}
            _ => insert_metadata(&mut metadata, &name, value),
        }
    }

    Trailers {
        code,
        message,
        metadata,
    }
}

// Last-wins: `MetadataMap::insert` replaces any earlier value.
fn insert_metadata(metadata: &mut MetadataMap, name: &str, value: &[u8]) {
    if name.ends_with("-bin") {
        let (Ok(key), Some(decoded)) = (
            BinaryMetadataKey::from_bytes(name.as_bytes()),
            std::str::from_utf8(value).ok().and_then(decode_base64_lenient),
        ) else {
            debug!(name, "dropping unparsable binary trailer");
            return;
        };
        metadata.insert_bin(key, BinaryMetadataValue::from_bytes(&decoded));
    } else {
        let (Ok(key), Some(Ok(parsed))) = (
            AsciiMetadataKey::from_bytes(name.as_bytes()),
            std::str::from_utf8(value)
                .ok()
                .map(|v| v.parse::<AsciiMetadataValue>()),
        ) else {
            debug!(name, "dropping unparsable trailer");
            return;
        };
        metadata.insert(key, parsed);
    }
}
