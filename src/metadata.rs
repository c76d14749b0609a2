//! Inbound request metadata.
//!
//! Request headers become RPC metadata under a normalized naming scheme:
//! lowercase with `_` separators, so `X-Request-Id` is addressed as
//! `x_request_id`. Keys ending in `_bin` carry base64-encoded binary
//! values and are decoded on extraction; everything else is kept as raw
//! bytes. Entries are ordered by key.

use std::collections::BTreeMap;

use base64::engine::general_purpose;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, HeaderMap};

/// Headers that never become metadata: `Accept` drives negotiation, and
/// the entity headers describe the body rather than the call.
const SKIPPED: [header::HeaderName; 3] = [
    header::ACCEPT,
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
];

/// Binary metadata appears in several base64 variants in the wild; try
/// them in order before giving up.
const BASE64_ENGINES: [general_purpose::GeneralPurpose; 4] = [
    general_purpose::STANDARD,
    general_purpose::URL_SAFE,
    general_purpose::STANDARD_NO_PAD,
    general_purpose::URL_SAFE_NO_PAD,
];

/// Decode a base64 value, trying each supported variant in order.
pub(crate) fn decode_base64_lenient(value: &str) -> Option<Vec<u8>> {
    BASE64_ENGINES
        .iter()
        .find_map(|engine| engine.decode(value.trim()).ok())
}

/// Normalized, key-ordered call metadata extracted from request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Bytes>,
}

impl Metadata {
    /// Extract metadata from request headers.
    ///
    /// Duplicate header names keep the last value.
    pub fn from_headers(headers: &HeaderMap) -> Metadata {
        let mut entries = BTreeMap::new();

        for (name, value) in headers.iter() {
            if SKIPPED.contains(name) {
                continue;
            }

            let key = name.as_str().to_ascii_lowercase().replace('-', "_");
            let value = if key.ends_with("_bin") {
                match std::str::from_utf8(value.as_bytes())
                    .ok()
                    .and_then(decode_base64_lenient)
                {
                    Some(decoded) => Bytes::from(decoded),
                    None => Bytes::copy_from_slice(value.as_bytes()),
                }
            } else {
                Bytes::copy_from_slice(value.as_bytes())
            };

            entries.insert(key, value);
        }

        Metadata { entries }
    }

    /// Look up a value by normalized key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|value| value.as_ref())
    }

    /// Look up a value by normalized key as UTF-8 text.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| std::str::from_utf8(value).ok())
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_ref()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
