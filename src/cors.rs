//! CORS defaults for browser-facing deployments.
//!
//! Browsers preflight grpc-web calls and refuse to read the in-body
//! trailer headers unless the server exposes them. This module carries a
//! configuration that works with stock grpc-web clients; compose it with
//! whatever routing layer fronts the handler.

use std::time::Duration;

use http::header::HeaderName;
use tower_http::cors::{AllowOrigin, CorsLayer};

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_EXPOSED_HEADERS: [&str; 3] =
    ["grpc-status", "grpc-message", "grpc-status-details-bin"];
const DEFAULT_ALLOW_HEADERS: [&str; 4] =
    ["x-grpc-web", "content-type", "x-user-agent", "grpc-timeout"];

/// A [`CorsLayer`] preconfigured for grpc-web clients: mirrored origin,
/// credentials allowed, a 24 hour max age, and the grpc status headers
/// exposed.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .max_age(DEFAULT_MAX_AGE)
        .expose_headers(
            DEFAULT_EXPOSED_HEADERS
                .iter()
                .cloned()
                .map(HeaderName::from_static)
                .collect::<Vec<HeaderName>>(),
        )
        .allow_headers(
            DEFAULT_ALLOW_HEADERS
                .iter()
                .cloned()
                .map(HeaderName::from_static)
                .collect::<Vec<HeaderName>>(),
        )
}
