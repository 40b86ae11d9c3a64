//! CORS policy

use axum::http::HeaderValue;
use tower_http::cors::{Any, CorsLayer};

use crate::storage::ServerSettings;

/// Builds the CORS layer from `cors_allowed_origins`.
///
/// With no list configured (or an unparsable one) every origin is allowed.
pub fn cors_layer(settings: &ServerSettings) -> CorsLayer {
    let origins: Vec<HeaderValue> = settings
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new().allow_headers(Any).allow_methods(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        tracing::info!(count = origins.len(), "Restricting CORS origins");
        layer.allow_origin(origins)
    }
}
