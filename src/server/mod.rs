//! HTTP server
//!
//! [`build`] assembles the axum router: the streaming turn endpoints, the
//! read-only message endpoints, CORS and request tracing.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod stream;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::inference::TextGenerator;
use crate::storage::{MessageStore, ServerSettings};

pub use error::ApiError;

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ServerSettings>,
    pub generator: Arc<dyn TextGenerator>,
    pub store: Arc<MessageStore>,
}

impl AppState {
    pub fn new(settings: ServerSettings, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            settings: Arc::new(settings),
            generator,
            store: Arc::new(MessageStore::new()),
        }
    }
}

/// Build the complete router for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let cors = middleware::cors_layer(&state.settings);

    routes::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
