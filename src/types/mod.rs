//! Shared types
//!
//! Wire types for the HTTP API.

pub mod api;

pub use api::{ChatRequest, FocusRequest, MessageView, StreamEvent};
