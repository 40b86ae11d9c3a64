//! Route handlers
//!
//! The three streaming handlers differ only in how they build the prompt and
//! whether a stored context snapshot is restored first. Everything else goes
//! through [`start_turn`].

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::inference::{GenerationParams, GenerationRequest, LoadedModelInfo};
use crate::prompts;
use crate::server::error::ApiError;
use crate::server::stream::{ndjson_body, spawn_turn, NDJSON_CONTENT_TYPE};
use crate::server::AppState;
use crate::storage::{MessageRecord, MessageSummary, TurnSettings, MAX_TOKENS_LIMIT};
use crate::types::{ChatRequest, FocusRequest, MessageView};
use crate::{char_slice, truncate_str};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generate", post(generate))
        .route("/focus", post(focus))
        .route("/continue", post(continue_conversation))
        .route("/health", get(health))
        .route("/messages", get(list_messages))
        .route("/messages/{id}", get(get_message))
        .route("/messages/{id}/path", get(message_path))
}

/// `POST /generate`: a new root turn from an empty context.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let params = turn_params(&state.settings.chat, req.max_tokens, req.temperature)?;
    let system = req
        .system
        .as_deref()
        .unwrap_or(&state.settings.chat_system_prompt);

    info!(user = truncate_str(&req.user, 80), "generate");

    let request = GenerationRequest {
        prompt: prompts::root_prompt(system, &req.user),
        resume_from: None,
        params,
    };
    start_turn(&state, request, None)
}

/// `POST /focus`: branch from an excerpt of an earlier turn.
pub async fn focus(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FocusRequest>,
) -> Result<Response, ApiError> {
    let parent = find_message(&state, &req.message_id)?;

    let excerpt = char_slice(&parent.text, req.char_start, req.char_end).trim();
    if excerpt.is_empty() {
        return Err(ApiError::BadRequest("empty excerpt".to_string()));
    }

    let params = turn_params(&state.settings.focus, req.max_tokens, req.temperature)?;
    let system = req
        .system
        .as_deref()
        .unwrap_or(&state.settings.focus_system_prompt);

    info!(
        parent = %req.message_id,
        excerpt = truncate_str(excerpt, 80),
        reuse_context = req.reuse_context,
        "focus"
    );

    let request = GenerationRequest {
        prompt: prompts::focus_prompt(system, excerpt, &req.followup),
        resume_from: req.reuse_context.then(|| parent.snapshot.clone()),
        params,
    };
    start_turn(&state, request, Some(req.message_id))
}

/// `POST /continue`: append a user turn to the last message in `history`.
pub async fn continue_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let Some(parent_id) = req.history.last().cloned() else {
        return Err(ApiError::BadRequest("history missing or empty".to_string()));
    };
    let parent = find_message(&state, &parent_id)?;
    let params = turn_params(&state.settings.chat, req.max_tokens, req.temperature)?;

    info!(parent = %parent_id, user = truncate_str(&req.user, 80), "continue");

    let request = GenerationRequest {
        prompt: prompts::continuation_turn(&req.user),
        resume_from: Some(parent.snapshot.clone()),
        params,
    };
    start_turn(&state, request, Some(parent_id))
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let model = state.generator.model_info();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "model": model.as_ref().map(LoadedModelInfo::file_name),
        "context_size": model.as_ref().map(|m| m.context_size),
        "param_count": model.as_ref().map(|m| m.param_count),
        "messages": state.store.len(),
    }))
}

/// `GET /messages`
pub async fn list_messages(State(state): State<Arc<AppState>>) -> Json<Vec<MessageSummary>> {
    Json(state.store.summaries())
}

/// `GET /messages/{id}`
pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageView>, ApiError> {
    let record = find_message(&state, &id)?;
    Ok(Json(MessageView::from_record(id, &record)))
}

/// `GET /messages/{id}/path`
pub async fn message_path(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let path = state
        .store
        .path_to(&id)
        .ok_or_else(|| ApiError::NotFound("unknown message_id".to_string()))?;
    Ok(Json(json!({ "path": path })))
}

fn find_message(state: &AppState, id: &str) -> Result<MessageRecord, ApiError> {
    state
        .store
        .get(id)
        .ok_or_else(|| ApiError::NotFound("unknown message_id".to_string()))
}

/// Applies per-request overrides on top of the configured turn defaults.
fn turn_params(
    defaults: &TurnSettings,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
) -> Result<GenerationParams, ApiError> {
    let max_tokens = max_tokens.unwrap_or(defaults.max_tokens);
    if max_tokens == 0 || max_tokens > MAX_TOKENS_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "invalid max_tokens ({max_tokens}): must be between 1 and {MAX_TOKENS_LIMIT}"
        )));
    }

    let temperature = temperature.unwrap_or(defaults.temperature);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ApiError::BadRequest(format!(
            "invalid temperature ({temperature}): must be between 0.0 and 2.0"
        )));
    }

    Ok(GenerationParams {
        max_tokens,
        temperature,
        top_k: defaults.top_k,
        top_p: defaults.top_p,
        seed: 0,
    })
}

fn start_turn(
    state: &AppState,
    request: GenerationRequest,
    parent_id: Option<String>,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let tokens = state.generator.generate(request)?;
    let events = spawn_turn(state.store.clone(), tokens, parent_id, started);

    Ok(([(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)], ndjson_body(events)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_params_defaults() {
        let defaults = TurnSettings::default();
        let params = turn_params(&defaults, None, None).unwrap();
        assert_eq!(params.max_tokens, 768);
        assert!((params.temperature - 0.4).abs() < 0.001);
        assert!((params.top_p - 0.95).abs() < 0.001);
    }

    #[test]
    fn test_turn_params_overrides() {
        let params = turn_params(&TurnSettings::default(), Some(64), Some(0.0)).unwrap();
        assert_eq!(params.max_tokens, 64);
        assert_eq!(params.temperature, 0.0);
    }

    #[test]
    fn test_turn_params_rejects_out_of_range() {
        let defaults = TurnSettings::default();
        assert!(matches!(
            turn_params(&defaults, Some(0), None),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            turn_params(&defaults, Some(MAX_TOKENS_LIMIT + 1), None),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            turn_params(&defaults, None, Some(2.5)),
            Err(ApiError::BadRequest(_))
        ));
    }
}
