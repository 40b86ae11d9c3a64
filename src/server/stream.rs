//! Turn streaming
//!
//! Bridges the worker's token channel to an NDJSON response body. A spawned
//! task accumulates pieces, tags each with its byte span, and stores the
//! finished turn once the worker reports its context snapshot.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::inference::{StreamToken, TurnAccumulator};
use crate::storage::{MessageRecord, MessageStore};
use crate::types::StreamEvent;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Spawns the forwarding task and returns the stream of events it emits.
pub fn spawn_turn(
    store: Arc<MessageStore>,
    tokens: mpsc::Receiver<StreamToken>,
    parent_id: Option<String>,
    started: Instant,
) -> mpsc::Receiver<StreamEvent> {
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(forward_turn(store, tokens, parent_id, started, events_tx));
    events_rx
}

/// Wraps an event stream as a response body, one JSON object per line.
pub fn ndjson_body(events: mpsc::Receiver<StreamEvent>) -> Body {
    let lines = ReceiverStream::new(events)
        .map(|event| Ok::<_, Infallible>(Bytes::from(event.to_line())));
    Body::from_stream(lines)
}

async fn forward_turn(
    store: Arc<MessageStore>,
    mut tokens: mpsc::Receiver<StreamToken>,
    parent_id: Option<String>,
    started: Instant,
    events: mpsc::Sender<StreamEvent>,
) {
    let mut turn = TurnAccumulator::new();

    while let Some(token) = tokens.recv().await {
        let event = match token {
            StreamToken::Piece { text, token_ids } => match turn.push(&text, &token_ids) {
                Some(span) => StreamEvent::chunk(text, span, started.elapsed().as_millis() as u64),
                None => continue,
            },
            StreamToken::Done(snapshot) => {
                let completed = turn.finish();
                let full_text = completed.text.clone();
                let message_id = store.insert_new(MessageRecord::new(completed, snapshot, parent_id));
                tracing::info!(
                    message_id = %message_id,
                    bytes = full_text.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Turn complete"
                );
                let _ = events.send(StreamEvent::done(message_id, full_text)).await;
                return;
            }
            StreamToken::Error(message) => {
                tracing::warn!(error = %message, "Generation failed mid-stream");
                let _ = events.send(StreamEvent::error(message)).await;
                return;
            }
        };

        if events.send(event).await.is_err() {
            // Dropping `tokens` here tells the worker to stop
            tracing::debug!("Client disconnected, abandoning turn");
            return;
        }
    }

    tracing::warn!("Token stream closed without completion");
    let _ = events
        .send(StreamEvent::error("generation ended unexpectedly"))
        .await;
}
