//! HTTP request and response bodies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::MessageRecord;

/// Body of `/generate` and `/continue`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// System prompt; the configured default is used when absent
    #[serde(default)]
    pub system: Option<String>,
    pub user: String,
    /// Chain of message ids; `/continue` resumes from the last one
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Body of `/focus`
#[derive(Debug, Clone, Deserialize)]
pub struct FocusRequest {
    pub message_id: String,
    /// Character (not byte) offsets into the parent's text; negative values
    /// count back from the end
    pub char_start: i64,
    pub char_end: i64,
    pub followup: String,
    #[serde(default)]
    pub system: Option<String>,
    /// Restore the parent's context before the branch prompt. When false the
    /// branch starts from an empty context.
    #[serde(default = "default_true")]
    pub reuse_context: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_true() -> bool {
    true
}

/// One line of a streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Chunk {
        piece: String,
        pos: [usize; 2],
        elapsed_ms: u64,
    },
    Done {
        done: bool,
        message_id: String,
        full_text: String,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn chunk(piece: impl Into<String>, span: (usize, usize), elapsed_ms: u64) -> Self {
        StreamEvent::Chunk {
            piece: piece.into(),
            pos: [span.0, span.1],
            elapsed_ms,
        }
    }

    pub fn done(message_id: impl Into<String>, full_text: impl Into<String>) -> Self {
        StreamEvent::Done {
            done: true,
            message_id: message_id.into(),
            full_text: full_text.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: message.into(),
        }
    }

    /// Serializes the event as one newline-terminated JSON line
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"failed to encode event: {e}"}}"#));
        line.push('\n');
        line
    }
}

/// A stored turn as returned by `GET /messages/{id}`
///
/// The state blob itself is never sent, only its size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub text: String,
    pub tokens: Vec<i32>,
    pub spans: Vec<[usize; 2]>,
    pub created: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub context_tokens: i32,
    pub state_bytes: usize,
}

impl MessageView {
    pub fn from_record(id: impl Into<String>, record: &MessageRecord) -> Self {
        Self {
            id: id.into(),
            text: record.text.clone(),
            tokens: record.tokens.clone(),
            spans: record.spans.iter().map(|&(s, e)| [s, e]).collect(),
            created: record.created,
            parent_id: record.parent_id.clone(),
            context_tokens: record.snapshot.token_count,
            state_bytes: record.snapshot.size_bytes(),
        }
    }
}
