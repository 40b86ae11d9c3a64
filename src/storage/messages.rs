//! Message store
//!
//! Process-lifetime map from generated message id to the record of that turn.
//! Records are written once when a stream completes and never change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::inference::streaming::{CompletedTurn, ContextSnapshot};
use crate::truncate_str;

/// Bytes of text kept in a summary preview
const PREVIEW_BYTES: usize = 80;

/// One generated turn
#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// Full generated text
    pub text: String,
    /// Generated token ids, in order
    pub tokens: Vec<i32>,
    /// Byte span of each streamed chunk within `text`
    pub spans: Vec<(usize, usize)>,
    /// When generation finished
    pub created: DateTime<Utc>,
    /// Context state right after the last generated token
    pub snapshot: Arc<ContextSnapshot>,
    /// Turn this one was branched or continued from
    pub parent_id: Option<String>,
}

impl MessageRecord {
    pub fn new(turn: CompletedTurn, snapshot: ContextSnapshot, parent_id: Option<String>) -> Self {
        Self {
            text: turn.text,
            tokens: turn.tokens,
            spans: turn.spans,
            created: Utc::now(),
            snapshot: Arc::new(snapshot),
            parent_id,
        }
    }
}

/// Listing entry without the state blob
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub id: String,
    pub parent_id: Option<String>,
    pub created: DateTime<Utc>,
    pub preview: String,
    pub token_count: usize,
}

/// Concurrent in-memory message store
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: DashMap<String, MessageRecord>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record under a fresh `m_<unix-millis>` id and returns the id.
    ///
    /// Two turns finishing in the same millisecond get consecutive values.
    pub fn insert_new(&self, record: MessageRecord) -> String {
        let mut millis = record.created.timestamp_millis();
        loop {
            let id = format!("m_{millis}");
            match self.messages.entry(id.clone()) {
                Entry::Occupied(_) => millis += 1,
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    tracing::debug!(message_id = %id, "Stored message");
                    return id;
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<MessageRecord> {
        self.messages.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Ids from the root of `id`'s branch down to `id` itself.
    ///
    /// Stops early at a parent id that is not in the store.
    pub fn path_to(&self, id: &str) -> Option<Vec<String>> {
        if !self.contains(id) {
            return None;
        }

        let mut path = vec![id.to_string()];
        let mut current = self.get(id).and_then(|r| r.parent_id);
        while let Some(parent) = current {
            // A record can only point at an older one, but guard anyway
            if path.contains(&parent) || path.len() > self.len() {
                break;
            }
            let Some(record) = self.get(&parent) else {
                break;
            };
            path.push(parent);
            current = record.parent_id;
        }

        path.reverse();
        Some(path)
    }

    /// Summaries of every stored record, newest first
    pub fn summaries(&self) -> Vec<MessageSummary> {
        let mut summaries: Vec<MessageSummary> = self
            .messages
            .iter()
            .map(|entry| {
                let record = entry.value();
                MessageSummary {
                    id: entry.key().clone(),
                    parent_id: record.parent_id.clone(),
                    created: record.created,
                    preview: truncate_str(&record.text, PREVIEW_BYTES).to_string(),
                    token_count: record.tokens.len(),
                }
            })
            .collect();

        summaries.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str, parent_id: Option<&str>) -> MessageRecord {
        let turn = CompletedTurn {
            text: text.to_string(),
            tokens: vec![1, 2],
            spans: vec![(0, text.len())],
        };
        let snapshot = ContextSnapshot {
            token_count: 2,
            data: vec![0; 16],
        };
        MessageRecord::new(turn, snapshot, parent_id.map(str::to_string))
    }

    #[test]
    fn test_insert_and_get() {
        let store = MessageStore::new();
        let id = store.insert_new(record("hello", None));

        assert!(id.starts_with("m_"));
        assert_eq!(store.len(), 1);
        let stored = store.get(&id).unwrap();
        assert_eq!(stored.text, "hello");
        assert_eq!(stored.snapshot.token_count, 2);
        assert!(store.get("m_0").is_none());
    }

    #[test]
    fn test_ids_unique_within_same_millisecond() {
        let store = MessageStore::new();
        let first = record("a", None);
        let mut second = record("b", None);
        second.created = first.created;

        let id_a = store.insert_new(first.clone());
        let id_b = store.insert_new(second);
        assert_ne!(id_a, id_b);

        let millis = first.created.timestamp_millis();
        assert_eq!(id_a, format!("m_{millis}"));
        assert_eq!(id_b, format!("m_{}", millis + 1));
    }

    #[test]
    fn test_get_shares_snapshot() {
        let store = MessageStore::new();
        let id = store.insert_new(record("x", None));
        let a = store.get(&id).unwrap();
        let b = store.get(&id).unwrap();
        assert!(Arc::ptr_eq(&a.snapshot, &b.snapshot));
    }

    #[test]
    fn test_path_to_follows_parents() {
        let store = MessageStore::new();
        let root = store.insert_new(record("root", None));
        let child = store.insert_new(record("child", Some(&root)));
        let grandchild = store.insert_new(record("grandchild", Some(&child)));

        assert_eq!(
            store.path_to(&grandchild).unwrap(),
            vec![root.clone(), child.clone(), grandchild]
        );
        assert_eq!(store.path_to(&root).unwrap(), vec![root]);
        assert!(store.path_to("m_missing").is_none());
    }

    #[test]
    fn test_path_stops_at_unknown_parent() {
        let store = MessageStore::new();
        let orphan = store.insert_new(record("orphan", Some("m_gone")));
        assert_eq!(store.path_to(&orphan).unwrap(), vec![orphan]);
    }

    #[test]
    fn test_summaries_newest_first() {
        let store = MessageStore::new();
        let mut older = record(&"a".repeat(200), None);
        older.created = Utc::now() - chrono::Duration::seconds(10);
        let older_id = store.insert_new(older);
        let newer_id = store.insert_new(record("b", Some(&older_id)));

        let summaries = store.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, newer_id);
        assert_eq!(summaries[0].parent_id.as_deref(), Some(older_id.as_str()));
        assert_eq!(summaries[1].preview.len(), PREVIEW_BYTES);
    }
}
