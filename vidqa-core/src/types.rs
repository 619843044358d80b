//! Core domain types for vidqa
//!
//! These types describe the client-side view of the video question-answering
//! system: which video is being watched, one conversation per video, and the
//! remote indexing progress for each video.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **ContentId** | Identifier extracted from a video URL (the `v=` parameter for YouTube) |
//! | **Session** | The conversation and metadata associated with one ContentId |
//! | **Ingestion** | The remote step that makes a video queryable (transcript + index) |
//! | **IndexingStatus** | Remote progress of ingestion for one ContentId |
//! | **Citation offset** | A timestamp in seconds supporting part of an answer |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorKind;

// ============================================
// Content identity
// ============================================

/// Opaque identifier of a piece of video content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical watch URL for this content.
    pub fn canonical_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A `{url, title}` pair observed on the host page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLocation {
    pub url: String,
    pub title: String,
}

impl PageLocation {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

// ============================================
// Conversation
// ============================================

/// A single entry of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// A question typed by the person watching
    User { text: String, sent_at: DateTime<Utc> },
    /// An answer from the answering service
    Assistant {
        text: String,
        /// Supporting positions in seconds, in the order the service returned them
        citation_offsets: Vec<f64>,
        received_at: DateTime<Utc>,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            text: text.into(),
            sent_at: Utc::now(),
        }
    }

    pub fn assistant(text: impl Into<String>, citation_offsets: Vec<f64>) -> Self {
        Message::Assistant {
            text: text.into(),
            citation_offsets,
            received_at: Utc::now(),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Message::User { text, .. } | Message::Assistant { text, .. } => text,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant { .. })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Message::User { sent_at, .. } => *sent_at,
            Message::Assistant { received_at, .. } => *received_at,
        }
    }
}

/// Append-only, insertion-ordered message history.
///
/// Individual messages can never be edited, removed, or reordered; the only
/// other mutation is clearing the whole history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation(Vec<Message>);

impl Conversation {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, message: Message) {
        self.0.push(message);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.0
    }

    pub fn last(&self) -> Option<&Message> {
        self.0.last()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages)
    }
}

impl<'a> IntoIterator for &'a Conversation {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================
// Session
// ============================================

/// Conversation history and metadata for one ContentId.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub content_id: ContentId,
    pub title: String,
    pub url: String,
    pub conversation: Conversation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values used when a session is created on first observation.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub title: String,
    pub url: String,
}

impl SessionDefaults {
    /// Defaults derived from the content id alone.
    pub fn for_content(content_id: &ContentId) -> Self {
        Self {
            title: crate::content::DEFAULT_TITLE.to_string(),
            url: content_id.canonical_url(),
        }
    }
}

// ============================================
// Indexing
// ============================================

/// Remote indexing progress for one ContentId.
///
/// Moves forward only: `NotStarted → Indexing → Indexed | Failed`. The chunk
/// count may be refreshed while indexing. Only an explicit reset (re-ingest)
/// brings a content back to `NotStarted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexingStatus {
    #[default]
    NotStarted,
    Indexing {
        chunk_count: u32,
    },
    Indexed,
    Failed,
}

impl IndexingStatus {
    fn rank(&self) -> u8 {
        match self {
            IndexingStatus::NotStarted => 0,
            IndexingStatus::Indexing { .. } => 1,
            IndexingStatus::Indexed | IndexingStatus::Failed => 2,
        }
    }

    /// Whether no further transition is possible without a reset
    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Returns the status after attempting a transition to `next`.
    ///
    /// Backward moves and moves out of a terminal state are ignored.
    pub fn advance(self, next: IndexingStatus) -> IndexingStatus {
        if self.is_terminal() || next.rank() < self.rank() {
            return self;
        }
        next
    }

    pub fn chunk_count(&self) -> Option<u32> {
        match self {
            IndexingStatus::Indexing { chunk_count } => Some(*chunk_count),
            _ => None,
        }
    }

    /// Wire name used by the message channel
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingStatus::NotStarted => "idle",
            IndexingStatus::Indexing { .. } => "indexing",
            IndexingStatus::Indexed => "indexed",
            IndexingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexingStatus::Indexing { chunk_count } => {
                write!(f, "indexing, {} chunks", chunk_count)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

// ============================================
// Global state
// ============================================

/// The most recent ingestion/status/ask failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    /// Content the failure belongs to, if any
    pub content_id: Option<ContentId>,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl LastError {
    pub fn new(content_id: Option<ContentId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            content_id,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Everything the synchronizer persists, read as one consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalState {
    pub active_url: Option<String>,
    pub active_title: Option<String>,
    /// Status of the active session's content (or of the observed page when no
    /// session is active)
    pub indexing_status: IndexingStatus,
    pub last_error: Option<LastError>,
    pub sessions: BTreeMap<ContentId, SessionRecord>,
    pub active_session_id: Option<ContentId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_advances_forward_only() {
        let status = IndexingStatus::NotStarted;
        let status = status.advance(IndexingStatus::Indexing { chunk_count: 3 });
        assert_eq!(status, IndexingStatus::Indexing { chunk_count: 3 });

        let status = status.advance(IndexingStatus::Indexing { chunk_count: 12 });
        assert_eq!(status.chunk_count(), Some(12));

        // Cannot go back
        assert_eq!(
            status.advance(IndexingStatus::NotStarted),
            IndexingStatus::Indexing { chunk_count: 12 }
        );

        let status = status.advance(IndexingStatus::Indexed);
        assert!(status.is_terminal());
        assert_eq!(status.advance(IndexingStatus::Failed), IndexingStatus::Indexed);
    }

    #[test]
    fn test_message_serde_tagged_by_role() {
        let msg = Message::assistant("answer", vec![12.0, 3.5]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["citation_offsets"][1], 3.5);

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_conversation_preserves_insertion_order() {
        let mut conversation = Conversation::new();
        conversation.push(Message::user("q1"));
        conversation.push(Message::assistant("a1", vec![]));
        conversation.push(Message::user("q2"));

        let texts: Vec<&str> = conversation.iter().map(Message::text).collect();
        assert_eq!(texts, vec!["q1", "a1", "q2"]);

        conversation.clear();
        assert!(conversation.is_empty());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(IndexingStatus::NotStarted.as_str(), "idle");
        assert_eq!(IndexingStatus::Indexing { chunk_count: 1 }.as_str(), "indexing");
        assert_eq!(IndexingStatus::Indexed.to_string(), "indexed");
    }
}
