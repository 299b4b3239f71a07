use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::MessageRole;

/// A titled, ordered collection of messages.
///
/// Soft-deleted by flipping `active`: the client never hard-deletes
/// a conversation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

/// One persisted turn (user or assistant). Immutable once stored.
///
/// `content` is opaque at this level: either plain text or the structured
/// text+images encoding produced by the content codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Which model produced the turn (assistant messages only).
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a new message: the store assigns id and timestamp
/// and returns the authoritative record.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub model: Option<String>,
}
