//! Persistence collaborator boundary.
//!
//! The backing store is the single source of truth: the session never
//! assumes it is the only writer and reconciles everything it renders
//! against the store's change stream. This module defines the contract
//! ([`ConversationStore`]) plus a SQLite-backed implementation that
//! broadcasts every committed message insert, mirroring a shared realtime
//! backend with concurrent writers. Row ownership and access control are
//! the collaborator's concern, not modeled here.

use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::DEFAULT_CONVERSATION_TITLE;
use crate::db::{self, DatabaseError};
use crate::models::{ChatMode, Conversation, Message, NewMessage};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Persistence error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(Uuid),

    #[error("Internal lock error")]
    LockPoisoned,
}

/// A change pushed from the store: one freshly inserted message record.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub message: Message,
}

/// Subscription to insert events, scoped to one conversation.
///
/// Events for other conversations on the shared channel are skipped;
/// lagged deliveries are logged and skipped rather than surfaced: the
/// merge discipline is idempotent, so a missed event is repaired by the
/// next full history load.
pub struct ChangeEvents {
    conversation_id: Uuid,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeEvents {
    /// Next insert event for the subscribed conversation, or `None` once
    /// the store has shut down.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.message.conversation_id == self.conversation_id => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "change stream lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The conversation/message store contract.
///
/// Every operation the session pipeline suspends on lives here.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError>;
    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;
    /// Active conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
    async fn rename_conversation(&self, id: Uuid, title: &str) -> Result<(), StoreError>;
    /// Soft delete: flips the active flag, the row stays.
    async fn archive_conversation(&self, id: Uuid) -> Result<(), StoreError>;

    /// Insert a message and return the authoritative record (store-assigned
    /// id and timestamp). The record is also emitted on the change stream.
    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError>;
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError>;
    /// Bulk-delete every message of a conversation (the Reset operation).
    async fn clear_messages(&self, conversation_id: Uuid) -> Result<(), StoreError>;

    async fn get_preference(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_preference(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Subscribe to insert events for one conversation.
    fn subscribe(&self, conversation_id: Uuid) -> ChangeEvents;
}

/// SQLite-backed store. Local operations are fast, so the connection sits
/// behind a plain mutex and each call runs to completion while holding it.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
    events: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        Ok(Self::with_connection(db::open_database(path)?))
    }

    /// In-memory store, used by tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::with_connection(db::open_memory_database()?))
    }

    fn with_connection(conn: rusqlite::Connection) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            conn: Mutex::new(conn),
            events,
        }
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Stored chat-mode preference, parsed. Unset or unparsable rows
    /// yield `None`.
    pub async fn stored_mode(&self) -> Result<Option<ChatMode>, StoreError> {
        let raw = self.get_preference(crate::config::PREF_CHAT_MODE).await?;
        Ok(raw.and_then(|v| ChatMode::from_str(&v).ok()))
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: if title.is_empty() {
                DEFAULT_CONVERSATION_TITLE.to_string()
            } else {
                title.to_string()
            },
            created_at: now,
            updated_at: now,
            active: true,
        };
        db::insert_conversation(&*self.conn()?, &conversation)?;
        tracing::debug!(id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        Ok(db::get_conversation(&*self.conn()?, &id)?)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        Ok(db::list_active_conversations(&*self.conn()?)?)
    }

    async fn rename_conversation(&self, id: Uuid, title: &str) -> Result<(), StoreError> {
        Ok(db::update_conversation_title(
            &*self.conn()?,
            &id,
            title,
            Utc::now(),
        )?)
    }

    async fn archive_conversation(&self, id: Uuid) -> Result<(), StoreError> {
        Ok(db::set_conversation_active(
            &*self.conn()?,
            &id,
            false,
            Utc::now(),
        )?)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        let record = Message {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            model: message.model,
            created_at: Utc::now(),
        };

        {
            let conn = self.conn()?;
            if db::get_conversation(&conn, &record.conversation_id)?.is_none() {
                return Err(StoreError::ConversationNotFound(record.conversation_id));
            }
            db::insert_message(&conn, &record)?;
            db::touch_conversation(&conn, &record.conversation_id, record.created_at)?;
        }

        // Committed rows go to every subscriber, including the writer's own
        // session: idempotent merges make the echo harmless.
        let _ = self.events.send(ChangeEvent {
            message: record.clone(),
        });

        Ok(record)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        Ok(db::list_messages(&*self.conn()?, &conversation_id)?)
    }

    async fn clear_messages(&self, conversation_id: Uuid) -> Result<(), StoreError> {
        let deleted = db::delete_messages(&*self.conn()?, &conversation_id)?;
        tracing::debug!(conversation_id = %conversation_id, deleted, "messages cleared");
        Ok(())
    }

    async fn get_preference(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(db::get_preference(&*self.conn()?, key)?)
    }

    async fn set_preference(&self, key: &str, value: &str) -> Result<(), StoreError> {
        Ok(db::set_preference(&*self.conn()?, key, value)?)
    }

    fn subscribe(&self, conversation_id: Uuid) -> ChangeEvents {
        ChangeEvents {
            conversation_id,
            rx: self.events.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    fn new_message(conversation_id: Uuid, role: MessageRole, content: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            role,
            content: content.to_string(),
            model: None,
        }
    }

    #[tokio::test]
    async fn insert_returns_authoritative_record() {
        let store = SqliteStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();

        let record = store
            .insert_message(new_message(conv.id, MessageRole::User, "Hello"))
            .await
            .unwrap();

        assert_eq!(record.conversation_id, conv.id);
        assert_eq!(record.content, "Hello");

        let listed = store.list_messages(conv.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, record.id);
    }

    #[tokio::test]
    async fn insert_into_missing_conversation_fails() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .insert_message(new_message(Uuid::new_v4(), MessageRole::User, "Hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn insert_emits_change_event_with_full_record() {
        let store = SqliteStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();
        let mut events = store.subscribe(conv.id);

        let record = store
            .insert_message(new_message(conv.id, MessageRole::User, "Hello"))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.message.id, record.id);
        assert_eq!(event.message.content, "Hello");
    }

    #[tokio::test]
    async fn subscription_filters_other_conversations() {
        let store = SqliteStore::in_memory().unwrap();
        let mine = store.create_conversation("mine").await.unwrap();
        let other = store.create_conversation("other").await.unwrap();
        let mut events = store.subscribe(mine.id);

        store
            .insert_message(new_message(other.id, MessageRole::User, "noise"))
            .await
            .unwrap();
        store
            .insert_message(new_message(mine.id, MessageRole::User, "signal"))
            .await
            .unwrap();

        // The first delivered event for this subscription skips the other
        // conversation's insert entirely.
        let event = events.recv().await.unwrap();
        assert_eq!(event.message.conversation_id, mine.id);
        assert_eq!(event.message.content, "signal");
    }

    #[tokio::test]
    async fn archive_is_a_soft_delete() {
        let store = SqliteStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();
        store.archive_conversation(conv.id).await.unwrap();

        assert!(store.list_conversations().await.unwrap().is_empty());
        let row = store.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(!row.active);
    }

    #[tokio::test]
    async fn clear_messages_leaves_conversation_row() {
        let store = SqliteStore::in_memory().unwrap();
        let conv = store.create_conversation("chat").await.unwrap();
        for i in 0..3 {
            store
                .insert_message(new_message(conv.id, MessageRole::User, &format!("m{i}")))
                .await
                .unwrap();
        }

        store.clear_messages(conv.id).await.unwrap();

        assert!(store.list_messages(conv.id).await.unwrap().is_empty());
        assert!(store.get_conversation(conv.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stored_mode_round_trips() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.stored_mode().await.unwrap().is_none());

        store
            .set_preference(crate::config::PREF_CHAT_MODE, "offline")
            .await
            .unwrap();
        assert_eq!(store.stored_mode().await.unwrap(), Some(ChatMode::Offline));
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");

        let conv_id = {
            let store = SqliteStore::open(&path).unwrap();
            let conv = store.create_conversation("persisted").await.unwrap();
            store
                .insert_message(new_message(conv.id, MessageRole::User, "still here"))
                .await
                .unwrap();
            conv.id
        };

        let reopened = SqliteStore::open(&path).unwrap();
        let messages = reopened.list_messages(conv_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "still here");
    }
}
