use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::DatabaseError;
use crate::models::{Conversation, Message, MessageRole};

// ═══════════════════════════════════════════
// Conversation repository
// ═══════════════════════════════════════════

pub fn insert_conversation(
    conn: &Connection,
    conversation: &Conversation,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO conversations (id, title, created_at, updated_at, active)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            conversation.id,
            conversation.title,
            conversation.created_at,
            conversation.updated_at,
            conversation.active as i32,
        ],
    )?;
    Ok(())
}

pub fn get_conversation(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<Conversation>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, created_at, updated_at, active
         FROM conversations WHERE id = ?1",
    )?;
    let conversation = stmt
        .query_row(params![id], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
                active: row.get::<_, i32>(4)? != 0,
            })
        })
        .optional()?;
    Ok(conversation)
}

/// List active conversations, most recently updated first.
pub fn list_active_conversations(conn: &Connection) -> Result<Vec<Conversation>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, created_at, updated_at, active
         FROM conversations WHERE active = 1
         ORDER BY updated_at DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Conversation {
            id: row.get(0)?,
            title: row.get(1)?,
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            active: row.get::<_, i32>(4)? != 0,
        })
    })?;

    let mut conversations = Vec::new();
    for row in rows {
        conversations.push(row?);
    }
    Ok(conversations)
}

pub fn update_conversation_title(
    conn: &Connection,
    id: &Uuid,
    title: &str,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
        params![title, at, id],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "conversation".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

pub fn set_conversation_active(
    conn: &Connection,
    id: &Uuid,
    active: bool,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE conversations SET active = ?1, updated_at = ?2 WHERE id = ?3",
        params![active as i32, at, id],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "conversation".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Bump a conversation's updated_at (called on every message insert).
pub fn touch_conversation(
    conn: &Connection,
    id: &Uuid,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![at, id],
    )?;
    Ok(())
}

// ═══════════════════════════════════════════
// Message repository
// ═══════════════════════════════════════════

pub fn insert_message(conn: &Connection, message: &Message) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, role, content, model, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            message.id,
            message.conversation_id,
            message.role.as_str(),
            message.content,
            message.model,
            message.created_at,
        ],
    )?;
    Ok(())
}

/// All messages of a conversation, ordered by creation time.
pub fn list_messages(
    conn: &Connection,
    conversation_id: &Uuid,
) -> Result<Vec<Message>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, content, model, created_at
         FROM messages WHERE conversation_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok((
            row.get::<_, Uuid>(0)?,
            row.get::<_, Uuid>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, DateTime<Utc>>(5)?,
        ))
    })?;

    let mut messages = Vec::new();
    for row in rows {
        let (id, conversation_id, role, content, model, created_at) = row?;
        messages.push(Message {
            id,
            conversation_id,
            role: MessageRole::from_str(&role)?,
            content,
            model,
            created_at,
        });
    }
    Ok(messages)
}

/// Delete every message of a conversation. Returns the number of rows removed.
pub fn delete_messages(conn: &Connection, conversation_id: &Uuid) -> Result<usize, DatabaseError> {
    let deleted = conn.execute(
        "DELETE FROM messages WHERE conversation_id = ?1",
        params![conversation_id],
    )?;
    Ok(deleted)
}

// ═══════════════════════════════════════════
// Preferences repository
// ═══════════════════════════════════════════

pub fn get_preference(conn: &Connection, key: &str) -> Result<Option<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT value FROM preferences WHERE key = ?1")?;
    let value = stmt
        .query_row(params![key], |row| row.get::<_, String>(0))
        .optional()?;
    Ok(value)
}

pub fn set_preference(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO preferences (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn conversation(title: &str) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            active: true,
        }
    }

    fn message(conversation_id: Uuid, role: MessageRole, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content: content.to_string(),
            model: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn conversation_round_trips() {
        let conn = open_memory_database().unwrap();
        let conv = conversation("My chat");
        insert_conversation(&conn, &conv).unwrap();

        let loaded = get_conversation(&conn, &conv.id).unwrap().unwrap();
        assert_eq!(loaded.id, conv.id);
        assert_eq!(loaded.title, "My chat");
        assert!(loaded.active);
    }

    #[test]
    fn missing_conversation_is_none() {
        let conn = open_memory_database().unwrap();
        assert!(get_conversation(&conn, &Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn list_excludes_soft_deleted() {
        let conn = open_memory_database().unwrap();
        let keep = conversation("keep");
        let drop = conversation("drop");
        insert_conversation(&conn, &keep).unwrap();
        insert_conversation(&conn, &drop).unwrap();

        set_conversation_active(&conn, &drop.id, false, Utc::now()).unwrap();

        let listed = list_active_conversations(&conn).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, keep.id);
        // The soft-deleted row itself still exists.
        assert!(get_conversation(&conn, &drop.id).unwrap().is_some());
    }

    #[test]
    fn list_orders_by_updated_at_desc() {
        let conn = open_memory_database().unwrap();
        let old = conversation("old");
        let new = conversation("new");
        insert_conversation(&conn, &old).unwrap();
        insert_conversation(&conn, &new).unwrap();

        touch_conversation(&conn, &new.id, Utc::now() + chrono::Duration::seconds(5)).unwrap();

        let listed = list_active_conversations(&conn).unwrap();
        assert_eq!(listed[0].title, "new");
        assert_eq!(listed[1].title, "old");
    }

    #[test]
    fn rename_missing_conversation_fails() {
        let conn = open_memory_database().unwrap();
        let err = update_conversation_title(&conn, &Uuid::new_v4(), "title", Utc::now());
        assert!(matches!(err, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn messages_round_trip_in_order() {
        let conn = open_memory_database().unwrap();
        let conv = conversation("chat");
        insert_conversation(&conn, &conv).unwrap();

        let mut first = message(conv.id, MessageRole::User, "Hello");
        let mut second = message(conv.id, MessageRole::Assistant, "Hi there");
        first.created_at = Utc::now();
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        second.model = Some("gpt-4o".into());
        insert_message(&conn, &first).unwrap();
        insert_message(&conn, &second).unwrap();

        let loaded = list_messages(&conn, &conv.id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].role, MessageRole::User);
        assert_eq!(loaded[0].content, "Hello");
        assert_eq!(loaded[1].role, MessageRole::Assistant);
        assert_eq!(loaded[1].model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn delete_messages_clears_only_one_conversation() {
        let conn = open_memory_database().unwrap();
        let a = conversation("a");
        let b = conversation("b");
        insert_conversation(&conn, &a).unwrap();
        insert_conversation(&conn, &b).unwrap();
        insert_message(&conn, &message(a.id, MessageRole::User, "one")).unwrap();
        insert_message(&conn, &message(a.id, MessageRole::User, "two")).unwrap();
        insert_message(&conn, &message(b.id, MessageRole::User, "other")).unwrap();

        let deleted = delete_messages(&conn, &a.id).unwrap();
        assert_eq!(deleted, 2);
        assert!(list_messages(&conn, &a.id).unwrap().is_empty());
        assert_eq!(list_messages(&conn, &b.id).unwrap().len(), 1);
    }

    #[test]
    fn preference_upserts() {
        let conn = open_memory_database().unwrap();
        assert!(get_preference(&conn, "chat_mode").unwrap().is_none());

        set_preference(&conn, "chat_mode", "online").unwrap();
        set_preference(&conn, "chat_mode", "offline").unwrap();

        assert_eq!(
            get_preference(&conn, "chat_mode").unwrap().as_deref(),
            Some("offline")
        );
    }
}
