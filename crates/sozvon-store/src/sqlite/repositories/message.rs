//! Message repository over the `messages` table.

use rusqlite::{Connection, params};
use sozvon_core::Identity;
use uuid::Uuid;

use crate::errors::Result;
use crate::timestamp;
use crate::types::StoredMessage;

/// Message repository. Stateless; every method takes `&Connection`.
pub struct MessageRepo;

impl MessageRepo {
    /// Persist a message, assigning its id and timestamp.
    pub fn insert(
        conn: &Connection,
        chat_id: &str,
        sender: &Identity,
        text: &str,
    ) -> Result<StoredMessage> {
        let id = Uuid::now_v7().to_string();
        let created_at = timestamp();
        let _ = conn.execute(
            "INSERT INTO messages (id, chat_id, sender_login, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, chat_id, sender.as_str(), text, created_at],
        )?;
        Ok(StoredMessage {
            id,
            chat_id: chat_id.to_string(),
            sender: sender.clone(),
            text: text.to_string(),
            created_at,
        })
    }

    /// Messages of a room, oldest first.
    pub fn list(conn: &Connection, chat_id: &str, limit: u32, offset: u32) -> Result<Vec<StoredMessage>> {
        let mut stmt = conn.prepare_cached(
            "SELECT id, chat_id, sender_login, text, created_at
             FROM messages
             WHERE chat_id = ?1
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![chat_id, limit, offset], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                sender: Identity::new(row.get::<_, String>(2)?),
                text: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        let mut messages = Vec::new();
        for msg in rows {
            messages.push(msg?);
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::sqlite::repositories::RoomRepo;
    use crate::sqlite::run_migrations;
    use assert_matches::assert_matches;

    fn setup() -> (Connection, String) {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let _ = run_migrations(&conn).unwrap();
        let room = RoomRepo::create(&conn, &[Identity::new("alice"), Identity::new("bob")], false)
            .unwrap();
        (conn, room.id)
    }

    #[test]
    fn insert_assigns_id_and_time() {
        let (conn, chat) = setup();
        let msg = MessageRepo::insert(&conn, &chat, &Identity::new("alice"), "hi").unwrap();
        assert_eq!(msg.chat_id, chat);
        assert_eq!(msg.sender, "alice");
        assert!(!msg.id.is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(&msg.created_at).is_ok());
    }

    #[test]
    fn list_in_order_with_paging() {
        let (conn, chat) = setup();
        for i in 0..5 {
            let _ = MessageRepo::insert(&conn, &chat, &Identity::new("bob"), &format!("m{i}")).unwrap();
        }
        let all = MessageRepo::list(&conn, &chat, 50, 0).unwrap();
        let texts: Vec<_> = all.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["m0", "m1", "m2", "m3", "m4"]);

        let page = MessageRepo::list(&conn, &chat, 2, 3).unwrap();
        let texts: Vec<_> = page.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["m3", "m4"]);
    }

    #[test]
    fn insert_into_unknown_room_fails() {
        let (conn, _) = setup();
        assert_matches!(
            MessageRepo::insert(&conn, "missing", &Identity::new("alice"), "hi"),
            Err(StoreError::Sqlite(_))
        );
    }
}
