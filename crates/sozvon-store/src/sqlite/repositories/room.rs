//! Room repository over the `chats` and `chat_members` tables.

use rusqlite::{Connection, OptionalExtension, params};
use sozvon_core::Identity;
use uuid::Uuid;

use crate::errors::{Result, StoreError};
use crate::timestamp;
use crate::types::{ChatSummary, Room};

/// Room repository. Stateless; every method takes `&Connection`.
pub struct RoomRepo;

impl RoomRepo {
    /// Insert a room and its members in one transaction.
    pub fn create(conn: &Connection, members: &[Identity], active: bool) -> Result<Room> {
        validate_members(members)?;

        let id = Uuid::now_v7().to_string();
        let created_at = timestamp();
        let tx = conn.unchecked_transaction()?;
        let _ = tx.execute(
            "INSERT INTO chats (id, active, created_at) VALUES (?1, ?2, ?3)",
            params![id, active, created_at],
        )?;
        for member in members {
            let _ = tx.execute(
                "INSERT INTO chat_members (chat_id, login) VALUES (?1, ?2)",
                params![id, member.as_str()],
            )?;
        }
        tx.commit()?;

        Ok(Room {
            id,
            members: members.to_vec(),
            active,
            created_at,
        })
    }

    /// Fetch a room by id.
    pub fn get(conn: &Connection, chat_id: &str) -> Result<Option<Room>> {
        let row = conn
            .query_row(
                "SELECT id, active, created_at FROM chats WHERE id = ?1",
                params![chat_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, active, created_at)) = row else {
            return Ok(None);
        };
        let members = Self::members(conn, &id)?;
        Ok(Some(Room {
            id,
            members,
            active,
            created_at,
        }))
    }

    /// Member logins of a room, in insertion order. Empty for unknown rooms.
    pub fn members(conn: &Connection, chat_id: &str) -> Result<Vec<Identity>> {
        let mut stmt =
            conn.prepare_cached("SELECT login FROM chat_members WHERE chat_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(params![chat_id], |row| row.get::<_, String>(0))?;
        let mut members = Vec::new();
        for login in rows {
            members.push(Identity::new(login?));
        }
        Ok(members)
    }

    /// Id of a room both `a` and `b` belong to, if any.
    pub fn find_direct(conn: &Connection, a: &Identity, b: &Identity) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT c.id
                 FROM chats c
                 JOIN chat_members m1 ON m1.chat_id = c.id AND m1.login = ?1
                 JOIN chat_members m2 ON m2.chat_id = c.id AND m2.login = ?2
                 ORDER BY c.created_at
                 LIMIT 1",
                params![a.as_str(), b.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Flip `active` from false to true. Returns whether this call did it.
    pub fn activate(conn: &Connection, chat_id: &str) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE chats SET active = 1 WHERE id = ?1 AND active = 0",
            params![chat_id],
        )?;
        Ok(changed == 1)
    }

    /// Active rooms `login` belongs to, newest activity first.
    pub fn list_for_user(conn: &Connection, login: &Identity) -> Result<Vec<ChatSummary>> {
        let mut stmt = conn.prepare_cached(
            "SELECT c.id,
                    COALESCE(last.text, ''),
                    COALESCE(last.created_at, c.created_at) AS updated_at
             FROM chats c
             LEFT JOIN messages last ON last.rowid = (
                 SELECT m.rowid FROM messages m
                 WHERE m.chat_id = c.id
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT 1
             )
             WHERE c.active = 1
               AND c.id IN (SELECT chat_id FROM chat_members WHERE login = ?1)
             ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![login.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut chats = Vec::new();
        for row in rows {
            let (chat_id, last_message, updated_at) = row?;
            let members = Self::members(conn, &chat_id)?;
            chats.push(ChatSummary {
                chat_id,
                members,
                last_message,
                updated_at,
            });
        }
        Ok(chats)
    }
}

fn validate_members(members: &[Identity]) -> Result<()> {
    if members.len() < 2 {
        return Err(StoreError::InvalidMembers("a chat needs at least two members".into()));
    }
    if members.iter().any(|m| m.as_str().is_empty()) {
        return Err(StoreError::InvalidMembers("member login cannot be empty".into()));
    }
    for (i, m) in members.iter().enumerate() {
        if members[..i].contains(m) {
            return Err(StoreError::InvalidMembers(format!("duplicate member: {m}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::repositories::MessageRepo;
    use crate::sqlite::run_migrations;
    use assert_matches::assert_matches;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let _ = run_migrations(&conn).unwrap();
        conn
    }

    fn ids(logins: &[&str]) -> Vec<Identity> {
        logins.iter().map(|l| Identity::new(*l)).collect()
    }

    #[test]
    fn create_and_get() {
        let conn = setup();
        let room = RoomRepo::create(&conn, &ids(&["alice", "bob"]), false).unwrap();
        assert!(!room.active);

        let fetched = RoomRepo::get(&conn, &room.id).unwrap().unwrap();
        assert_eq!(fetched, room);
        assert!(RoomRepo::get(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn members_of_unknown_room_is_empty() {
        let conn = setup();
        assert!(RoomRepo::members(&conn, "nope").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_member_sets() {
        let conn = setup();
        assert_matches!(
            RoomRepo::create(&conn, &ids(&["alice"]), false),
            Err(StoreError::InvalidMembers(_))
        );
        assert_matches!(
            RoomRepo::create(&conn, &ids(&["alice", "alice"]), false),
            Err(StoreError::InvalidMembers(_))
        );
        assert_matches!(
            RoomRepo::create(&conn, &ids(&["alice", ""]), false),
            Err(StoreError::InvalidMembers(_))
        );
    }

    #[test]
    fn activate_exactly_once() {
        let conn = setup();
        let room = RoomRepo::create(&conn, &ids(&["alice", "bob"]), false).unwrap();
        assert!(RoomRepo::activate(&conn, &room.id).unwrap());
        assert!(!RoomRepo::activate(&conn, &room.id).unwrap());
        assert!(!RoomRepo::activate(&conn, "missing").unwrap());
        assert!(RoomRepo::get(&conn, &room.id).unwrap().unwrap().active);
    }

    #[test]
    fn find_direct_either_order() {
        let conn = setup();
        let room = RoomRepo::create(&conn, &ids(&["alice", "bob"]), false).unwrap();
        let a = Identity::new("alice");
        let b = Identity::new("bob");
        assert_eq!(RoomRepo::find_direct(&conn, &a, &b).unwrap(), Some(room.id.clone()));
        assert_eq!(RoomRepo::find_direct(&conn, &b, &a).unwrap(), Some(room.id));
        assert!(RoomRepo::find_direct(&conn, &a, &Identity::new("carol")).unwrap().is_none());
    }

    #[test]
    fn list_only_active_rooms_with_last_message() {
        let conn = setup();
        let alice = Identity::new("alice");
        let active = RoomRepo::create(&conn, &ids(&["alice", "bob"]), false).unwrap();
        let _inactive = RoomRepo::create(&conn, &ids(&["alice", "carol"]), false).unwrap();
        let _ = RoomRepo::activate(&conn, &active.id).unwrap();
        let _ = MessageRepo::insert(&conn, &active.id, &alice, "first").unwrap();
        let _ = MessageRepo::insert(&conn, &active.id, &Identity::new("bob"), "second").unwrap();

        let chats = RoomRepo::list_for_user(&conn, &alice).unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].chat_id, active.id);
        assert_eq!(chats[0].last_message, "second");
        assert_eq!(chats[0].members, ids(&["alice", "bob"]));

        assert!(RoomRepo::list_for_user(&conn, &Identity::new("carol")).unwrap().is_empty());
    }

    #[test]
    fn active_room_without_messages_lists_empty_text() {
        let conn = setup();
        let room = RoomRepo::create(&conn, &ids(&["alice", "bob"]), true).unwrap();
        let chats = RoomRepo::list_for_user(&conn, &Identity::new("bob")).unwrap();
        assert_eq!(chats[0].last_message, "");
        assert_eq!(chats[0].updated_at, room.created_at);
    }
}
