use crate::Database;
use crate::models::{MessageRow, UserRow};
use anyhow::Result;
use rusqlite::Connection;

use atrium_types::models::Role;

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        email: &str,
        password_hash: &str,
        role: Role,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, password, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, username, email, password_hash, role.as_str(), created_at],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "lower(email) = lower(?1)", email))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "lower(username) = lower(?1)", username))
    }

    /// The single distinguished admin account.
    pub fn admin_user(&self) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE role = 'admin' LIMIT 1"
            ))?;
            stmt.query_row([], user_from_row).optional()
        })
    }

    /// Every non-admin account, i.e. the possible conversation partners of
    /// the admin.
    pub fn visitor_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE role != 'admin' ORDER BY created_at, rowid"
            ))?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_last_login(&self, id: &str, when: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET last_login = ?2 WHERE id = ?1", [id, when])?;
            Ok(())
        })
    }

    pub fn delete_user(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    // -- Messages --

    pub fn insert_message(&self, row: &MessageRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, content, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    row.id,
                    row.sender_id,
                    row.receiver_id,
                    row.content,
                    row.read,
                    row.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// All messages between the unordered pair {a, b}, oldest first.
    /// Ties on created_at fall back to insertion order via rowid.
    pub fn conversation_between(&self, a: &str, b: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at, rowid"
            ))?;
            let rows = stmt
                .query_map([a, b], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Every message the user sent or received, oldest first.
    pub fn messages_for_user(&self, user_id: &str) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE sender_id = ?1 OR receiver_id = ?1
                 ORDER BY created_at, rowid"
            ))?;
            let rows = stmt
                .query_map([user_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn last_message(&self, a: &str, b: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1"
            ))?;
            stmt.query_row([a, b], message_from_row).optional()
        })
    }

    /// Unread messages sent by `from` that `to` has not read yet.
    pub fn unread_count(&self, from: &str, to: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0",
                [from, to],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Flip the read flag, but only when `reader_id` is the stored receiver.
    /// Returns the updated row, or `None` when the message does not exist or
    /// the caller is not its receiver. The receiver-only rule lives here so
    /// the REST and gateway paths cannot diverge.
    pub fn mark_read(&self, message_id: &str, reader_id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET read = 1 WHERE id = ?1 AND receiver_id = ?2",
                [message_id, reader_id],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            query_message(conn, message_id)
        })
    }

    /// Bulk flip for the admin's implicit mark-all-read on conversation
    /// fetch. Returns how many rows changed.
    pub fn mark_conversation_read(&self, from: &str, to: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE messages SET read = 1
                 WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0",
                [from, to],
            )?;
            Ok(updated)
        })
    }

    /// Administrative bulk delete of every message between the pair.
    pub fn delete_conversation(&self, a: &str, b: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)",
                [a, b],
            )?;
            Ok(deleted)
        })
    }
}

const USER_COLUMNS: &str = "id, username, email, password, role, created_at, last_login";
const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, read, created_at";

fn query_user(conn: &Connection, predicate: &str, param: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE {predicate} LIMIT 1"
    ))?;
    stmt.query_row([param], user_from_row).optional()
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
    ))?;
    stmt.query_row([id], message_from_row).optional()
}

fn user_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        role: row.get(4)?,
        created_at: row.get(5)?,
        last_login: row.get(6)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        content: row.get(3)?,
        read: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
