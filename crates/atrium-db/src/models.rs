//! Database row types — these map directly to SQLite rows.
//! Distinct from atrium-types API models to keep the DB layer independent.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use atrium_types::models::{Message, Role, User};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: String,
    pub created_at: String,
    pub last_login: Option<String>,
}

impl UserRow {
    /// Convert to the public profile shape. Corrupt columns are logged and
    /// replaced with defaults rather than failing a whole listing.
    pub fn into_user(self) -> User {
        User {
            id: parse_uuid(&self.id, "user id"),
            username: self.username,
            email: self.email,
            role: Role::from_db(&self.role).unwrap_or_else(|| {
                warn!("Corrupt role '{}' on user '{}'", self.role, self.id);
                Role::User
            }),
            created_at: parse_timestamp(&self.created_at, &self.id),
            last_login: self.last_login.as_deref().map(|t| parse_timestamp(t, &self.id)),
        }
    }
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub read: bool,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        Message {
            id: parse_uuid(&self.id, "message id"),
            sender_id: parse_uuid(&self.sender_id, "sender id"),
            receiver_id: parse_uuid(&self.receiver_id, "receiver id"),
            content: self.content,
            read: self.read,
            created_at: parse_timestamp(&self.created_at, &self.id),
        }
    }
}

/// Canonical storage form for timestamps: fixed-width RFC 3339 with
/// microsecond precision, so lexicographic order in SQL matches time order.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

fn parse_timestamp(raw: &str, row_id: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite-style "YYYY-MM-DD HH:MM:SS" without timezone: parse as
            // naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on row '{}': {}", raw, row_id, e);
            DateTime::default()
        })
}
