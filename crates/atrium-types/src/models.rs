use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account role. Exactly one account holds `Admin`; every visitor
/// conversation is with that account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn from_db(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Public profile shape; never carries the password hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// A direct message between two users.
///
/// Content is immutable once stored; only the `read` flag changes, and it
/// moves false -> true exactly once, driven by the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_db_text() {
        assert_eq!(Role::from_db(Role::Admin.as_str()), Some(Role::Admin));
        assert_eq!(Role::from_db(Role::User.as_str()), Some(Role::User));
        assert_eq!(Role::from_db("superuser"), None);
    }

    #[test]
    fn message_serializes_camel_case() {
        let msg = Message {
            id: Uuid::nil(),
            sender_id: Uuid::nil(),
            receiver_id: Uuid::nil(),
            content: "hi".into(),
            read: false,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("senderId").is_some());
        assert!(json.get("receiverId").is_some());
        assert!(json.get("createdAt").is_some());
    }
}
