use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Users are owned by the external identity provider and referenced by
/// numeric id everywhere. Id 0 is reserved for the System sender.
pub type UserId = i64;

pub type MessageId = i64;

pub const SYSTEM_USER_ID: UserId = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub full_name: Option<String>,
}

impl UserSummary {
    /// Sender used for broadcast-only system messages (kick/add notices).
    pub fn system() -> Self {
        Self {
            id: SYSTEM_USER_ID,
            username: "System".to_string(),
            full_name: None,
        }
    }

    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.username,
        }
    }
}

/// Room kind is decided once at creation and never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomKind {
    /// Exactly two members, uniquely keyed by the sorted (user_a, user_b) pair.
    Private { user_a: UserId, user_b: UserId },
    /// One designated admin among the members.
    Group { admin_id: UserId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub kind: RoomKind,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, RoomKind::Group { .. })
    }

    pub fn admin_id(&self) -> Option<UserId> {
        match self.kind {
            RoomKind::Group { admin_id } => Some(admin_id),
            RoomKind::Private { .. } => None,
        }
    }

    /// For a private room, the member that isn't `user`.
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        match self.kind {
            RoomKind::Private { user_a, user_b } if user_a == user => Some(user_b),
            RoomKind::Private { user_a, user_b } if user_b == user => Some(user_a),
            _ => None,
        }
    }
}

/// Rendered message form used by history responses and the chat_message event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub room_id: Uuid,
    pub sender: UserSummary,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_file: bool,
    pub is_image: bool,
    pub is_deleted: bool,
    /// Display-only flag for history queries; independent of read tracking.
    pub is_me: bool,
}

/// File messages store a URL; images are recognized by extension so clients
/// can render them inline.
pub fn is_image_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    match lower.rsplit_once('.') {
        Some((_, ext)) => ["png", "jpg", "jpeg", "gif", "webp"].contains(&ext),
        None => false,
    }
}
