use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageView, UserId};

/// JWT claims shared by the REST middleware and both socket upgrade
/// handlers. Tokens are issued by the external auth provider; this core only
/// verifies them. Canonical definition lives here in clique-types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: UserId,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub exp: usize,
}

// -- Groups --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGroupRequest {
    pub name: String,
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Serialize)]
pub struct RoomCreatedResponse {
    pub room_id: Uuid,
    pub name: String,
    pub created: bool,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    20
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub messages: Vec<MessageView>,
}

// -- Sidebar --

/// One row of the room sidebar: display name resolved per kind (group name,
/// or the other user's name for private rooms), unread counter, last
/// activity for ordering.
#[derive(Debug, Serialize)]
pub struct RoomOverview {
    pub room_id: Uuid,
    pub display_name: String,
    pub is_group: bool,
    pub other_user_id: Option<UserId>,
    pub is_online: bool,
    pub unread_count: i64,
    pub last_message: Option<String>,
    pub last_activity: DateTime<Utc>,
}
