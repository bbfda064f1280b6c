use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageId, UserId, UserSummary};

/// Frames sent FROM a client TO the server over a room socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Submit a message to the room. File messages carry the blob URL as content.
    Message {
        message: String,
        #[serde(default)]
        is_file: bool,
    },

    /// Acknowledge everything unread in this room.
    MessageRead,

    /// Typing indicator; relayed to the room, never persisted.
    Typing { is_typing: bool },
}

/// Events delivered to room sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// A message was posted. System notices use the reserved System sender
    /// and carry no id since they are broadcast-only.
    ChatMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<MessageId>,
        message: String,
        sender: UserSummary,
        timestamp: DateTime<Utc>,
        is_file: bool,
        is_image: bool,
    },

    /// Join/leave/typing activity from another room member.
    ChatActivity {
        user_id: UserId,
        username: String,
        #[serde(flatten)]
        activity: Activity,
    },

    /// Group membership or admin change.
    GroupUpdate {
        #[serde(flatten)]
        change: GroupChange,
    },

    MessageEdited {
        message_id: MessageId,
        content: String,
        sender_id: UserId,
    },

    MessageDeleted { message_id: MessageId },

    /// Synchronous rejection report for a frame-initiated action.
    Error { detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Activity {
    UserJoin,
    UserLeave,
    Typing { is_typing: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GroupChange {
    MemberAdded { user_id: UserId, added_by: UserId },
    MemberLeft {
        user_id: UserId,
        new_admin_id: Option<UserId>,
    },
    MemberKicked { user_id: UserId },
    AdminTransferred {
        new_admin_id: UserId,
        old_admin_id: UserId,
    },
}

/// Events delivered to a user's personal notification socket, independent of
/// which room UI is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    NewMessage {
        from: String,
        from_user_id: UserId,
        room_id: Uuid,
        room_name: String,
        content: String,
    },

    StatusChange { user_id: UserId, is_online: bool },

    /// Per-reader event after mark_read; never broadcast to the room.
    UnreadCleared { room_id: Uuid, total_unread: i64 },

    /// Sidebar refresh after an edit or delete. Content is a summary line,
    /// not the raw message.
    MessageUpdated {
        room_id: Uuid,
        content: String,
        from: String,
        from_user_id: UserId,
        is_group: bool,
        is_delete: bool,
    },

    FriendRequestReceived {
        from_user_id: UserId,
        from_username: String,
    },
    FriendRequestAccepted { user_id: UserId, username: String },
    FriendRequestRejected { user_id: UserId },
    FriendRequestCancelled { user_id: UserId },

    GroupCreated { room_id: Uuid, room_name: String },
    GroupDeleted { room_id: Uuid, room_name: String },
    KickedFromGroup { room_id: Uuid, room_name: String },
    AddedToGroup {
        room_id: Uuid,
        room_name: String,
        added_by: String,
    },
    AdminTransferred { room_id: Uuid, room_name: String },
}
