/// Database row types — these map directly to SQLite rows. Conversion to the
/// clique-types API models happens at the service layer.

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub full_name: Option<String>,
    pub is_online: bool,
}

pub struct RoomRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub admin_id: Option<i64>,
    pub is_deleted: bool,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: i64,
    pub room_id: String,
    pub author_id: Option<i64>,
    pub author_username: Option<String>,
    pub author_full_name: Option<String>,
    pub content: String,
    pub is_file: bool,
    pub is_deleted: bool,
    pub created_at: String,
    pub edited_at: Option<String>,
}

pub struct FriendLinkRow {
    pub id: i64,
    pub from_user: i64,
    pub to_user: i64,
    pub is_accepted: bool,
    pub created_at: String,
}
