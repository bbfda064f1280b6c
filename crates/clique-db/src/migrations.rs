use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Mirror of the external identity provider: id/username/full_name
        -- are provider-owned, is_online belongs to the presence tracker.
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            full_name   TEXT,
            is_online   INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            kind        TEXT NOT NULL CHECK (kind IN ('private', 'group')),
            admin_id    INTEGER REFERENCES users(id),
            is_deleted  INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        -- At most one private room per unordered pair; user_a < user_b.
        CREATE TABLE IF NOT EXISTS private_pairs (
            user_a      INTEGER NOT NULL REFERENCES users(id),
            user_b      INTEGER NOT NULL REFERENCES users(id),
            room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            PRIMARY KEY (user_a, user_b),
            CHECK (user_a < user_b)
        );

        CREATE TABLE IF NOT EXISTS room_members (
            room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            user_id     INTEGER NOT NULL REFERENCES users(id),
            joined_at   TEXT NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_room_members_user
            ON room_members(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id     TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            author_id   INTEGER REFERENCES users(id) ON DELETE SET NULL,
            content     TEXT NOT NULL,
            is_file     INTEGER NOT NULL DEFAULT 0,
            is_deleted  INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            edited_at   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_id, created_at);

        CREATE TABLE IF NOT EXISTS read_statuses (
            user_id     INTEGER NOT NULL REFERENCES users(id),
            message_id  INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            is_read     INTEGER NOT NULL DEFAULT 0,
            read_at     TEXT,
            PRIMARY KEY (user_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_read_statuses_unread
            ON read_statuses(user_id, is_read);

        CREATE TABLE IF NOT EXISTS friend_links (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            from_user   INTEGER NOT NULL REFERENCES users(id),
            to_user     INTEGER NOT NULL REFERENCES users(id),
            is_accepted INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            UNIQUE (from_user, to_user)
        );

        -- Reserved sender for broadcast-only system notices.
        INSERT OR IGNORE INTO users (id, username) VALUES (0, 'System');
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
