use anyhow::Result;
use rusqlite::params;
use uuid::Uuid;

use crate::Database;
use crate::models::{FriendLinkRow, MessageRow, RoomRow, UserRow};

impl Database {
    // -- Users (mirror of the external identity provider) --

    pub fn upsert_user(&self, id: i64, username: &str, full_name: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, full_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = ?2, full_name = ?3",
                params![id, username, full_name],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, full_name, is_online FROM users WHERE id = ?1",
                [id],
                map_user,
            )
            .optional()
        })
    }

    /// Startup hygiene: no sockets are open yet, so nobody is online.
    pub fn reset_presence(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET is_online = 0 WHERE is_online = 1", [])?;
            Ok(())
        })
    }

    pub fn set_user_online(&self, id: i64, is_online: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_online = ?2 WHERE id = ?1",
                params![id, is_online],
            )?;
            Ok(())
        })
    }

    // -- Rooms --

    /// Idempotent per unordered pair: returns the existing private room for
    /// (u1, u2) or atomically creates room + pairing record + memberships.
    pub fn get_or_create_private_room(
        &self,
        u1: i64,
        u2: i64,
        name: &str,
        now: &str,
    ) -> Result<(String, bool)> {
        let (a, b) = if u1 < u2 { (u1, u2) } else { (u2, u1) };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existing: Option<String> = tx
                .query_row(
                    "SELECT room_id FROM private_pairs WHERE user_a = ?1 AND user_b = ?2",
                    params![a, b],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(room_id) = existing {
                return Ok((room_id, false));
            }

            let room_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO rooms (id, name, kind, created_at) VALUES (?1, ?2, 'private', ?3)",
                params![room_id, name, now],
            )?;
            tx.execute(
                "INSERT INTO private_pairs (user_a, user_b, room_id) VALUES (?1, ?2, ?3)",
                params![a, b, room_id],
            )?;
            for user in [a, b] {
                tx.execute(
                    "INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    params![room_id, user, now],
                )?;
            }
            tx.commit()?;

            Ok((room_id, true))
        })
    }

    pub fn create_group_room(
        &self,
        name: &str,
        admin_id: i64,
        member_ids: &[i64],
        now: &str,
    ) -> Result<String> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let room_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO rooms (id, name, kind, admin_id, created_at)
                 VALUES (?1, ?2, 'group', ?3, ?4)",
                params![room_id, name, admin_id, now],
            )?;
            tx.execute(
                "INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![room_id, admin_id, now],
            )?;
            for user in member_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO room_members (room_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    params![room_id, user, now],
                )?;
            }
            tx.commit()?;

            Ok(room_id)
        })
    }

    /// Live rooms only; a deleted room no longer resolves.
    pub fn get_room(&self, room_id: &str) -> Result<Option<RoomRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, kind, admin_id, is_deleted, created_at
                 FROM rooms WHERE id = ?1 AND is_deleted = 0",
                [room_id],
                map_room,
            )
            .optional()
        })
    }

    pub fn private_pair_of_room(&self, room_id: &str) -> Result<Option<(i64, i64)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT user_a, user_b FROM private_pairs WHERE room_id = ?1",
                [room_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
    }

    /// Soft-flags the room and hard-deletes its messages (read statuses go
    /// with them via FK cascade) and membership rows.
    pub fn delete_room(&self, room_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE room_id = ?1", [room_id])?;
            tx.execute("DELETE FROM room_members WHERE room_id = ?1", [room_id])?;
            tx.execute("DELETE FROM private_pairs WHERE room_id = ?1", [room_id])?;
            tx.execute("UPDATE rooms SET is_deleted = 1 WHERE id = ?1", [room_id])?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn rooms_of_user(&self, user_id: i64) -> Result<Vec<RoomRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.name, r.kind, r.admin_id, r.is_deleted, r.created_at
                 FROM rooms r
                 JOIN room_members rm ON rm.room_id = r.id
                 WHERE rm.user_id = ?1 AND r.is_deleted = 0",
            )?;
            let rows = stmt
                .query_map([user_id], map_room)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Membership --

    pub fn is_member(&self, room_id: &str, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn room_member_ids(&self, room_id: &str) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM room_members WHERE room_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt
                .query_map([room_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn add_member(&self, room_id: &str, user_id: i64, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_members (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![room_id, user_id, now],
            )?;
            Ok(())
        })
    }

    pub fn remove_member(&self, room_id: &str, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn set_admin(&self, room_id: &str, admin_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE rooms SET admin_id = ?2 WHERE id = ?1",
                params![room_id, admin_id],
            )?;
            Ok(())
        })
    }

    /// Deterministic admin-reassignment choice on leave.
    pub fn lowest_member_id(&self, room_id: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let min: Option<i64> = conn.query_row(
                "SELECT MIN(user_id) FROM room_members WHERE room_id = ?1",
                [room_id],
                |row| row.get(0),
            )?;
            Ok(min)
        })
    }

    /// One row per (user, co-member, shared room); the roster folds these
    /// into per-pair counts at startup.
    pub fn comember_pairs(&self) -> Result<Vec<(i64, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT a.user_id, b.user_id
                 FROM room_members a
                 JOIN room_members b
                   ON a.room_id = b.room_id AND a.user_id <> b.user_id
                 JOIN rooms r ON r.id = a.room_id
                 WHERE r.is_deleted = 0",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        room_id: &str,
        author_id: i64,
        content: &str,
        is_file: bool,
        now: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (room_id, author_id, content, is_file, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![room_id, author_id, content, is_file, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
                [id],
                map_message,
            )
            .optional()
        })
    }

    pub fn set_message_content(&self, id: i64, content: &str, edited_at: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1",
                params![id, content, edited_at],
            )?;
            Ok(())
        })
    }

    pub fn soft_delete_message(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE messages SET is_deleted = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Newest first; callers reverse for display.
    pub fn room_messages(&self, room_id: &str, offset: u32, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.room_id = ?1
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![room_id, limit, offset], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn last_message(&self, room_id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "{MESSAGE_SELECT}
                     WHERE m.room_id = ?1
                     ORDER BY m.created_at DESC, m.id DESC
                     LIMIT 1"
                ),
                [room_id],
                map_message,
            )
            .optional()
        })
    }

    // -- Read statuses --

    pub fn insert_read_status(&self, user_id: i64, message_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO read_statuses (user_id, message_id, is_read) VALUES (?1, ?2, 0)",
                params![user_id, message_id],
            )?;
            Ok(())
        })
    }

    /// Retroactive only: flips the user's unread rows for this room and
    /// returns how many were flipped. Rows created afterward are unaffected.
    pub fn mark_room_read(&self, user_id: i64, room_id: &str, now: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE read_statuses SET is_read = 1, read_at = ?3
                 WHERE user_id = ?1 AND is_read = 0
                   AND message_id IN (SELECT id FROM messages WHERE room_id = ?2)",
                params![user_id, room_id, now],
            )?;
            Ok(updated)
        })
    }

    pub fn unread_count(&self, user_id: i64, room_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM read_statuses rs
                 JOIN messages m ON m.id = rs.message_id
                 WHERE rs.user_id = ?1 AND rs.is_read = 0 AND m.room_id = ?2",
                params![user_id, room_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn total_unread(&self, user_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM read_statuses WHERE user_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn read_statuses_for_message(&self, message_id: i64) -> Result<Vec<(i64, bool)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, is_read FROM read_statuses WHERE message_id = ?1",
            )?;
            let rows = stmt
                .query_map([message_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Friend links --

    /// Directed get-or-create; a duplicate send returns the existing link.
    pub fn create_friend_request(
        &self,
        from_user: i64,
        to_user: i64,
        now: &str,
    ) -> Result<(FriendLinkRow, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existing = tx
                .query_row(
                    "SELECT id, from_user, to_user, is_accepted, created_at
                     FROM friend_links WHERE from_user = ?1 AND to_user = ?2",
                    params![from_user, to_user],
                    map_friend_link,
                )
                .optional()?;

            if let Some(link) = existing {
                return Ok((link, false));
            }

            tx.execute(
                "INSERT INTO friend_links (from_user, to_user, created_at) VALUES (?1, ?2, ?3)",
                params![from_user, to_user, now],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok((
                FriendLinkRow {
                    id,
                    from_user,
                    to_user,
                    is_accepted: false,
                    created_at: now.to_string(),
                },
                true,
            ))
        })
    }

    pub fn get_friend_link(&self, id: i64) -> Result<Option<FriendLinkRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, from_user, to_user, is_accepted, created_at
                 FROM friend_links WHERE id = ?1",
                [id],
                map_friend_link,
            )
            .optional()
        })
    }

    pub fn accept_friend_link(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE friend_links SET is_accepted = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    pub fn delete_friend_link(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM friend_links WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    pub fn list_incoming_requests(&self, user_id: i64) -> Result<Vec<FriendLinkRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_user, to_user, is_accepted, created_at
                 FROM friend_links WHERE to_user = ?1 AND is_accepted = 0
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([user_id], map_friend_link)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_outgoing_requests(&self, user_id: i64) -> Result<Vec<FriendLinkRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_user, to_user, is_accepted, created_at
                 FROM friend_links WHERE from_user = ?1 AND is_accepted = 0
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([user_id], map_friend_link)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Accepted in either direction implies friendship.
    pub fn are_friends(&self, u1: i64, u2: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM friend_links
                 WHERE is_accepted = 1
                   AND ((from_user = ?1 AND to_user = ?2)
                     OR (from_user = ?2 AND to_user = ?1))",
                params![u1, u2],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn list_friends(&self, user_id: i64) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.full_name, u.is_online
                 FROM users u
                 JOIN friend_links fl
                   ON (fl.from_user = ?1 AND fl.to_user = u.id)
                   OR (fl.to_user = ?1 AND fl.from_user = u.id)
                 WHERE fl.is_accepted = 1
                 ORDER BY u.id",
            )?;
            let rows = stmt
                .query_map([user_id], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.room_id, m.author_id, u.username, u.full_name,
        m.content, m.is_file, m.is_deleted, m.created_at, m.edited_at
 FROM messages m
 LEFT JOIN users u ON m.author_id = u.id";

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        is_online: row.get(3)?,
    })
}

fn map_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<RoomRow> {
    Ok(RoomRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        admin_id: row.get(3)?,
        is_deleted: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row.get(3)?,
        author_full_name: row.get(4)?,
        content: row.get(5)?,
        is_file: row.get(6)?,
        is_deleted: row.get(7)?,
        created_at: row.get(8)?,
        edited_at: row.get(9)?,
    })
}

fn map_friend_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendLinkRow> {
    Ok(FriendLinkRow {
        id: row.get(0)?,
        from_user: row.get(1)?,
        to_user: row.get(2)?,
        is_accepted: row.get(3)?,
        created_at: row.get(4)?,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_users(ids: &[i64]) -> Database {
        let db = Database::open_in_memory().unwrap();
        for id in ids {
            db.upsert_user(*id, &format!("user{id}"), None).unwrap();
        }
        db
    }

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    #[test]
    fn private_room_is_unique_per_unordered_pair() {
        let db = db_with_users(&[1, 2]);

        let (room_ab, created_ab) = db.get_or_create_private_room(1, 2, "private_1_2", &now()).unwrap();
        let (room_ba, created_ba) = db.get_or_create_private_room(2, 1, "private_2_1", &now()).unwrap();

        assert!(created_ab);
        assert!(!created_ba);
        assert_eq!(room_ab, room_ba);
        assert_eq!(db.room_member_ids(&room_ab).unwrap(), vec![1, 2]);
        assert_eq!(db.private_pair_of_room(&room_ab).unwrap(), Some((1, 2)));
    }

    #[test]
    fn read_status_fanout_and_mark_read() {
        let db = db_with_users(&[1, 2, 3]);
        let room = db.create_group_room("trio", 1, &[2, 3], &now()).unwrap();

        let msg = db.insert_message(&room, 1, "hello", false, &now()).unwrap();
        for user in db.room_member_ids(&room).unwrap() {
            db.insert_read_status(user, msg).unwrap();
        }

        let statuses = db.read_statuses_for_message(msg).unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|(_, is_read)| !is_read));
        assert_eq!(db.unread_count(2, &room).unwrap(), 1);

        let flipped = db.mark_room_read(2, &room, &now()).unwrap();
        assert_eq!(flipped, 1);
        assert_eq!(db.unread_count(2, &room).unwrap(), 0);
        // Retroactive only: a second call has nothing left to flip.
        assert_eq!(db.mark_room_read(2, &room, &now()).unwrap(), 0);
        // Other members untouched.
        assert_eq!(db.unread_count(3, &room).unwrap(), 1);
    }

    #[test]
    fn room_deletion_cascades_messages_and_read_statuses() {
        let db = db_with_users(&[1, 2]);
        let room = db.create_group_room("doomed", 1, &[2], &now()).unwrap();
        let msg = db.insert_message(&room, 1, "bye", false, &now()).unwrap();
        db.insert_read_status(2, msg).unwrap();

        db.delete_room(&room).unwrap();

        assert!(db.get_room(&room).unwrap().is_none());
        assert!(db.get_message(msg).unwrap().is_none());
        assert!(db.read_statuses_for_message(msg).unwrap().is_empty());
        assert!(db.room_messages(&room, 0, 20).unwrap().is_empty());
        assert_eq!(db.total_unread(2).unwrap(), 0);
    }

    #[test]
    fn friendship_is_bidirectional_once_accepted() {
        let db = db_with_users(&[1, 2]);

        let (link, created) = db.create_friend_request(1, 2, &now()).unwrap();
        assert!(created);
        assert!(!db.are_friends(1, 2).unwrap());

        // Duplicate send is a no-op on the link.
        let (dup, created_again) = db.create_friend_request(1, 2, &now()).unwrap();
        assert!(!created_again);
        assert_eq!(dup.id, link.id);

        db.accept_friend_link(link.id).unwrap();
        assert!(db.are_friends(1, 2).unwrap());
        assert!(db.are_friends(2, 1).unwrap());

        let friends_of_2: Vec<i64> = db.list_friends(2).unwrap().iter().map(|u| u.id).collect();
        assert_eq!(friends_of_2, vec![1]);
    }

    #[test]
    fn admin_reassignment_choice_is_lowest_member_id() {
        let db = db_with_users(&[5, 3, 9]);
        let room = db.create_group_room("grp", 5, &[3, 9], &now()).unwrap();

        db.remove_member(&room, 3).unwrap();
        assert_eq!(db.lowest_member_id(&room).unwrap(), Some(5));

        db.remove_member(&room, 5).unwrap();
        assert_eq!(db.lowest_member_id(&room).unwrap(), Some(9));

        db.remove_member(&room, 9).unwrap();
        assert_eq!(db.lowest_member_id(&room).unwrap(), None);
    }
}
