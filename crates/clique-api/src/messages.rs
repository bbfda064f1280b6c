use axum::extract::{Extension, Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use clique_bus::Group;
use clique_db::models::MessageRow;
use clique_db::parse_timestamp;
use clique_types::api::{Claims, EditMessageRequest, HistoryQuery, HistoryResponse};
use clique_types::events::{NotifyEvent, RoomEvent};
use clique_types::models::{MessageId, MessageView, UserId, UserSummary, is_image_name};

use crate::error::{ChatError, ChatResult};
use crate::rooms::load_room;
use crate::{AppState, identity};

/// Edits are only permitted within this window of the message's creation.
const EDIT_WINDOW_MINUTES: i64 = 15;

/// Persist-then-broadcast, in order: member check, message row, per-member
/// read statuses, room broadcast, per-member notification. A store failure
/// before the insert aborts everything; a read-status failure for one member
/// is logged and never rolls back the already-durable message.
pub async fn submit(
    state: &AppState,
    room_id: Uuid,
    author: &Claims,
    content: &str,
    is_file: bool,
) -> ChatResult<MessageView> {
    let room = load_room(state, room_id)?;
    if !state.db.is_member(&room_key(room_id), author.sub)? {
        return Err(ChatError::AuthorizationDenied("not a member of this room"));
    }

    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::ValidationFailed("message cannot be empty"));
    }

    let now = Utc::now();
    let message_id =
        state
            .db
            .insert_message(&room_key(room_id), author.sub, content, is_file, &now.to_rfc3339())?;

    let members = state.db.room_member_ids(&room_key(room_id))?;
    for &member in &members {
        // Author included: the sender's own row stays unread until their
        // client acknowledges with message_read.
        if let Err(e) = state.db.insert_read_status(member, message_id) {
            warn!(
                "read-status fanout failed for user {} on message {}: {:#}",
                member, message_id, e
            );
        }
    }

    let sender = identity::summary_of(author);
    let is_image = is_file && is_image_name(content);

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::ChatMessage {
                id: Some(message_id),
                message: content.to_string(),
                sender: sender.clone(),
                timestamp: now,
                is_file,
                is_image,
            },
        )
        .await;

    // Author included here too, so their open-elsewhere UIs refresh counts.
    for &member in &members {
        state
            .notify_bus
            .publish(
                &Group::User(member),
                NotifyEvent::NewMessage {
                    from: sender.username.clone(),
                    from_user_id: sender.id,
                    room_id,
                    room_name: room.name.clone(),
                    content: content.to_string(),
                },
            )
            .await;
    }

    Ok(MessageView {
        id: message_id,
        room_id,
        sender,
        content: content.to_string(),
        timestamp: now,
        edited_at: None,
        is_file,
        is_image,
        is_deleted: false,
        is_me: true,
    })
}

pub async fn edit(
    state: &AppState,
    message_id: MessageId,
    editor: &Claims,
    new_content: &str,
) -> ChatResult<MessageView> {
    let row = state
        .db
        .get_message(message_id)?
        .ok_or(ChatError::NotFound("message"))?;

    if row.author_id != Some(editor.sub) {
        return Err(ChatError::AuthorizationDenied("only the author can edit a message"));
    }
    if row.is_deleted {
        return Err(ChatError::ValidationFailed("cannot edit a deleted message"));
    }
    if row.is_file {
        return Err(ChatError::ValidationFailed("cannot edit a file message"));
    }

    let created = parse_timestamp(&row.created_at);
    if Utc::now() - created > Duration::minutes(EDIT_WINDOW_MINUTES) {
        return Err(ChatError::ValidationFailed("edit window expired"));
    }

    let content = new_content.trim();
    if content.is_empty() {
        return Err(ChatError::ValidationFailed("content cannot be empty"));
    }

    let room_id = parse_room_id(&row.room_id)?;
    let room = load_room(state, room_id)?;

    let edited_at = Utc::now();
    state
        .db
        .set_message_content(message_id, content, &edited_at.to_rfc3339())?;

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::MessageEdited {
                message_id,
                content: content.to_string(),
                sender_id: editor.sub,
            },
        )
        .await;

    // Sidebar summary only; the raw content already went to the room.
    notify_message_update(state, room_id, room.is_group(), editor, "Edited a message.", false)
        .await?;

    let mut view = view_of(&row, editor.sub);
    view.content = content.to_string();
    view.edited_at = Some(edited_at);
    Ok(view)
}

pub async fn delete(state: &AppState, message_id: MessageId, requester: &Claims) -> ChatResult<()> {
    let row = state
        .db
        .get_message(message_id)?
        .ok_or(ChatError::NotFound("message"))?;

    if row.author_id != Some(requester.sub) {
        return Err(ChatError::AuthorizationDenied("only the author can delete a message"));
    }

    let room_id = parse_room_id(&row.room_id)?;
    let room = load_room(state, room_id)?;

    state.db.soft_delete_message(message_id)?;

    state
        .rooms_bus
        .publish(&Group::Room(room_id), RoomEvent::MessageDeleted { message_id })
        .await;

    notify_message_update(state, room_id, room.is_group(), requester, "Deleted a message.", true)
        .await?;

    Ok(())
}

/// Retroactive read acknowledgement for everything currently unread in the
/// room; the unread_cleared event goes to the reader's own notification
/// group only, never to the room.
pub async fn mark_read(state: &AppState, user: UserId, room_id: Uuid) -> ChatResult<usize> {
    load_room(state, room_id)?;
    if !state.db.is_member(&room_key(room_id), user)? {
        return Err(ChatError::AuthorizationDenied("not a member of this room"));
    }

    let flipped = state
        .db
        .mark_room_read(user, &room_key(room_id), &Utc::now().to_rfc3339())?;
    let total_unread = state.db.total_unread(user)?;

    state
        .notify_bus
        .publish(
            &Group::User(user),
            NotifyEvent::UnreadCleared { room_id, total_unread },
        )
        .await;

    Ok(flipped)
}

pub fn history(
    state: &AppState,
    room_id: Uuid,
    me: UserId,
    offset: u32,
    limit: u32,
) -> ChatResult<Vec<MessageView>> {
    load_room(state, room_id)?;
    if !state.db.is_member(&room_key(room_id), me)? {
        return Err(ChatError::AuthorizationDenied("not a member of this room"));
    }

    let rows = state
        .db
        .room_messages(&room_key(room_id), offset, limit.min(100))?;
    Ok(rows.iter().map(|row| view_of(row, me)).collect())
}

fn view_of(row: &MessageRow, me: UserId) -> MessageView {
    let sender = UserSummary {
        id: row.author_id.unwrap_or_default(),
        username: row
            .author_username
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        full_name: row.author_full_name.clone(),
    };

    MessageView {
        id: row.id,
        room_id: row.room_id.parse().unwrap_or_default(),
        is_me: row.author_id == Some(me),
        // Soft-deleted content is retained in the store but hidden from renders.
        content: if row.is_deleted { String::new() } else { row.content.clone() },
        is_image: !row.is_deleted && row.is_file && is_image_name(&row.content),
        timestamp: parse_timestamp(&row.created_at),
        edited_at: row.edited_at.as_deref().map(parse_timestamp),
        is_file: row.is_file,
        is_deleted: row.is_deleted,
        sender,
    }
}

async fn notify_message_update(
    state: &AppState,
    room_id: Uuid,
    is_group: bool,
    actor: &Claims,
    summary: &str,
    is_delete: bool,
) -> ChatResult<()> {
    for member in state.db.room_member_ids(&room_key(room_id))? {
        state
            .notify_bus
            .publish(
                &Group::User(member),
                NotifyEvent::MessageUpdated {
                    room_id,
                    content: summary.to_string(),
                    from: actor.username.clone(),
                    from_user_id: actor.sub,
                    is_group,
                    is_delete,
                },
            )
            .await;
    }
    Ok(())
}

fn room_key(room_id: Uuid) -> String {
    room_id.to_string()
}

fn parse_room_id(raw: &str) -> ChatResult<Uuid> {
    raw.parse()
        .map_err(|e| ChatError::Persistence(anyhow::anyhow!("corrupt room id '{}': {}", raw, e)))
}

// -- HTTP handlers --

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> ChatResult<impl IntoResponse> {
    let view = edit(&state, message_id, &claims, &req.content).await?;
    Ok(Json(json!({ "success": true, "content": view.content })))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    delete(&state, message_id, &claims).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    let messages = history(&state, room_id, claims.sub, query.offset, query.limit)?;
    Ok(Json(HistoryResponse { messages }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms;
    use crate::testutil::{befriend, claims, seed_users, state};

    async fn group_of_three() -> (crate::AppState, Uuid) {
        let state = state();
        seed_users(&state, &[1, 2, 3]);
        befriend(&state, 1, 2);
        befriend(&state, 1, 3);
        let room_id = rooms::create_group(&state, &claims(1, "alice"), "trio", &[2, 3])
            .await
            .unwrap();
        (state, room_id)
    }

    #[tokio::test]
    async fn submit_fans_out_read_rows_and_broadcasts_in_order() {
        let (state, room_id) = group_of_three().await;

        let mut room_rx = state.rooms_bus.join(Group::Room(room_id)).await;
        let mut notify_rx = state.notify_bus.join(Group::User(2)).await;

        let view = submit(&state, room_id, &claims(1, "alice"), "hello", false)
            .await
            .unwrap();

        // One ReadStatus row per member at creation time, author included,
        // all unread.
        let statuses = state.db.read_statuses_for_message(view.id).unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|(_, is_read)| !is_read));
        assert_eq!(state.db.unread_count(1, &room_id.to_string()).unwrap(), 1);

        match room_rx.recv().await.unwrap() {
            RoomEvent::ChatMessage { id, message, sender, is_file, .. } => {
                assert_eq!(id, Some(view.id));
                assert_eq!(message, "hello");
                assert_eq!(sender.id, 1);
                assert!(!is_file);
            }
            other => panic!("expected chat_message, got {:?}", other),
        }

        match notify_rx.recv().await.unwrap() {
            NotifyEvent::NewMessage { from, room_name, content, .. } => {
                assert_eq!(from, "alice");
                assert_eq!(room_name, "trio");
                assert_eq!(content, "hello");
            }
            other => panic!("expected new_message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_rejects_outsiders_and_empty_content_before_persisting() {
        let (state, room_id) = group_of_three().await;
        state.db.upsert_user(9, "mallory", None).unwrap();

        let err = submit(&state, room_id, &claims(9, "mallory"), "hi", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        let err = submit(&state, room_id, &claims(1, "alice"), "   ", false)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));

        assert!(state.db.room_messages(&room_id.to_string(), 0, 20).unwrap().is_empty());
    }

    #[tokio::test]
    async fn edit_enforces_author_window_and_content_kind() {
        let (state, room_id) = group_of_three().await;
        let alice = claims(1, "alice");

        let msg = submit(&state, room_id, &alice, "first", false).await.unwrap();

        // Not the author.
        let err = edit(&state, msg.id, &claims(2, "bob"), "hijack").await.unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        // Empty after trim.
        let err = edit(&state, msg.id, &alice, "   ").await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));

        // File messages can't be edited.
        let file_msg = submit(&state, room_id, &alice, "/media/doc.pdf", true).await.unwrap();
        let err = edit(&state, file_msg.id, &alice, "new").await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));

        // Within the window it succeeds and stamps edited_at.
        let view = edit(&state, msg.id, &alice, "first, fixed").await.unwrap();
        assert_eq!(view.content, "first, fixed");
        assert!(view.edited_at.is_some());

        // Backdate past the window; further edits are rejected without mutation.
        let stale = (Utc::now() - Duration::minutes(EDIT_WINDOW_MINUTES + 1)).to_rfc3339();
        state
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE messages SET created_at = ?1 WHERE id = ?2",
                    (stale.as_str(), msg.id),
                )?;
                Ok(())
            })
            .unwrap();
        let err = edit(&state, msg.id, &alice, "too late").await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));
        let row = state.db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(row.content, "first, fixed");

        // Deleted messages can't be edited either.
        delete(&state, msg.id, &alice).await.unwrap();
        let err = edit(&state, msg.id, &alice, "necromancy").await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn delete_is_author_only_and_soft() {
        let (state, room_id) = group_of_three().await;
        let alice = claims(1, "alice");
        let msg = submit(&state, room_id, &alice, "oops", false).await.unwrap();

        let err = delete(&state, msg.id, &claims(2, "bob")).await.unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        delete(&state, msg.id, &alice).await.unwrap();

        // Row survives with the flag set; renders hide the content.
        let row = state.db.get_message(msg.id).unwrap().unwrap();
        assert!(row.is_deleted);
        assert_eq!(row.content, "oops");

        let views = history(&state, room_id, 2, 0, 20).unwrap();
        let deleted = views.iter().find(|v| v.id == msg.id).unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.content, "");
    }

    #[tokio::test]
    async fn mark_read_is_retroactive_only_and_notifies_the_reader() {
        let (state, room_id) = group_of_three().await;
        let alice = claims(1, "alice");
        let key = room_id.to_string();

        submit(&state, room_id, &alice, "one", false).await.unwrap();
        submit(&state, room_id, &alice, "two", false).await.unwrap();
        assert_eq!(state.db.unread_count(2, &key).unwrap(), 2);

        let mut notify_rx = state.notify_bus.join(Group::User(2)).await;
        let flipped = mark_read(&state, 2, room_id).await.unwrap();
        assert_eq!(flipped, 2);
        assert_eq!(state.db.unread_count(2, &key).unwrap(), 0);

        match notify_rx.recv().await.unwrap() {
            NotifyEvent::UnreadCleared { room_id: cleared, total_unread } => {
                assert_eq!(cleared, room_id);
                assert_eq!(total_unread, 0);
            }
            other => panic!("expected unread_cleared, got {:?}", other),
        }

        // A later message is unaffected by the earlier acknowledgement.
        submit(&state, room_id, &alice, "three", false).await.unwrap();
        assert_eq!(state.db.unread_count(2, &key).unwrap(), 1);
    }
}
