use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use clique_bus::Group;
use clique_db::parse_timestamp;
use clique_types::api::{Claims, CreateGroupRequest, RoomCreatedResponse, RoomOverview};
use clique_types::events::{Activity, GroupChange, NotifyEvent, RoomEvent};
use clique_types::models::{Room, RoomKind, UserId, UserSummary};

use crate::AppState;
use crate::error::{ChatError, ChatResult};

/// Resolve a live room into its typed form. The kind was fixed at creation;
/// a row that doesn't resolve cleanly is a store inconsistency, not a
/// client error.
pub fn load_room(state: &AppState, room_id: Uuid) -> ChatResult<Room> {
    let key = room_id.to_string();
    let row = state.db.get_room(&key)?.ok_or(ChatError::NotFound("room"))?;

    let kind = match row.kind.as_str() {
        "group" => RoomKind::Group {
            admin_id: row
                .admin_id
                .ok_or_else(|| anyhow::anyhow!("group room {} has no admin", row.id))?,
        },
        "private" => {
            let (user_a, user_b) = state
                .db
                .private_pair_of_room(&row.id)?
                .ok_or_else(|| anyhow::anyhow!("private room {} has no pair record", row.id))?;
            RoomKind::Private { user_a, user_b }
        }
        other => return Err(anyhow::anyhow!("unknown room kind '{}'", other).into()),
    };

    Ok(Room {
        id: room_id,
        name: row.name,
        kind,
        is_deleted: row.is_deleted,
        created_at: parse_timestamp(&row.created_at),
    })
}

fn load_group(state: &AppState, room_id: Uuid) -> ChatResult<(Room, UserId)> {
    let room = load_room(state, room_id)?;
    match room.admin_id() {
        Some(admin_id) => Ok((room, admin_id)),
        None => Err(ChatError::ValidationFailed("not a group chat")),
    }
}

/// Broadcast-only notice from the reserved System sender; never persisted.
async fn system_notice(state: &AppState, room_id: Uuid, text: String) {
    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::ChatMessage {
                id: None,
                message: text,
                sender: UserSummary::system(),
                timestamp: Utc::now(),
                is_file: false,
                is_image: false,
            },
        )
        .await;
}

fn require_user(state: &AppState, user_id: UserId) -> ChatResult<UserSummary> {
    let row = state
        .db
        .get_user(user_id)?
        .ok_or(ChatError::NotFound("user"))?;
    Ok(UserSummary {
        id: row.id,
        username: row.username,
        full_name: row.full_name,
    })
}

// -- Private rooms --

/// Idempotent per unordered pair: both call orders resolve to the same room,
/// and only the first call creates it. Requires friendship with the peer.
pub async fn get_or_create_private(
    state: &AppState,
    actor: &Claims,
    friend_id: UserId,
) -> ChatResult<(Uuid, bool)> {
    if friend_id == actor.sub {
        return Err(ChatError::ValidationFailed("cannot chat privately with yourself"));
    }
    let friend = require_user(state, friend_id)?;
    if !state.db.are_friends(actor.sub, friend_id)? {
        return Err(ChatError::AuthorizationDenied(
            "you can only chat privately with friends",
        ));
    }

    let name = format!("private_chat_{}_{}", actor.username, friend.username);
    let (room_key, created) = state.db.get_or_create_private_room(
        actor.sub,
        friend_id,
        &name,
        &Utc::now().to_rfc3339(),
    )?;
    let room_id = room_key
        .parse()
        .map_err(|e| anyhow::anyhow!("corrupt room id '{}': {}", room_key, e))?;

    if created {
        state.roster.link_room(&[actor.sub, friend_id]).await;
        info!("private room {} created for ({}, {})", room_id, actor.sub, friend_id);
    }

    Ok((room_id, created))
}

// -- Groups --

pub async fn create_group(
    state: &AppState,
    actor: &Claims,
    name: &str,
    member_ids: &[UserId],
) -> ChatResult<Uuid> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::ValidationFailed("group name is required"));
    }
    if member_ids.is_empty() {
        return Err(ChatError::ValidationFailed("select at least one friend"));
    }
    for &member in member_ids {
        require_user(state, member)?;
        if !state.db.are_friends(actor.sub, member)? {
            return Err(ChatError::ValidationFailed("can only add friends"));
        }
    }

    let room_key = state
        .db
        .create_group_room(name, actor.sub, member_ids, &Utc::now().to_rfc3339())?;
    let room_id: Uuid = room_key
        .parse()
        .map_err(|e| anyhow::anyhow!("corrupt room id '{}': {}", room_key, e))?;

    let members = state.db.room_member_ids(&room_key)?;
    state.roster.link_room(&members).await;

    for &member in &members {
        state
            .notify_bus
            .publish(
                &Group::User(member),
                NotifyEvent::GroupCreated {
                    room_id,
                    room_name: name.to_string(),
                },
            )
            .await;
    }

    info!("group '{}' ({}) created by {}", name, room_id, actor.sub);
    Ok(room_id)
}

/// Any member may add, but only their own mutual friends — adding bypasses
/// the admin gate without letting strangers in. "Already a member" is a
/// rejection, not a no-op success.
pub async fn add_member(
    state: &AppState,
    actor: &Claims,
    room_id: Uuid,
    target_id: UserId,
) -> ChatResult<()> {
    let (room, _admin) = load_group(state, room_id)?;
    let key = room_id.to_string();

    if !state.db.is_member(&key, actor.sub)? {
        return Err(ChatError::AuthorizationDenied("you are not a member"));
    }
    let target = require_user(state, target_id)?;
    if !state.db.are_friends(actor.sub, target_id)? {
        return Err(ChatError::ValidationFailed("can only add friends"));
    }
    if state.db.is_member(&key, target_id)? {
        return Err(ChatError::ValidationFailed("user already in group"));
    }

    let existing = state.db.room_member_ids(&key)?;
    state.db.add_member(&key, target_id, &Utc::now().to_rfc3339())?;
    state.roster.link(target_id, &existing).await;

    system_notice(
        state,
        room_id,
        format!("{} was added by {}", target.username, actor.username),
    )
    .await;

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::GroupUpdate {
                change: GroupChange::MemberAdded {
                    user_id: target_id,
                    added_by: actor.sub,
                },
            },
        )
        .await;

    state
        .notify_bus
        .publish(
            &Group::User(target_id),
            NotifyEvent::AddedToGroup {
                room_id,
                room_name: room.name.clone(),
                added_by: actor.username.clone(),
            },
        )
        .await;

    Ok(())
}

pub async fn kick(
    state: &AppState,
    actor: &Claims,
    room_id: Uuid,
    target_id: UserId,
) -> ChatResult<()> {
    let (room, admin_id) = load_group(state, room_id)?;
    if admin_id != actor.sub {
        return Err(ChatError::AuthorizationDenied("only admin can kick members"));
    }
    if target_id == actor.sub {
        return Err(ChatError::ValidationFailed("cannot kick yourself"));
    }

    let target = require_user(state, target_id)?;
    let key = room_id.to_string();
    if !state.db.remove_member(&key, target_id)? {
        return Err(ChatError::ValidationFailed("user not in group"));
    }

    let remaining = state.db.room_member_ids(&key)?;
    state.roster.unlink(target_id, &remaining).await;

    system_notice(state, room_id, format!("{} was removed by admin", target.username)).await;

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::GroupUpdate {
                change: GroupChange::MemberKicked { user_id: target_id },
            },
        )
        .await;

    state
        .notify_bus
        .publish(
            &Group::User(target_id),
            NotifyEvent::KickedFromGroup {
                room_id,
                room_name: room.name.clone(),
            },
        )
        .await;

    // Authorization happens at connect time only, so the kick itself must
    // tear down any socket the target still holds in this room.
    let closed = state.registry.terminate(room_id, target_id).await;
    if closed > 0 {
        info!("kick closed {} open socket(s) for user {} in room {}", closed, target_id, room_id);
    }

    Ok(())
}

pub enum LeaveOutcome {
    Left { new_admin_id: Option<UserId> },
    RoomDeleted,
}

pub async fn leave(state: &AppState, actor: &Claims, room_id: Uuid) -> ChatResult<LeaveOutcome> {
    let (_room, admin_id) = load_group(state, room_id)?;
    let key = room_id.to_string();

    if !state.db.remove_member(&key, actor.sub)? {
        return Err(ChatError::ValidationFailed("user not in group"));
    }

    let remaining = state.db.room_member_ids(&key)?;
    state.roster.unlink(actor.sub, &remaining).await;

    if remaining.is_empty() {
        state.db.delete_room(&key)?;
        info!("room {} deleted after last member left", room_id);
        return Ok(LeaveOutcome::RoomDeleted);
    }

    let mut new_admin_id = None;
    if admin_id == actor.sub {
        // Deterministic handoff: lowest remaining member id.
        let next = state
            .db
            .lowest_member_id(&key)?
            .ok_or_else(|| anyhow::anyhow!("room {} emptied under us", room_id))?;
        state.db.set_admin(&key, next)?;
        new_admin_id = Some(next);
    }

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::ChatActivity {
                user_id: actor.sub,
                username: actor.username.clone(),
                activity: Activity::UserLeave,
            },
        )
        .await;

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::GroupUpdate {
                change: GroupChange::MemberLeft {
                    user_id: actor.sub,
                    new_admin_id,
                },
            },
        )
        .await;

    Ok(LeaveOutcome::Left { new_admin_id })
}

pub async fn transfer_admin(
    state: &AppState,
    actor: &Claims,
    room_id: Uuid,
    target_id: UserId,
) -> ChatResult<()> {
    let (room, admin_id) = load_group(state, room_id)?;
    if admin_id != actor.sub {
        return Err(ChatError::AuthorizationDenied("only admin can transfer rights"));
    }

    let target = require_user(state, target_id)?;
    let key = room_id.to_string();
    if !state.db.is_member(&key, target_id)? {
        return Err(ChatError::ValidationFailed("user not in group"));
    }

    state.db.set_admin(&key, target_id)?;

    system_notice(
        state,
        room_id,
        format!("Admin rights transferred to {}", target.username),
    )
    .await;

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::GroupUpdate {
                change: GroupChange::AdminTransferred {
                    new_admin_id: target_id,
                    old_admin_id: actor.sub,
                },
            },
        )
        .await;

    state
        .notify_bus
        .publish(
            &Group::User(target_id),
            NotifyEvent::AdminTransferred {
                room_id,
                room_name: room.name.clone(),
            },
        )
        .await;

    Ok(())
}

pub async fn delete_group(state: &AppState, actor: &Claims, room_id: Uuid) -> ChatResult<()> {
    let (room, admin_id) = load_group(state, room_id)?;
    if admin_id != actor.sub {
        return Err(ChatError::AuthorizationDenied("only admin can delete group"));
    }

    let key = room_id.to_string();
    let members = state.db.room_member_ids(&key)?;

    // Personal notices go out before the room disappears.
    for &member in &members {
        state
            .notify_bus
            .publish(
                &Group::User(member),
                NotifyEvent::GroupDeleted {
                    room_id,
                    room_name: room.name.clone(),
                },
            )
            .await;
    }

    state.db.delete_room(&key)?;
    state.roster.unlink_room(&members).await;

    for &member in &members {
        state.registry.terminate(room_id, member).await;
    }

    info!("group '{}' ({}) deleted by admin {}", room.name, room_id, actor.sub);
    Ok(())
}

// -- Sidebar --

pub async fn overview(state: &AppState, user: &Claims) -> ChatResult<Vec<RoomOverview>> {
    let rows = state.db.rooms_of_user(user.sub)?;
    let mut out = Vec::with_capacity(rows.len());

    for row in rows {
        let room_id: Uuid = match row.id.parse() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("skipping room with corrupt id '{}': {}", row.id, e);
                continue;
            }
        };
        let room = load_room(state, room_id)?;

        let (display_name, other_user_id, is_online) = match room.kind {
            RoomKind::Group { .. } => (room.name.clone(), None, false),
            RoomKind::Private { .. } => {
                let peer_id = room.peer_of(user.sub).unwrap_or_default();
                match state.db.get_user(peer_id)? {
                    Some(peer) => {
                        let name = peer
                            .full_name
                            .clone()
                            .filter(|n| !n.is_empty())
                            .unwrap_or_else(|| peer.username.clone());
                        (name, Some(peer_id), peer.is_online)
                    }
                    None => ("unknown".to_string(), Some(peer_id), false),
                }
            }
        };

        let last = state.db.last_message(&row.id)?;
        let last_activity = last
            .as_ref()
            .map(|m| parse_timestamp(&m.created_at))
            .unwrap_or(room.created_at);
        let last_message = last.map(|m| {
            if m.is_deleted {
                "Deleted a message.".to_string()
            } else {
                m.content
            }
        });

        out.push(RoomOverview {
            room_id,
            display_name,
            is_group: room.is_group(),
            other_user_id,
            is_online,
            unread_count: state.db.unread_count(user.sub, &row.id)?,
            last_message,
            last_activity,
        });
    }

    out.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    Ok(out)
}

// -- HTTP handlers --

pub async fn start_private_chat(
    State(state): State<AppState>,
    Path(friend_id): Path<UserId>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    let (room_id, created) = get_or_create_private(&state, &claims, friend_id).await?;
    let room = load_room(&state, room_id)?;
    Ok(Json(RoomCreatedResponse {
        room_id,
        name: room.name,
        created,
    }))
}

pub async fn create_group_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> ChatResult<impl IntoResponse> {
    let room_id = create_group(&state, &claims, &req.name, &req.member_ids).await?;
    Ok(Json(RoomCreatedResponse {
        room_id,
        name: req.name,
        created: true,
    }))
}

pub async fn add_member_handler(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, UserId)>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    add_member(&state, &claims, room_id, user_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn kick_member_handler(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, UserId)>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    kick(&state, &claims, room_id, user_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn leave_group_handler(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    let outcome = leave(&state, &claims, room_id).await?;
    let body = match outcome {
        LeaveOutcome::Left { new_admin_id } => json!({ "status": "ok", "new_admin_id": new_admin_id }),
        LeaveOutcome::RoomDeleted => json!({ "status": "ok", "action": "deleted" }),
    };
    Ok(Json(body))
}

pub async fn transfer_admin_handler(
    State(state): State<AppState>,
    Path((room_id, user_id)): Path<(Uuid, UserId)>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    transfer_admin(&state, &claims, room_id, user_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn delete_group_handler(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    delete_group(&state, &claims, room_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn list_rooms_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    let rooms = overview(&state, &claims).await?;
    Ok(Json(rooms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::messages;
    use crate::testutil::{befriend, claims, seed_users, state};

    #[tokio::test]
    async fn private_rooms_are_pair_order_independent_and_friend_gated() {
        let state = state();
        seed_users(&state, &[1, 2]);
        let alice = claims(1, "alice");
        let bob = claims(2, "bob");

        let err = get_or_create_private(&state, &alice, 2).await.unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        befriend(&state, 1, 2);
        let (room_ab, created_ab) = get_or_create_private(&state, &alice, 2).await.unwrap();
        let (room_ba, created_ba) = get_or_create_private(&state, &bob, 1).await.unwrap();
        assert!(created_ab);
        assert!(!created_ba);
        assert_eq!(room_ab, room_ba);

        let room = load_room(&state, room_ab).unwrap();
        assert_eq!(room.kind, RoomKind::Private { user_a: 1, user_b: 2 });
    }

    #[tokio::test]
    async fn add_member_requires_membership_friendship_and_novelty() {
        let state = state();
        seed_users(&state, &[1, 2, 3, 4]);
        befriend(&state, 1, 2);
        let alice = claims(1, "alice");
        let room_id = create_group(&state, &alice, "club", &[2]).await.unwrap();

        // Outsider can't add.
        let err = add_member(&state, &claims(4, "eve"), room_id, 3).await.unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        // Member can only add their own friends.
        let err = add_member(&state, &alice, room_id, 3).await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));

        befriend(&state, 1, 3);
        add_member(&state, &alice, room_id, 3).await.unwrap();
        assert!(state.db.is_member(&room_id.to_string(), 3).unwrap());

        // Already a member: rejected, not a no-op success.
        let err = add_member(&state, &alice, room_id, 3).await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn kick_is_admin_only_never_self_and_closes_open_sockets() {
        let state = state();
        seed_users(&state, &[1, 2, 3]);
        befriend(&state, 1, 2);
        befriend(&state, 1, 3);
        let alice = claims(1, "alice");
        let room_id = create_group(&state, &alice, "club", &[2, 3]).await.unwrap();

        let err = kick(&state, &claims(2, "bob"), room_id, 3).await.unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        let err = kick(&state, &alice, room_id, 1).await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));

        // The target holds an open room socket; the kick must tear it down.
        let (_conn, mut kill_rx) = state.registry.register_room_socket(room_id, 3).await;
        let mut notify_rx = state.notify_bus.join(Group::User(3)).await;

        kick(&state, &alice, room_id, 3).await.unwrap();
        assert!(!state.db.is_member(&room_id.to_string(), 3).unwrap());
        assert!(kill_rx.recv().await.is_some());
        assert!(matches!(
            notify_rx.recv().await.unwrap(),
            NotifyEvent::KickedFromGroup { .. }
        ));

        // Kicking someone who already left is a validation error.
        let err = kick(&state, &alice, room_id, 3).await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn leave_hands_admin_to_lowest_member_then_deletes_when_empty() {
        let state = state();
        seed_users(&state, &[5, 3, 9]);
        befriend(&state, 5, 3);
        befriend(&state, 5, 9);
        let admin = claims(5, "admin");
        let room_id = create_group(&state, &admin, "club", &[3, 9]).await.unwrap();
        let key = room_id.to_string();

        messages::submit(&state, room_id, &admin, "before the exodus", false)
            .await
            .unwrap();

        match leave(&state, &admin, room_id).await.unwrap() {
            LeaveOutcome::Left { new_admin_id } => assert_eq!(new_admin_id, Some(3)),
            LeaveOutcome::RoomDeleted => panic!("room should survive with members left"),
        }
        assert_eq!(load_room(&state, room_id).unwrap().admin_id(), Some(3));

        match leave(&state, &claims(3, "bea"), room_id).await.unwrap() {
            LeaveOutcome::Left { new_admin_id } => assert_eq!(new_admin_id, Some(9)),
            LeaveOutcome::RoomDeleted => panic!("room should survive with members left"),
        }

        // Last member out: the room is deleted and its history cascades away.
        assert!(matches!(
            leave(&state, &claims(9, "cal"), room_id).await.unwrap(),
            LeaveOutcome::RoomDeleted
        ));
        assert!(matches!(
            load_room(&state, room_id).unwrap_err(),
            ChatError::NotFound(_)
        ));
        assert!(state.db.room_messages(&key, 0, 20).unwrap().is_empty());
    }

    #[tokio::test]
    async fn transfer_admin_requires_current_admin_and_membership() {
        let state = state();
        seed_users(&state, &[1, 2, 3]);
        befriend(&state, 1, 2);
        let alice = claims(1, "alice");
        let room_id = create_group(&state, &alice, "club", &[2]).await.unwrap();

        let err = transfer_admin(&state, &claims(2, "bob"), room_id, 1).await.unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        let err = transfer_admin(&state, &alice, room_id, 3).await.unwrap_err();
        assert!(matches!(err, ChatError::ValidationFailed(_)));

        transfer_admin(&state, &alice, room_id, 2).await.unwrap();
        assert_eq!(load_room(&state, room_id).unwrap().admin_id(), Some(2));
    }

    #[tokio::test]
    async fn delete_group_notifies_every_member_before_the_room_vanishes() {
        let state = state();
        seed_users(&state, &[1, 2]);
        befriend(&state, 1, 2);
        let alice = claims(1, "alice");
        let room_id = create_group(&state, &alice, "club", &[2]).await.unwrap();

        let err = delete_group(&state, &claims(2, "bob"), room_id).await.unwrap_err();
        assert!(matches!(err, ChatError::AuthorizationDenied(_)));

        let mut notify_rx = state.notify_bus.join(Group::User(2)).await;
        delete_group(&state, &alice, room_id).await.unwrap();

        match notify_rx.recv().await.unwrap() {
            NotifyEvent::GroupDeleted { room_id: deleted, .. } => assert_eq!(deleted, room_id),
            other => panic!("expected group_deleted, got {:?}", other),
        }
        assert!(matches!(
            load_room(&state, room_id).unwrap_err(),
            ChatError::NotFound(_)
        ));
    }
}
