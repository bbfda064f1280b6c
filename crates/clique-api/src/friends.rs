use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::response::IntoResponse;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use clique_bus::Group;
use clique_types::api::Claims;
use clique_types::events::NotifyEvent;
use clique_types::models::{UserId, UserSummary};

use crate::AppState;
use crate::error::{ChatError, ChatResult};

/// Directed request; a duplicate send returns the existing link without a
/// second notification.
pub async fn send_request(state: &AppState, actor: &Claims, to_user: UserId) -> ChatResult<bool> {
    if to_user == actor.sub {
        return Err(ChatError::ValidationFailed(
            "cannot send a friend request to yourself",
        ));
    }
    state
        .db
        .get_user(to_user)?
        .ok_or(ChatError::NotFound("user"))?;

    let (_link, created) =
        state
            .db
            .create_friend_request(actor.sub, to_user, &Utc::now().to_rfc3339())?;

    if created {
        state
            .notify_bus
            .publish(
                &Group::User(to_user),
                NotifyEvent::FriendRequestReceived {
                    from_user_id: actor.sub,
                    from_username: actor.username.clone(),
                },
            )
            .await;
        info!("friend request {} -> {}", actor.sub, to_user);
    }

    Ok(created)
}

/// Only the recipient may accept; acceptance makes the pair friends in both
/// directions.
pub async fn accept(state: &AppState, actor: &Claims, request_id: i64) -> ChatResult<()> {
    let link = state
        .db
        .get_friend_link(request_id)?
        .ok_or(ChatError::NotFound("friend request"))?;

    if link.to_user != actor.sub {
        return Err(ChatError::AuthorizationDenied("not your friend request"));
    }
    if link.is_accepted {
        return Err(ChatError::ValidationFailed("request already accepted"));
    }

    state.db.accept_friend_link(request_id)?;

    state
        .notify_bus
        .publish(
            &Group::User(link.from_user),
            NotifyEvent::FriendRequestAccepted {
                user_id: actor.sub,
                username: actor.username.clone(),
            },
        )
        .await;

    Ok(())
}

pub async fn reject(state: &AppState, actor: &Claims, request_id: i64) -> ChatResult<()> {
    let link = state
        .db
        .get_friend_link(request_id)?
        .ok_or(ChatError::NotFound("friend request"))?;

    if link.to_user != actor.sub {
        return Err(ChatError::AuthorizationDenied("not your friend request"));
    }

    state.db.delete_friend_link(request_id)?;

    state
        .notify_bus
        .publish(
            &Group::User(link.from_user),
            NotifyEvent::FriendRequestRejected { user_id: actor.sub },
        )
        .await;

    Ok(())
}

/// The sender withdraws a pending request.
pub async fn cancel(state: &AppState, actor: &Claims, request_id: i64) -> ChatResult<()> {
    let link = state
        .db
        .get_friend_link(request_id)?
        .ok_or(ChatError::NotFound("friend request"))?;

    if link.from_user != actor.sub {
        return Err(ChatError::AuthorizationDenied("not your friend request"));
    }
    if link.is_accepted {
        return Err(ChatError::ValidationFailed("request already accepted"));
    }

    state.db.delete_friend_link(request_id)?;

    state
        .notify_bus
        .publish(
            &Group::User(link.to_user),
            NotifyEvent::FriendRequestCancelled { user_id: actor.sub },
        )
        .await;

    Ok(())
}

pub fn list(state: &AppState, user: UserId) -> ChatResult<Vec<UserSummary>> {
    let rows = state.db.list_friends(user)?;
    Ok(rows
        .into_iter()
        .map(|row| UserSummary {
            id: row.id,
            username: row.username,
            full_name: row.full_name,
        })
        .collect())
}

// -- HTTP handlers --

pub async fn pending_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    let incoming = state.db.list_incoming_requests(claims.sub)?;
    let outgoing = state.db.list_outgoing_requests(claims.sub)?;

    let render = |rows: Vec<clique_db::models::FriendLinkRow>| -> Vec<serde_json::Value> {
        rows.into_iter()
            .map(|link| {
                json!({
                    "id": link.id,
                    "from_user": link.from_user,
                    "to_user": link.to_user,
                    "created_at": link.created_at,
                })
            })
            .collect()
    };

    Ok(Json(json!({
        "incoming": render(incoming),
        "outgoing": render(outgoing),
    })))
}

pub async fn send_request_handler(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    let created = send_request(&state, &claims, user_id).await?;
    Ok(Json(json!({ "status": "ok", "created": created })))
}

pub async fn accept_handler(
    State(state): State<AppState>,
    Path(request_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    accept(&state, &claims, request_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn reject_handler(
    State(state): State<AppState>,
    Path(request_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    reject(&state, &claims, request_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn cancel_handler(
    State(state): State<AppState>,
    Path(request_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    cancel(&state, &claims, request_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn list_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ChatResult<impl IntoResponse> {
    let friends = list(&state, claims.sub)?;
    Ok(Json(friends))
}
