use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use clique_bus::Group;
use clique_types::api::Claims;
use clique_types::events::{Activity, ClientFrame, RoomEvent};

use crate::error::{ChatError, ChatResult};
use crate::{AppState, identity, messages, presence};

/// Room-socket upgrade. Identity and membership are checked before the
/// upgrade is accepted; a non-member never gets a socket. Membership is NOT
/// cached for the connection's lifetime — a kick tears the socket down via
/// the registry's kill handle instead.
pub async fn room_socket(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(auth): Query<identity::TokenQuery>,
    ws: WebSocketUpgrade,
) -> ChatResult<Response> {
    let claims = identity::verify_token(&state.jwt_secret, &auth.token)
        .ok_or(ChatError::AuthorizationDenied("invalid token"))?;

    // Keep the identity mirror current before anything references the user.
    state
        .db
        .upsert_user(claims.sub, &claims.username, claims.full_name.as_deref())?;

    state
        .db
        .get_room(&room_id.to_string())?
        .ok_or(ChatError::NotFound("room"))?;
    if !state.db.is_member(&room_id.to_string(), claims.sub)? {
        return Err(ChatError::AuthorizationDenied(
            "you are not allowed to join this chat",
        ));
    }

    Ok(ws
        .on_upgrade(move |socket| run_room_socket(socket, state, room_id, claims))
        .into_response())
}

async fn run_room_socket(socket: WebSocket, state: AppState, room_id: Uuid, claims: Claims) {
    let user_id = claims.sub;
    let username = claims.username.clone();
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before announcing so no event can slip between the two. The
    // connection sits in both its room group and the user's personal
    // notification group — a kicked_from_group notice must reach a client
    // that only has the room open.
    let mut room_rx = state.rooms_bus.join(Group::Room(room_id)).await;
    let mut notify_rx = state.notify_bus.join(Group::User(user_id)).await;
    let (conn_id, mut kill_rx) = state.registry.register_room_socket(room_id, user_id).await;

    if state.registry.socket_opened(user_id).await {
        presence::set_online(&state, user_id, true).await;
    }

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::ChatActivity {
                user_id,
                username: username.clone(),
                activity: Activity::UserJoin,
            },
        )
        .await;

    info!("{} ({}) connected to room {}", username, user_id, room_id);

    // Rejections for frame-initiated actions flow back to this connection
    // only, through the reply channel.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<RoomEvent>();

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = room_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("room receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = notify_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("notification receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode notification: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = reply_rx.recv() => {
                    let Some(event) = result else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = kill_rx.recv() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Frames are processed in arrival order; a slow store call delays this
    // connection only.
    let recv_state = state.clone();
    let recv_claims = claims.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => {
                        handle_frame(&recv_state, room_id, &recv_claims, frame, &reply_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad frame: {} -- raw: {}",
                            recv_claims.username,
                            recv_claims.sub,
                            e,
                            &text[..text.len().min(200)]
                        );
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state
        .registry
        .unregister_room_socket(room_id, user_id, conn_id)
        .await;

    state
        .rooms_bus
        .publish(
            &Group::Room(room_id),
            RoomEvent::ChatActivity {
                user_id,
                username: username.clone(),
                activity: Activity::UserLeave,
            },
        )
        .await;

    if state.registry.socket_closed(user_id).await {
        presence::set_online(&state, user_id, false).await;
    }

    info!("{} ({}) disconnected from room {}", username, user_id, room_id);
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &RoomEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode room event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn handle_frame(
    state: &AppState,
    room_id: Uuid,
    claims: &Claims,
    frame: ClientFrame,
    reply: &mpsc::UnboundedSender<RoomEvent>,
) {
    let result = match frame {
        ClientFrame::Message { message, is_file } => {
            messages::submit(state, room_id, claims, &message, is_file)
                .await
                .map(|_| ())
        }
        ClientFrame::MessageRead => messages::mark_read(state, claims.sub, room_id)
            .await
            .map(|_| ()),
        ClientFrame::Typing { is_typing } => {
            state
                .rooms_bus
                .publish(
                    &Group::Room(room_id),
                    RoomEvent::ChatActivity {
                        user_id: claims.sub,
                        username: claims.username.clone(),
                        activity: Activity::Typing { is_typing },
                    },
                )
                .await;
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!("{} ({}) frame rejected: {}", claims.username, claims.sub, e);
        let _ = reply.send(RoomEvent::Error { detail: e.to_string() });
    }
}

/// Notification-socket upgrade: outbound-only per-user event channel,
/// independent of any room UI.
pub async fn notify_socket(
    State(state): State<AppState>,
    Query(auth): Query<identity::TokenQuery>,
    ws: WebSocketUpgrade,
) -> ChatResult<Response> {
    let claims = identity::verify_token(&state.jwt_secret, &auth.token)
        .ok_or(ChatError::AuthorizationDenied("invalid token"))?;

    state
        .db
        .upsert_user(claims.sub, &claims.username, claims.full_name.as_deref())?;

    Ok(ws
        .on_upgrade(move |socket| run_notify_socket(socket, state, claims))
        .into_response())
}

async fn run_notify_socket(socket: WebSocket, state: AppState, claims: Claims) {
    let user_id = claims.sub;
    let username = claims.username.clone();
    let (mut sender, mut receiver) = socket.split();

    let mut notify_rx = state.notify_bus.join(Group::User(user_id)).await;

    if state.registry.socket_opened(user_id).await {
        presence::set_online(&state, user_id, true).await;
    }

    info!("{} ({}) connected to notifications", username, user_id);

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match notify_rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("notification receiver lagged by {} events", n);
                    continue;
                }
                Err(_) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode notification: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // The protocol is outbound-only; inbound frames are drained and dropped.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if state.registry.socket_closed(user_id).await {
        presence::set_online(&state, user_id, false).await;
    }

    info!("{} ({}) disconnected from notifications", username, user_id);
}
