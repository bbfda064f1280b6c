use tracing::warn;

use clique_bus::Group;
use clique_types::events::NotifyEvent;
use clique_types::models::UserId;

use crate::AppState;

/// Persist the flag, then tell everyone who shares at least one room with
/// this user — once each, however many rooms they share. Presence updates
/// run on the connect/disconnect path and must never fail it, so store
/// errors are logged and swallowed here.
pub async fn set_online(state: &AppState, user: UserId, is_online: bool) {
    if let Err(e) = state.db.set_user_online(user, is_online) {
        warn!("failed to persist presence for user {}: {:#}", user, e);
    }

    for peer in state.roster.peers_of(user).await {
        state
            .notify_bus
            .publish(
                &Group::User(peer),
                NotifyEvent::StatusChange { user_id: user, is_online },
            )
            .await;
    }
}
