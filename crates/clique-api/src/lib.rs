pub mod error;
pub mod friends;
pub mod identity;
pub mod messages;
pub mod presence;
pub mod rooms;
pub mod sockets;

use std::sync::Arc;

use clique_bus::{Backplane, Registry, Roster};
use clique_db::Database;
use clique_types::events::{NotifyEvent, RoomEvent};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub registry: Registry,
    pub roster: Roster,
    pub rooms_bus: Backplane<RoomEvent>,
    pub notify_bus: Backplane<NotifyEvent>,
    pub jwt_secret: String,
}

impl AppStateInner {
    pub fn new(db: Database, jwt_secret: String) -> AppState {
        Arc::new(Self {
            db,
            registry: Registry::new(),
            roster: Roster::new(),
            rooms_bus: Backplane::new(),
            notify_bus: Backplane::new(),
            jwt_secret,
        })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use clique_types::api::Claims;

    use super::{AppState, AppStateInner};

    pub fn state() -> AppState {
        let db = clique_db::Database::open_in_memory().unwrap();
        AppStateInner::new(db, "test-secret".into())
    }

    pub fn claims(id: i64, username: &str) -> Claims {
        Claims {
            sub: id,
            username: username.into(),
            full_name: None,
            exp: 0,
        }
    }

    pub fn seed_users(state: &AppState, ids: &[i64]) {
        for id in ids {
            state
                .db
                .upsert_user(*id, &format!("user{id}"), None)
                .unwrap();
        }
    }

    pub fn befriend(state: &AppState, a: i64, b: i64) {
        let (link, _) = state
            .db
            .create_friend_request(a, b, &chrono::Utc::now().to_rfc3339())
            .unwrap();
        state.db.accept_friend_link(link.id).unwrap();
    }
}
