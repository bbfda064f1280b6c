use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::warn;
use uuid::Uuid;

use clique_types::models::UserId;

struct RoomConn {
    conn_id: Uuid,
    kill: mpsc::UnboundedSender<()>,
}

#[derive(Default)]
struct RegistryInner {
    /// Live room sockets per (room, user); a user may hold several (tabs).
    room_conns: HashMap<(Uuid, UserId), Vec<RoomConn>>,
    /// Open socket count per user, room and notification sockets combined.
    socket_counts: HashMap<UserId, usize>,
}

/// Tracks live WebSocket connections. Membership is authorized against the
/// store at connect time and never cached here — a kicked member's open
/// sockets are torn down explicitly via `terminate`, not left to fail lazily.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
        }
    }

    /// Register a room socket. Returns the connection id and the kill
    /// receiver the socket loop must watch for forced termination.
    pub async fn register_room_socket(
        &self,
        room: Uuid,
        user: UserId,
    ) -> (Uuid, mpsc::UnboundedReceiver<()>) {
        let conn_id = Uuid::new_v4();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let mut inner = self.inner.write().await;
        inner
            .room_conns
            .entry((room, user))
            .or_default()
            .push(RoomConn { conn_id, kill: kill_tx });

        (conn_id, kill_rx)
    }

    /// Unregister a single room socket by its connection id.
    pub async fn unregister_room_socket(&self, room: Uuid, user: UserId, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(conns) = inner.room_conns.get_mut(&(room, user)) {
            conns.retain(|c| c.conn_id != conn_id);
            if conns.is_empty() {
                inner.room_conns.remove(&(room, user));
            }
        }
    }

    /// Force-close every room socket `user` holds in `room`; used by the
    /// kick path. Returns how many sockets were signalled.
    pub async fn terminate(&self, room: Uuid, user: UserId) -> usize {
        let mut inner = self.inner.write().await;
        match inner.room_conns.remove(&(room, user)) {
            Some(conns) => {
                let signalled = conns.len();
                for conn in conns {
                    let _ = conn.kill.send(());
                }
                signalled
            }
            None => 0,
        }
    }

    /// Count a newly opened socket of either kind. Returns true on the
    /// user's 0→1 transition — the moment they come online.
    pub async fn socket_opened(&self, user: UserId) -> bool {
        let mut inner = self.inner.write().await;
        let count = inner.socket_counts.entry(user).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Count a closed socket. Returns true on the 1→0 transition — the
    /// moment the user goes offline.
    pub async fn socket_closed(&self, user: UserId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.socket_counts.get_mut(&user) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                inner.socket_counts.remove(&user);
                true
            }
            None => {
                warn!("socket_closed for user {} with no open sockets", user);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn presence_toggles_only_on_first_and_last_socket() {
        let registry = Registry::new();

        assert!(registry.socket_opened(1).await);
        assert!(!registry.socket_opened(1).await);
        assert!(!registry.socket_closed(1).await);
        assert!(registry.socket_closed(1).await);
        // Unbalanced close is tolerated.
        assert!(!registry.socket_closed(1).await);
    }

    #[tokio::test]
    async fn terminate_signals_every_socket_for_the_pair() {
        let registry = Registry::new();
        let room = Uuid::new_v4();

        let (_, mut kill_a) = registry.register_room_socket(room, 1).await;
        let (_, mut kill_b) = registry.register_room_socket(room, 1).await;
        let (_, mut kill_other) = registry.register_room_socket(room, 2).await;

        assert_eq!(registry.terminate(room, 1).await, 2);
        assert!(kill_a.recv().await.is_some());
        assert!(kill_b.recv().await.is_some());
        assert!(kill_other.try_recv().is_err());

        // Already removed; nothing left to signal.
        assert_eq!(registry.terminate(room, 1).await, 0);
    }

    #[tokio::test]
    async fn unregister_removes_only_the_named_connection() {
        let registry = Registry::new();
        let room = Uuid::new_v4();

        let (conn_a, _kill_a) = registry.register_room_socket(room, 1).await;
        let (_conn_b, mut kill_b) = registry.register_room_socket(room, 1).await;

        registry.unregister_room_socket(room, 1, conn_a).await;
        assert_eq!(registry.terminate(room, 1).await, 1);
        assert!(kill_b.recv().await.is_some());
    }
}
