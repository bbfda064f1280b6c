use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use clique_types::models::UserId;

const GROUP_CAPACITY: usize = 1024;

/// Named broadcast group. Room groups carry room events to every open socket
/// in that room; user groups carry notification events to every socket the
/// user has open, regardless of which room UI is showing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    Room(Uuid),
    User(UserId),
}

/// Group-messaging primitive: members join named groups and receive every
/// event published to them. Publication is fire-and-forget — a publisher
/// never blocks on subscriber delivery, and a group with no members drops
/// events on the floor. Not durable storage: every state change is persisted
/// before it is published, so a missed event is recoverable by re-querying.
///
/// In-memory implementation over per-group `broadcast` channels; a shared
/// broker can replace it behind the same surface for multi-process fanout.
pub struct Backplane<E: Clone> {
    groups: Arc<RwLock<HashMap<Group, broadcast::Sender<E>>>>,
}

impl<E: Clone> Clone for Backplane<E> {
    fn clone(&self) -> Self {
        Self {
            groups: self.groups.clone(),
        }
    }
}

impl<E: Clone> Backplane<E> {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Join a group; the receiver sees every event published afterward.
    pub async fn join(&self, group: Group) -> broadcast::Receiver<E> {
        let mut groups = self.groups.write().await;
        groups
            .entry(group)
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .subscribe()
    }

    /// Publish to every current member of the group. Returns the number of
    /// receivers; a subscriber-free group is pruned on the way out.
    pub async fn publish(&self, group: &Group, event: E) -> usize {
        let mut groups = self.groups.write().await;
        match groups.get(group) {
            Some(tx) => match tx.send(event) {
                Ok(delivered) => delivered,
                Err(_) => {
                    groups.remove(group);
                    0
                }
            },
            None => 0,
        }
    }

    #[cfg(test)]
    async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_group_member() {
        let bus: Backplane<String> = Backplane::new();
        let room = Group::Room(Uuid::new_v4());

        let mut rx_a = bus.join(room.clone()).await;
        let mut rx_b = bus.join(room.clone()).await;

        let delivered = bus.publish(&room, "hello".to_string()).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap(), "hello");
        assert_eq!(rx_b.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn groups_are_isolated() {
        let bus: Backplane<String> = Backplane::new();
        let mut rx_user = bus.join(Group::User(7)).await;
        let _rx_room = bus.join(Group::Room(Uuid::new_v4())).await;

        bus.publish(&Group::User(7), "direct".to_string()).await;
        assert_eq!(rx_user.recv().await.unwrap(), "direct");
        assert!(rx_user.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_to_empty_group_is_a_noop_and_prunes() {
        let bus: Backplane<String> = Backplane::new();
        let group = Group::User(1);

        assert_eq!(bus.publish(&group, "nobody home".to_string()).await, 0);

        let rx = bus.join(group.clone()).await;
        assert_eq!(bus.group_count().await, 1);
        drop(rx);

        // Last receiver gone: the next publish finds no members and prunes.
        assert_eq!(bus.publish(&group, "gone".to_string()).await, 0);
        assert_eq!(bus.group_count().await, 0);
    }
}
