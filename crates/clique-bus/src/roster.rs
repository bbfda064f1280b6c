use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use clique_types::models::UserId;

/// Reverse co-membership index: user -> (co-member -> shared-room count).
/// Presence fan-out reads `peers_of` instead of re-scanning every room on
/// each connect/disconnect; membership mutations keep the counts current.
/// The count per pair is what preserves the dedup invariant — a peer shared
/// across three rooms is still one entry.
#[derive(Clone)]
pub struct Roster {
    inner: Arc<RwLock<HashMap<UserId, HashMap<UserId, usize>>>>,
}

impl Roster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Rebuild from the store at startup; `pairs` holds one (user, co-member)
    /// row per shared room.
    pub async fn rebuild(&self, pairs: &[(UserId, UserId)]) {
        let mut index: HashMap<UserId, HashMap<UserId, usize>> = HashMap::new();
        for &(user, other) in pairs {
            *index.entry(user).or_default().entry(other).or_insert(0) += 1;
        }
        *self.inner.write().await = index;
    }

    /// `user` now shares one more room with each of `others`.
    pub async fn link(&self, user: UserId, others: &[UserId]) {
        let mut index = self.inner.write().await;
        for &other in others {
            if other == user {
                continue;
            }
            *index.entry(user).or_default().entry(other).or_insert(0) += 1;
            *index.entry(other).or_default().entry(user).or_insert(0) += 1;
        }
    }

    /// `user` shares one room fewer with each of `others`.
    pub async fn unlink(&self, user: UserId, others: &[UserId]) {
        let mut index = self.inner.write().await;
        for &other in others {
            if other == user {
                continue;
            }
            decrement(&mut index, user, other);
            decrement(&mut index, other, user);
        }
    }

    /// A whole room appeared with this member set.
    pub async fn link_room(&self, members: &[UserId]) {
        for (i, &user) in members.iter().enumerate() {
            self.link(user, &members[i + 1..]).await;
        }
    }

    /// A whole room went away with this member set.
    pub async fn unlink_room(&self, members: &[UserId]) {
        for (i, &user) in members.iter().enumerate() {
            self.unlink(user, &members[i + 1..]).await;
        }
    }

    /// Everyone sharing at least one room with `user`, deduplicated.
    pub async fn peers_of(&self, user: UserId) -> Vec<UserId> {
        self.inner
            .read()
            .await
            .get(&user)
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }
}

fn decrement(index: &mut HashMap<UserId, HashMap<UserId, usize>>, user: UserId, other: UserId) {
    if let Some(peers) = index.get_mut(&user) {
        if let Some(count) = peers.get_mut(&other) {
            *count -= 1;
            if *count == 0 {
                peers.remove(&other);
            }
        }
        if peers.is_empty() {
            index.remove(&user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peers_are_deduplicated_across_shared_rooms() {
        let roster = Roster::new();
        // Two rooms both containing users 1 and 2.
        roster.link_room(&[1, 2, 3]).await;
        roster.link_room(&[1, 2]).await;

        let mut peers = roster.peers_of(1).await;
        peers.sort();
        assert_eq!(peers, vec![2, 3]);

        // Losing one shared room keeps the pair linked through the other.
        roster.unlink_room(&[1, 2]).await;
        let mut peers = roster.peers_of(1).await;
        peers.sort();
        assert_eq!(peers, vec![2, 3]);

        roster.unlink(1, &[2, 3]).await;
        assert!(roster.peers_of(1).await.is_empty());
        assert!(roster.peers_of(2).await.iter().all(|&p| p != 1));
    }

    #[tokio::test]
    async fn rebuild_folds_pair_rows_into_counts() {
        let roster = Roster::new();
        roster.rebuild(&[(1, 2), (2, 1), (1, 2), (2, 1), (2, 3), (3, 2)]).await;

        assert_eq!(roster.peers_of(1).await, vec![2]);
        // 1 and 2 share two rooms; one unlink still leaves them peers.
        roster.unlink(1, &[2]).await;
        assert_eq!(roster.peers_of(1).await, vec![2]);
        roster.unlink(1, &[2]).await;
        assert!(roster.peers_of(1).await.is_empty());
    }
}
