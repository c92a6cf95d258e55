use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::realtime::event::ServerEvent;
use crate::types::{ConnectionId, UserId};

/// Outcome of pushing one event to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// The connection is gone or not draining its queue; it has been evicted.
    Failed,
}

/// A freshly registered connection. The transport drains `events`.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub events: mpsc::Receiver<ServerEvent>,
}

/// Aggregate result of pushing one event to a set of connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushCount {
    pub delivered: usize,
    pub failed: usize,
}

impl PushCount {
    pub fn add(&mut self, other: PushCount) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// Process-local map from user to their open connections (one per device or tab).
///
/// Each connection owns a bounded outbound queue. Pushing never waits on a
/// connection: a full or closed queue is a failed delivery and the connection
/// is removed, so one slow consumer cannot hold up delivery to the others.
/// All operations on one user's bucket are serialised by the map's shard lock.
pub struct ConnectionRegistry {
    users: DashMap<UserId, HashMap<ConnectionId, mpsc::Sender<ServerEvent>>>,
    owners: DashMap<ConnectionId, UserId>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            users: DashMap::new(),
            owners: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(&self, user_id: &UserId) -> Registration {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let id = ConnectionId::new_v4();
        self.owners.insert(id.clone(), user_id.clone());
        self.users
            .entry(user_id.clone())
            .or_default()
            .insert(id.clone(), tx);
        tracing::debug!(user_id = %user_id, connection_id = %id, "connection registered");
        Registration {
            id,
            user_id: user_id.clone(),
            events: rx,
        }
    }

    /// Removes the connection. Unknown or already removed handles are a no-op.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let Some((_, user_id)) = self.owners.remove(id) else {
            return false;
        };
        if let Some(mut conns) = self.users.get_mut(&user_id) {
            conns.remove(id);
        }
        self.users.remove_if(&user_id, |_, conns| conns.is_empty());
        tracing::debug!(user_id = %user_id, connection_id = %id, "connection unregistered");
        true
    }

    pub fn connections_for(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|conns| conns.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    pub fn deliver(&self, id: &ConnectionId, event: ServerEvent) -> DeliveryStatus {
        let sender = self.owners.get(id).and_then(|owner| {
            self.users
                .get(owner.value())
                .and_then(|conns| conns.get(id).cloned())
        });
        let Some(sender) = sender else {
            return DeliveryStatus::Failed;
        };
        self.try_push(id, &sender, event)
    }

    /// Pushes `event` to every live connection of `user_id`.
    pub fn deliver_to_user(&self, user_id: &UserId, event: &ServerEvent) -> PushCount {
        let targets: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> = self
            .users
            .get(user_id)
            .map(|conns| {
                conns
                    .iter()
                    .map(|(id, tx)| (id.clone(), tx.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let mut count = PushCount::default();
        for (id, sender) in targets {
            match self.try_push(&id, &sender, event.clone()) {
                DeliveryStatus::Delivered => count.delivered += 1,
                DeliveryStatus::Failed => count.failed += 1,
            }
        }
        count
    }

    fn try_push(
        &self,
        id: &ConnectionId,
        sender: &mpsc::Sender<ServerEvent>,
        event: ServerEvent,
    ) -> DeliveryStatus {
        match sender.try_send(event) {
            Ok(()) => DeliveryStatus::Delivered,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    connection_id = %id,
                    event = event.kind(),
                    "outbound queue full, evicting connection"
                );
                self.unregister(id);
                DeliveryStatus::Failed
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(
                    connection_id = %id,
                    event = event.kind(),
                    "connection closed, evicting"
                );
                self.unregister(id);
                DeliveryStatus::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> ServerEvent {
        ServerEvent::Error {
            message: "ping".into(),
        }
    }

    #[test]
    fn multiple_devices_per_user() {
        let registry = ConnectionRegistry::new(8);
        let alice = UserId::from("alice");
        let a = registry.register(&alice);
        let b = registry.register(&alice);

        let mut conns = registry.connections_for(&alice);
        conns.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(conns, expected);
        assert!(registry.connections_for(&UserId::from("bob")).is_empty());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new(8);
        let alice = UserId::from("alice");
        let reg = registry.register(&alice);

        assert!(registry.unregister(&reg.id));
        assert!(!registry.unregister(&reg.id));
        assert!(registry.connections_for(&alice).is_empty());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn closed_connection_is_evicted_on_delivery() {
        let registry = ConnectionRegistry::new(8);
        let alice = UserId::from("alice");
        let live = registry.register(&alice);
        let dead = registry.register(&alice);
        drop(dead.events);

        assert_eq!(registry.deliver(&dead.id, ping()), DeliveryStatus::Failed);
        assert_eq!(registry.connections_for(&alice), vec![live.id.clone()]);
        assert_eq!(registry.deliver(&live.id, ping()), DeliveryStatus::Delivered);
    }

    #[test]
    fn full_queue_counts_as_failure() {
        let registry = ConnectionRegistry::new(1);
        let alice = UserId::from("alice");
        let mut slow = registry.register(&alice);

        assert_eq!(registry.deliver(&slow.id, ping()), DeliveryStatus::Delivered);
        assert_eq!(registry.deliver(&slow.id, ping()), DeliveryStatus::Failed);
        assert!(registry.connections_for(&alice).is_empty());
        // the buffered event is still readable
        assert!(slow.events.try_recv().is_ok());
    }

    #[test]
    fn deliver_to_user_reaches_every_device() {
        let registry = ConnectionRegistry::new(8);
        let alice = UserId::from("alice");
        let mut a = registry.register(&alice);
        let mut b = registry.register(&alice);
        let dead = registry.register(&alice);
        drop(dead.events);

        let count = registry.deliver_to_user(&alice, &ping());
        assert_eq!(count, PushCount { delivered: 2, failed: 1 });
        assert_eq!(a.events.try_recv().unwrap(), ping());
        assert_eq!(b.events.try_recv().unwrap(), ping());
        assert_eq!(registry.connections_for(&alice).len(), 2);
    }

    #[test]
    fn unknown_handle_fails() {
        let registry = ConnectionRegistry::new(8);
        assert_eq!(
            registry.deliver(&ConnectionId::from("ghost"), ping()),
            DeliveryStatus::Failed
        );
    }

    #[tokio::test]
    async fn concurrent_registration() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new(8));
        let alice = UserId::from("alice");
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                let reg = registry.register(&alice);
                tokio::task::yield_now().await;
                registry.unregister(&reg.id);
                registry.register(&alice)
            }));
        }
        let mut kept = Vec::new();
        for h in handles {
            kept.push(h.await.unwrap());
        }
        assert_eq!(registry.connections_for(&alice).len(), 32);
        assert_eq!(registry.connection_count(), 32);
        drop(kept);
    }
}
