use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard, mpsc};

use crate::db::models::MessageRow;
use crate::realtime::event::ServerEvent;
use crate::realtime::registry::{ConnectionRegistry, PushCount};
use crate::realtime::relay::Relay;
use crate::types::UserId;

/// What happened when a stored message was pushed to live connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Users the message was addressed to, sender included
    pub recipients: usize,
    /// Connections that accepted the event
    pub delivered: usize,
    /// Connections that failed and were evicted
    pub failed: usize,
    /// Addressed users with no live connection in this process
    pub offline: Vec<UserId>,
}

/// Pushes persisted messages to every live connection of every chat member.
///
/// The sender is a target too: their other devices receive the same
/// `chat_message` as an echo. Offline members get nothing pushed; the message
/// stays unread for them and is replayed when they next connect.
pub struct FanoutEngine {
    registry: Arc<ConnectionRegistry>,
    relay: Relay,
    invocations: AtomicU64,
}

impl FanoutEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, relay: Relay) -> Self {
        Self {
            registry,
            relay,
            invocations: AtomicU64::new(0),
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Number of fan-outs performed so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Never fails: a dead connection is logged and the rest of the targets
    /// are still served. `members` is the membership read when the message
    /// was accepted.
    #[tracing::instrument(
        skip(self, message, members),
        fields(message_id = %message.id, chat_id = %message.chat_id)
    )]
    pub async fn fanout(&self, message: &MessageRow, members: &[UserId]) -> DeliveryOutcome {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let event = ServerEvent::ChatMessage {
            data: message.clone(),
        };
        let outcome = self.push(members, &event).await;
        tracing::debug!(
            delivered = outcome.delivered,
            failed = outcome.failed,
            offline = outcome.offline.len(),
            "fan-out finished"
        );
        outcome
    }

    /// Delivers one event to the local connections of `targets` and publishes
    /// it for other processes.
    pub async fn push(&self, targets: &[UserId], event: &ServerEvent) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome {
            recipients: targets.len(),
            ..Default::default()
        };
        let mut total = PushCount::default();
        for user_id in targets {
            let count = self.registry.deliver_to_user(user_id, event);
            if count.delivered == 0 {
                outcome.offline.push(user_id.clone());
            }
            if count.failed > 0 {
                tracing::warn!(
                    user_id = %user_id,
                    failed = count.failed,
                    event = event.kind(),
                    "push failed for some connections"
                );
            }
            total.add(count);
        }
        outcome.delivered = total.delivered;
        outcome.failed = total.failed;

        self.relay.publish(targets, event).await;
        outcome
    }
}

/// A stored message and the members it goes to.
#[derive(Debug, Clone)]
pub struct FanoutJob {
    pub message: MessageRow,
    pub members: Vec<UserId>,
}

/// One chat's ordering lane: a lock held across "insert then enqueue" and a
/// worker that fans the chat's messages out in enqueue order. Chats have
/// independent lanes, so a slow chat never delays another.
pub struct ChatLane {
    order: Mutex<()>,
    tx: mpsc::UnboundedSender<FanoutJob>,
    pending: Arc<AtomicUsize>,
}

impl ChatLane {
    /// Must be called inside a Tokio runtime. The worker stops once the lane is dropped
    /// and its queue is drained.
    pub fn spawn(engine: Arc<FanoutEngine>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<FanoutJob>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                engine.fanout(&job.message, &job.members).await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
        });
        Self {
            order: Mutex::new(()),
            tx,
            pending,
        }
    }

    pub async fn order(&self) -> MutexGuard<'_, ()> {
        self.order.lock().await
    }

    pub fn enqueue(&self, job: FanoutJob) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.tx.send(job) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::error!(
                message_id = %e.0.message.id,
                "fan-out worker is gone, message not pushed"
            );
        }
    }

    /// No job is queued or running.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use crate::types::MessageId;

    fn message(sender: &str) -> MessageRow {
        MessageRow {
            id: MessageId::new_v7().0,
            chat_id: "c".into(),
            sender_id: sender.into(),
            text: "hello".into(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            recipient_count: 1,
            created_at: crate::db::now(),
        }
    }

    fn users(ids: &[&str]) -> Vec<UserId> {
        ids.iter().map(|u| UserId::from(*u)).collect()
    }

    #[tokio::test]
    async fn dead_connection_does_not_abort_fanout() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let engine = FanoutEngine::new(registry.clone(), Relay::local());

        let mut bob = registry.register(&UserId::from("bob"));
        let dead = registry.register(&UserId::from("carol"));
        let mut alice = registry.register(&UserId::from("alice"));
        drop(dead.events);

        let message = message("alice");
        let outcome = engine
            .fanout(&message, &users(&["alice", "bob", "carol"]))
            .await;

        assert_eq!(outcome.recipients, 3);
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.offline, vec![UserId::from("carol")]);
        assert!(registry.connections_for(&UserId::from("carol")).is_empty());

        let expected = ServerEvent::ChatMessage { data: message };
        assert_eq!(bob.events.try_recv().unwrap(), expected);
        assert_eq!(alice.events.try_recv().unwrap(), expected);
        assert_eq!(engine.invocations(), 1);
    }

    #[tokio::test]
    async fn only_listed_members_receive() {
        let registry = Arc::new(ConnectionRegistry::new(8));
        let engine = FanoutEngine::new(registry.clone(), Relay::local());

        let mut eve = registry.register(&UserId::from("eve"));
        let outcome = engine
            .fanout(&message("alice"), &users(&["alice", "bob"]))
            .await;

        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.offline.len(), 2);
        assert!(eve.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn lane_preserves_enqueue_order_and_drains() {
        let registry = Arc::new(ConnectionRegistry::new(64));
        let engine = Arc::new(FanoutEngine::new(registry.clone(), Relay::local()));
        let lane = ChatLane::spawn(engine.clone());

        let mut bob = registry.register(&UserId::from("bob"));
        let mut sent = Vec::new();
        for _ in 0..10 {
            let m = message("alice");
            sent.push(m.id.clone());
            lane.enqueue(FanoutJob {
                message: m,
                members: users(&["alice", "bob"]),
            });
        }

        let mut received = Vec::new();
        for _ in 0..10 {
            let event = test_support::next_event(&mut bob.events).await;
            let ServerEvent::ChatMessage { data } = event else {
                panic!("unexpected event {event:?}");
            };
            received.push(data.id);
        }
        assert_eq!(received, sent);
        assert_eq!(engine.invocations(), 10);

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !lane.is_idle() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn lanes_run_independently() {
        let registry = Arc::new(ConnectionRegistry::new(64));
        let engine = Arc::new(FanoutEngine::new(registry.clone(), Relay::local()));
        let busy = ChatLane::spawn(engine.clone());
        let quiet = ChatLane::spawn(engine.clone());
        let mut bob = registry.register(&UserId::from("bob"));

        // a held order lock on one chat does not block the other chat's lane
        let _held = busy.order().await;
        let _other = quiet.order().await;
        quiet.enqueue(FanoutJob {
            message: message("alice"),
            members: users(&["bob"]),
        });
        assert!(matches!(
            test_support::next_event(&mut bob.events).await,
            ServerEvent::ChatMessage { .. }
        ));
    }
}
