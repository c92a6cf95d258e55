pub mod drafts;
pub mod event;
pub mod fanout;
pub mod idempotency;
pub mod receipts;
pub mod registry;
pub mod relay;
pub mod submit;

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::HubConfig;
use crate::db;
use crate::error::AppError;
use crate::types::{ChatId, ConnectionId, Membership, UserId};
use drafts::DraftStore;
use event::ServerEvent;
use fanout::{ChatLane, FanoutEngine};
use idempotency::IdempotencyGuard;
use registry::{ConnectionRegistry, Registration};
use relay::Relay;

/// The real-time delivery core. One per process, shared by every handler.
pub struct Hub {
    pool: db::Db,
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    guard: IdempotencyGuard,
    drafts: DraftStore,
    engine: Arc<FanoutEngine>,
    /// Per-chat ordering lanes, created on first submission and pruned when idle
    lanes: DashMap<ChatId, Arc<ChatLane>>,
}

/// Entries removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub guard: usize,
    pub drafts: usize,
    pub lanes: usize,
    pub relay_spill: u64,
}

impl PurgeStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Hub {
    pub fn new(pool: db::Db, config: HubConfig, relay: Relay) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.connection_queue_capacity));
        let engine = Arc::new(FanoutEngine::new(registry.clone(), relay));
        Arc::new(Self {
            guard: IdempotencyGuard::new(config.idempotency_ttl),
            drafts: DraftStore::new(config.draft_ttl),
            pool,
            config,
            registry,
            engine,
            lanes: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &FanoutEngine {
        &self.engine
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Registers a new live connection for an authenticated user.
    pub fn connect(&self, user_id: &UserId) -> Registration {
        self.registry.register(user_id)
    }

    pub fn disconnect(&self, id: &ConnectionId) {
        self.registry.unregister(id);
    }

    /// Events a connection receives right after it opens: unread messages
    /// that arrived while the user was away, then the user's own drafts.
    pub async fn sync_events(&self, user_id: &UserId) -> Result<Vec<ServerEvent>, AppError> {
        let mut events = Vec::with_capacity(2);
        let messages =
            db::messages::get_unread_for_user(&self.pool, user_id, self.config.redelivery_limit)
                .await?;
        if !messages.is_empty() {
            events.push(ServerEvent::QueuedMessages {
                count: messages.len(),
                messages,
            });
        }
        let drafts = self.drafts.for_user(user_id).await;
        if !drafts.is_empty() {
            events.push(ServerEvent::DraftSync { drafts });
        }
        Ok(events)
    }

    /// Purges expired guard entries, drafts and relay spill rows, and drops
    /// lanes of chats with no submission in flight and nothing left to fan out.
    pub async fn purge_expired(&self) -> PurgeStats {
        let before = self.lanes.len();
        self.lanes
            .retain(|_, lane| Arc::strong_count(lane) > 1 || !lane.is_idle());
        PurgeStats {
            guard: self.guard.purge_expired().await,
            drafts: self.drafts.purge_expired().await,
            lanes: before.saturating_sub(self.lanes.len()),
            relay_spill: self.engine.relay().purge_spill().await,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Fetches the chat's membership and checks that `user_id` belongs to it.
    async fn member_view(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
    ) -> Result<Membership, AppError> {
        match db::chat::get_membership(&self.pool, chat_id).await? {
            Some(m) if m.contains(user_id) => Ok(m),
            _ => Err(AppError::Forbidden("not a member of this chat".into())),
        }
    }

    /// Must be called inside a Tokio runtime; a new lane spawns its worker.
    fn lane(&self, chat_id: &ChatId) -> Arc<ChatLane> {
        self.lanes
            .entry(chat_id.clone())
            .or_insert_with(|| Arc::new(ChatLane::spawn(self.engine.clone())))
            .clone()
    }
}
