use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db;
use crate::realtime::event::ServerEvent;
use crate::realtime::registry::ConnectionRegistry;
use crate::types::{MessageId, UserId};

/// NOTIFY channel shared by every server process.
pub const RELAY_CHANNEL: &str = "murmur_events";

/// PostgreSQL rejects NOTIFY payloads of 8000 bytes or more.
pub const NOTIFY_PAYLOAD_LIMIT: usize = 7900;

/// What an envelope carries. Stored messages travel by id and are loaded
/// from the store by the receiving process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayBody {
    Event { event: ServerEvent },
    StoredMessage { message_id: MessageId },
}

/// An event addressed to users whose connections may live in another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: String,
    pub targets: Vec<UserId>,
    pub body: RelayBody,
}

/// The NOTIFY payload. Envelopes too large for NOTIFY are written to the
/// `relay_spill` table and announced by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum RelayNotice {
    Inline(RelayEnvelope),
    Spilled { spill_id: String },
}

/// An encoded envelope ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Notify(String),
    Spill {
        spill_id: String,
        envelope: String,
        notice: String,
    },
}

impl RelayEnvelope {
    pub fn new(origin: &str, targets: &[UserId], event: &ServerEvent) -> Self {
        let body = match event {
            ServerEvent::ChatMessage { data } => RelayBody::StoredMessage {
                message_id: MessageId(data.id.clone()),
            },
            other => RelayBody::Event {
                event: other.clone(),
            },
        };
        Self {
            origin: origin.to_string(),
            targets: targets.to_vec(),
            body,
        }
    }

    pub fn encode(&self) -> Result<Outgoing, serde_json::Error> {
        let inline = serde_json::to_string(&RelayNotice::Inline(self.clone()))?;
        if inline.len() <= NOTIFY_PAYLOAD_LIMIT {
            return Ok(Outgoing::Notify(inline));
        }
        let spill_id = uuid::Uuid::new_v4().to_string();
        Ok(Outgoing::Spill {
            notice: serde_json::to_string(&RelayNotice::Spilled {
                spill_id: spill_id.clone(),
            })?,
            envelope: serde_json::to_string(self)?,
            spill_id,
        })
    }

    /// Delivers to the local connections of every target. Envelopes this
    /// process published itself are skipped (they were delivered locally).
    pub async fn deliver_local(
        self,
        self_origin: &str,
        registry: &ConnectionRegistry,
        pool: &db::Db,
    ) -> Result<usize, sqlx::Error> {
        if self.origin == self_origin {
            return Ok(0);
        }
        let event = match self.body {
            RelayBody::Event { event } => event,
            RelayBody::StoredMessage { message_id } => {
                match db::messages::get_message_by_id(pool, &message_id).await? {
                    Some(data) => ServerEvent::ChatMessage { data },
                    None => {
                        tracing::warn!(message_id = %message_id, "relayed message not found");
                        return Ok(0);
                    }
                }
            }
        };
        Ok(self
            .targets
            .iter()
            .map(|user_id| registry.deliver_to_user(user_id, &event).delivered)
            .sum())
    }
}

/// Fan-out channel between server processes.
///
/// Every push is delivered to this process's registry directly and also
/// published here, so a recipient connected to another process receives it
/// too. The local relay is for single-process deployments.
#[derive(Clone)]
pub struct Relay {
    origin: String,
    kind: RelayKind,
}

#[derive(Clone)]
enum RelayKind {
    Local,
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
}

impl Relay {
    pub fn local() -> Self {
        Self {
            origin: uuid::Uuid::new_v4().to_string(),
            kind: RelayKind::Local,
        }
    }

    #[cfg(feature = "postgres")]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            origin: uuid::Uuid::new_v4().to_string(),
            kind: RelayKind::Postgres(pool),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Publishes to other processes. Failures are logged, never returned:
    /// the message is already stored and reachable through history.
    pub async fn publish(&self, targets: &[UserId], event: &ServerEvent) {
        if targets.is_empty() {
            return;
        }
        match &self.kind {
            RelayKind::Local => {}
            #[cfg(feature = "postgres")]
            RelayKind::Postgres(pool) => {
                let envelope = RelayEnvelope::new(&self.origin, targets, event);
                let outgoing = match envelope.encode() {
                    Ok(o) => o,
                    Err(e) => {
                        tracing::warn!("failed to encode relay envelope: {e}");
                        return;
                    }
                };
                if let Err(e) = publish_postgres(pool, outgoing).await {
                    tracing::warn!(event = event.kind(), "relay publish failed: {e}");
                }
            }
        }
    }

    /// Deletes spilled envelopes old enough that every listener has read them.
    pub async fn purge_spill(&self) -> u64 {
        match &self.kind {
            RelayKind::Local => 0,
            #[cfg(feature = "postgres")]
            RelayKind::Postgres(pool) => {
                match sqlx::query(
                    "DELETE FROM relay_spill WHERE created_at < NOW() - INTERVAL '5 minutes'",
                )
                .execute(pool)
                .await
                {
                    Ok(r) => r.rows_affected(),
                    Err(e) => {
                        tracing::warn!("relay spill cleanup failed: {e}");
                        0
                    }
                }
            }
        }
    }

    /// Starts delivering envelopes from other processes to `registry`.
    /// Returns `None` for the local relay.
    #[cfg(not(feature = "postgres"))]
    pub fn spawn_listener(
        &self,
        _registry: Arc<ConnectionRegistry>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        None
    }

    /// Starts delivering envelopes from other processes to `registry`.
    /// Returns `None` for the local relay.
    #[cfg(feature = "postgres")]
    pub fn spawn_listener(
        &self,
        registry: Arc<ConnectionRegistry>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        match &self.kind {
            RelayKind::Local => None,
            RelayKind::Postgres(pool) => {
                let pool = pool.clone();
                let origin = self.origin.clone();
                Some(tokio::spawn(async move {
                    listen(pool, origin, registry).await;
                }))
            }
        }
    }
}

#[cfg(feature = "postgres")]
async fn publish_postgres(pool: &sqlx::PgPool, outgoing: Outgoing) -> Result<(), sqlx::Error> {
    match outgoing {
        Outgoing::Notify(payload) => {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(RELAY_CHANNEL)
                .bind(&payload)
                .execute(pool)
                .await?;
        }
        Outgoing::Spill {
            spill_id,
            envelope,
            notice,
        } => {
            // NOTIFY は commit 時に送られるので、受信側からは行が必ず見える
            let mut tx = pool.begin().await?;
            sqlx::query("INSERT INTO relay_spill (id, payload) VALUES ($1, $2)")
                .bind(&spill_id)
                .bind(&envelope)
                .execute(&mut *tx)
                .await?;
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(RELAY_CHANNEL)
                .bind(&notice)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
    }
    Ok(())
}

#[cfg(feature = "postgres")]
async fn load_notice(
    pool: &sqlx::PgPool,
    payload: &str,
) -> Result<Option<RelayEnvelope>, Box<dyn std::error::Error + Send + Sync>> {
    match serde_json::from_str::<RelayNotice>(payload)? {
        RelayNotice::Inline(envelope) => Ok(Some(envelope)),
        RelayNotice::Spilled { spill_id } => {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT payload FROM relay_spill WHERE id = $1")
                    .bind(&spill_id)
                    .fetch_optional(pool)
                    .await?;
            match row {
                Some((envelope,)) => Ok(Some(serde_json::from_str(&envelope)?)),
                None => Ok(None),
            }
        }
    }
}

#[cfg(feature = "postgres")]
async fn listen(pool: sqlx::PgPool, origin: String, registry: Arc<ConnectionRegistry>) {
    use sqlx::postgres::PgListener;
    use tokio::time::{Duration, sleep};

    loop {
        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("relay listener connect failed: {e}");
                sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        if let Err(e) = listener.listen(RELAY_CHANNEL).await {
            tracing::warn!("relay LISTEN failed: {e}");
            sleep(Duration::from_secs(1)).await;
            continue;
        }
        tracing::info!("relay listening on {RELAY_CHANNEL}");

        loop {
            let notification = match listener.recv().await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("relay listener error: {e}");
                    break;
                }
            };
            let envelope = match load_notice(&pool, notification.payload()).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    tracing::warn!("spilled relay envelope already purged");
                    continue;
                }
                Err(e) => {
                    tracing::warn!("invalid relay payload: {e}");
                    continue;
                }
            };
            if let Err(e) = envelope.deliver_local(&origin, &registry, &pool).await {
                tracing::warn!("relay delivery failed: {e}");
            }
        }
    }
}
