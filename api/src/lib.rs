pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod realtime;
pub mod routes;
pub mod types;

use std::sync::Arc;

use config::AppConfig;
use realtime::Hub;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub hub: Arc<Hub>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::config::HubConfig;
    use crate::db;
    use crate::db::models::Timestamp;
    use crate::realtime::Hub;
    use crate::realtime::event::ServerEvent;
    use crate::realtime::relay::Relay;
    use crate::types::{ChatId, ChatKind, UserId};

    /// A fresh in-memory database with migrations applied. A single
    /// connection keeps every query on the same in-memory database.
    pub async fn pool() -> db::Db {
        let pool = db::connect_with("sqlite::memory:", 1).await.unwrap();
        db::migrate(&pool).await.unwrap();
        pool
    }

    pub fn hub(pool: &db::Db) -> Arc<Hub> {
        Hub::new(pool.clone(), HubConfig::default(), Relay::local())
    }

    pub async fn private(pool: &db::Db, a: &str, b: &str) -> ChatId {
        let id = ChatId::new_v4();
        db::chat::create_chat(
            pool,
            &id,
            ChatKind::Private,
            None,
            &[UserId::from(a), UserId::from(b)],
        )
        .await
        .unwrap();
        id
    }

    pub async fn group(pool: &db::Db, members: &[&str]) -> ChatId {
        let id = ChatId::new_v4();
        let members: Vec<UserId> = members.iter().map(|m| UserId::from(*m)).collect();
        db::chat::create_chat(pool, &id, ChatKind::Group, Some("group"), &members)
            .await
            .unwrap();
        id
    }

    /// Parses an RFC 3339 string into the active backend's timestamp type.
    pub fn ts(s: &str) -> Timestamp {
        let t: chrono::DateTime<chrono::Utc> = s.parse().unwrap();
        db::timestamp(t)
    }

    pub async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection queue closed")
    }

    /// Asserts nothing more arrives within a short window.
    pub async fn assert_quiet(rx: &mut mpsc::Receiver<ServerEvent>) {
        let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err(), "unexpected event: {extra:?}");
    }

    /// Waits until the chat lanes have fanned out `n` messages.
    pub async fn settle(hub: &Hub, n: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.engine().invocations() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fan-out did not settle");
    }
}
