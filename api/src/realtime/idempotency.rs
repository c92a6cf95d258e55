use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::db::models::MessageRow;
use crate::types::{ChatId, IdempotencyKey};

struct GuardEntry {
    message: MessageRow,
    expires_at: Instant,
}

/// 受理済み送信の短期キャッシュ。
///
/// `(chat_id, idempotency_key)` から受理済みメッセージを引き、同じ送信の
/// 即時再送をDB書き込みの前に打ち切る。あくまで高速化のためのもので、
/// エントリが消えていても一意制約が重複を防ぐ。
#[derive(Clone)]
pub struct IdempotencyGuard {
    entries: Arc<RwLock<HashMap<(ChatId, IdempotencyKey), GuardEntry>>>,
    ttl: std::time::Duration,
}

impl IdempotencyGuard {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn lookup(&self, chat_id: &ChatId, key: &IdempotencyKey) -> Option<MessageRow> {
        let entries = self.entries.read().await;
        let entry = entries.get(&(chat_id.clone(), key.clone()))?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.message.clone())
    }

    pub async fn remember(&self, chat_id: &ChatId, key: &IdempotencyKey, message: &MessageRow) {
        let mut entries = self.entries.write().await;
        entries.insert(
            (chat_id.clone(), key.clone()),
            GuardEntry {
                message: message.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// 期限切れエントリを削除し、削除件数を返す。
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drops every entry, as after a restart.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
