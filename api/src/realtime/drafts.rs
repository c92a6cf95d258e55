use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::Hub;
use super::event::ServerEvent;
use crate::error::AppError;
use crate::types::{ChatId, UserId};

/// Unsent compose-box text. Never written to the message store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub text: String,
    pub updated_at: DateTime<Utc>,
}

struct DraftEntry {
    draft: Draft,
    expires_at: Instant,
}

/// Fast-expiring side store for drafts, keyed by `(chat_id, user_id)`.
/// Last write wins.
#[derive(Clone)]
pub struct DraftStore {
    entries: Arc<RwLock<HashMap<(ChatId, UserId), DraftEntry>>>,
    ttl: std::time::Duration,
}

impl DraftStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn put(&self, chat_id: &ChatId, user_id: &UserId, text: &str) -> Draft {
        let draft = Draft {
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
            text: text.to_string(),
            updated_at: Utc::now(),
        };
        self.entries.write().await.insert(
            (chat_id.clone(), user_id.clone()),
            DraftEntry {
                draft: draft.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        draft
    }

    pub async fn get(&self, chat_id: &ChatId, user_id: &UserId) -> Option<Draft> {
        let entries = self.entries.read().await;
        entries
            .get(&(chat_id.clone(), user_id.clone()))
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.draft.clone())
    }

    /// Returns whether a draft was present.
    pub async fn remove(&self, chat_id: &ChatId, user_id: &UserId) -> bool {
        self.entries
            .write()
            .await
            .remove(&(chat_id.clone(), user_id.clone()))
            .is_some()
    }

    /// All unexpired drafts written by `user_id`, oldest first.
    pub async fn for_user(&self, user_id: &UserId) -> Vec<Draft> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut drafts: Vec<Draft> = entries
            .iter()
            .filter(|((_, owner), e)| owner == user_id && e.expires_at > now)
            .map(|(_, e)| e.draft.clone())
            .collect();
        drafts.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        drafts
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

impl Hub {
    /// Stores the user's draft and pushes it to the chat's other members.
    /// Offline members receive nothing; drafts are never replayed to them.
    #[tracing::instrument(skip(self, text), err)]
    pub async fn update_draft(
        &self,
        chat_id: &ChatId,
        user_id: &UserId,
        text: &str,
    ) -> Result<Draft, AppError> {
        if text.len() > self.config.max_message_len {
            return Err(AppError::InvalidInput(format!(
                "draft too long (max {} bytes)",
                self.config.max_message_len
            )));
        }
        let membership = self.member_view(chat_id, user_id).await?;
        let draft = self.drafts.put(chat_id, user_id, text).await;

        let others: Vec<UserId> = membership.recipients_of(user_id).cloned().collect();
        let event = ServerEvent::DraftUpdate {
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
            text: draft.text.clone(),
            updated_at: draft.updated_at,
        };
        self.engine.push(&others, &event).await;
        Ok(draft)
    }

    /// Removes the user's draft and tells the other members. The delete is
    /// broadcast even when no draft was stored. Returns whether one was.
    #[tracing::instrument(skip(self), err)]
    pub async fn delete_draft(&self, chat_id: &ChatId, user_id: &UserId) -> Result<bool, AppError> {
        let membership = self.member_view(chat_id, user_id).await?;
        let removed = self.drafts.remove(chat_id, user_id).await;

        let others: Vec<UserId> = membership.recipients_of(user_id).cloned().collect();
        let event = ServerEvent::DraftDelete {
            chat_id: chat_id.clone(),
            user_id: user_id.clone(),
        };
        self.engine.push(&others, &event).await;
        Ok(removed)
    }
}
