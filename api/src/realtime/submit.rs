use serde::Serialize;

use super::Hub;
use super::fanout::FanoutJob;
use crate::db;
use crate::db::models::MessageRow;
use crate::error::AppError;
use crate::types::{ChatId, IdempotencyKey, MessageId, UserId};

/// Result of accepting a send. `created` is false when the idempotency key
/// resolved to a message accepted earlier; such a submission is not fanned out again.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub message: MessageRow,
    pub created: bool,
}

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;

impl Hub {
    /// Accepts a message exactly once per `(chat_id, idempotency_key)`.
    ///
    /// Retries and concurrent duplicates resolve to the stored row. The
    /// storage constraint decides races; the guard only answers early for
    /// duplicates it has already seen, and only after membership is checked.
    /// Returns once the message is stored; fan-out runs on the chat's lane.
    #[tracing::instrument(skip(self, text), err)]
    pub async fn submit(
        &self,
        chat_id: &ChatId,
        sender_id: &UserId,
        text: &str,
        idempotency_key: &str,
    ) -> Result<Submission, AppError> {
        let key = IdempotencyKey::parse(idempotency_key).map_err(AppError::InvalidInput)?;
        if text.trim().is_empty() {
            return Err(AppError::InvalidInput("message text must not be empty".into()));
        }
        if text.len() > self.config.max_message_len {
            return Err(AppError::InvalidInput(format!(
                "message text too long (max {} bytes)",
                self.config.max_message_len
            )));
        }

        // 非メンバーにはキャッシュの有無に関係なく Forbidden を返す
        let membership = self.member_view(chat_id, sender_id).await?;

        if let Some(existing) = self.guard.lookup(chat_id, &key).await {
            return resolve_existing(existing, sender_id);
        }

        let lane = self.lane(chat_id);
        let (message, created) = {
            let _order = lane.order().await;
            let message = MessageRow {
                id: MessageId::new_v7().0,
                chat_id: chat_id.0.clone(),
                sender_id: sender_id.0.clone(),
                text: text.to_string(),
                idempotency_key: key.as_str().to_string(),
                recipient_count: membership.recipients_of(sender_id).count() as i64,
                created_at: db::now(),
            };
            if db::messages::insert_message(&self.pool, &message).await? {
                lane.enqueue(FanoutJob {
                    message: message.clone(),
                    members: membership.members,
                });
                (message, true)
            } else {
                let existing = db::messages::get_message_by_key(&self.pool, chat_id, &key)
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal("conflicting message disappeared".into())
                    })?;
                (existing, false)
            }
        };

        self.guard.remember(chat_id, &key, &message).await;
        if created {
            tracing::info!(message_id = %message.id, "message accepted");
            Ok(Submission { message, created })
        } else {
            tracing::debug!(message_id = %message.id, "duplicate submission resolved");
            resolve_existing(message, sender_id)
        }
    }

    /// Chat history ascending by `(created_at, id)`. Only members may read it.
    #[tracing::instrument(skip(self), err)]
    pub async fn history(
        &self,
        requester: &UserId,
        chat_id: &ChatId,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<MessageRow>, AppError> {
        self.member_view(chat_id, requester).await?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, self.config.history_max_limit);
        let offset = offset.unwrap_or(0).max(0);
        Ok(db::messages::get_history(&self.pool, chat_id, limit, offset).await?)
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn message(
        &self,
        requester: &UserId,
        message_id: &MessageId,
    ) -> Result<MessageRow, AppError> {
        let message = db::messages::get_message_by_id(&self.pool, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound("message not found".into()))?;
        self.member_view(&ChatId(message.chat_id.clone()), requester)
            .await?;
        Ok(message)
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn unread_count(&self, chat_id: &ChatId, user_id: &UserId) -> Result<u64, AppError> {
        self.member_view(chat_id, user_id).await?;
        let count = db::messages::count_unread_in_chat(&self.pool, chat_id, user_id).await?;
        Ok(count.max(0) as u64)
    }
}

/// A key belongs to the sender who first used it in the chat.
fn resolve_existing(existing: MessageRow, sender_id: &UserId) -> Result<Submission, AppError> {
    if existing.sender_id != sender_id.as_str() {
        return Err(AppError::Conflict(
            "idempotency key already used in this chat".into(),
        ));
    }
    Ok(Submission {
        message: existing,
        created: false,
    })
}
