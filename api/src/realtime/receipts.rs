use super::Hub;
use crate::db;
use crate::error::AppError;
use crate::realtime::event::{ReadAck, ServerEvent};
use crate::types::{ChatId, ChatKind, MessageId, UserId};

impl Hub {
    /// Records `reader_id`'s receipts for a batch of messages.
    ///
    /// Each id is handled on its own: an unknown message, a message in a
    /// chat the reader is not in, or the reader's own message is skipped
    /// with `accepted: false` and does not affect the rest of the batch.
    /// Re-reading is accepted but only the first receipt notifies the sender.
    #[tracing::instrument(skip(self, message_ids), fields(count = message_ids.len()))]
    pub async fn mark_read(&self, reader_id: &UserId, message_ids: &[MessageId]) -> Vec<ReadAck> {
        let mut results = Vec::with_capacity(message_ids.len());
        for message_id in message_ids {
            let accepted = match self.mark_one(reader_id, message_id).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(message_id = %message_id, "failed to record receipt: {e}");
                    false
                }
            };
            results.push(ReadAck {
                message_id: message_id.clone(),
                accepted,
            });
        }
        results
    }

    /// Marks every unread message in the chat as read by `reader_id`.
    #[tracing::instrument(skip(self), err)]
    pub async fn mark_chat_read(
        &self,
        reader_id: &UserId,
        chat_id: &ChatId,
    ) -> Result<Vec<ReadAck>, AppError> {
        self.member_view(chat_id, reader_id).await?;
        let ids = db::messages::get_unread_ids_in_chat(&self.pool, chat_id, reader_id).await?;
        Ok(self.mark_read(reader_id, &ids).await)
    }

    async fn mark_one(&self, reader_id: &UserId, message_id: &MessageId) -> Result<bool, AppError> {
        let Some(message) = db::messages::get_message_by_id(&self.pool, message_id).await? else {
            return Ok(false);
        };
        if message.sender_id == reader_id.as_str() {
            return Ok(false);
        }
        let chat_id = ChatId(message.chat_id.clone());
        let membership = match self.member_view(&chat_id, reader_id).await {
            Ok(m) => m,
            Err(AppError::Forbidden(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let outcome = db::receipts::record_receipt(&self.pool, message_id, reader_id).await?;
        if !outcome.inserted {
            return Ok(true);
        }

        // 全員既読の判定は送信時点の受信者数に対して行う
        let all_read = match membership.kind {
            ChatKind::Group => Some(outcome.read_count >= message.recipient_count),
            ChatKind::Private => None,
        };
        let event = ServerEvent::ReadReceipt {
            message_id: message_id.clone(),
            chat_id,
            reader_id: reader_id.clone(),
            all_read,
        };
        self.engine
            .push(&[UserId(message.sender_id.clone())], &event)
            .await;
        Ok(true)
    }
}
