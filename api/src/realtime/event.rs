use serde::{Deserialize, Serialize};

use crate::db::models::MessageRow;
use crate::realtime::drafts::Draft;
use crate::types::{ChatId, MessageId, UserId};

/// Events pushed from the server to a live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ChatMessage {
        data: MessageRow,
    },
    ReadReceipt {
        message_id: MessageId,
        chat_id: ChatId,
        reader_id: UserId,
        /// Only present for group chats
        #[serde(default, skip_serializing_if = "Option::is_none")]
        all_read: Option<bool>,
    },
    DraftUpdate {
        chat_id: ChatId,
        user_id: UserId,
        text: String,
        updated_at: chrono::DateTime<chrono::Utc>,
    },
    DraftDelete {
        chat_id: ChatId,
        user_id: UserId,
    },
    /// Unread messages replayed when a connection opens
    QueuedMessages {
        messages: Vec<MessageRow>,
        count: usize,
    },
    /// The user's own drafts, sent when a connection opens
    DraftSync {
        drafts: Vec<Draft>,
    },
    MessageAck {
        idempotency_key: String,
        message_id: MessageId,
        duplicate: bool,
    },
    ReadAck {
        results: Vec<ReadAck>,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chat_message",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::DraftUpdate { .. } => "draft_update",
            Self::DraftDelete { .. } => "draft_delete",
            Self::QueuedMessages { .. } => "queued_messages",
            Self::DraftSync { .. } => "draft_sync",
            Self::MessageAck { .. } => "message_ack",
            Self::ReadAck { .. } => "read_ack",
            Self::Error { .. } => "error",
        }
    }
}

/// Per-message result of a read acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAck {
    pub message_id: MessageId,
    pub accepted: bool,
}

/// Commands a client sends over its connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Send {
        chat_id: ChatId,
        text: String,
        idempotency_key: String,
    },
    Read {
        message_ids: Vec<MessageId>,
    },
    DraftUpdate {
        chat_id: ChatId,
        text: String,
    },
    DraftDelete {
        chat_id: ChatId,
    },
}
