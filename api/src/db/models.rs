use serde::{Deserialize, Serialize};

/// SQLite では TEXT として格納されるため String、
/// PostgreSQL では TIMESTAMPTZ として格納されるため chrono 型を使用。
#[cfg(not(feature = "postgres"))]
pub type Timestamp = String;
#[cfg(feature = "postgres")]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChatRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChatMemberRow {
    pub chat_id: String,
    pub user_id: String,
    pub joined_at: Timestamp,
}

/// A stored chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    pub idempotency_key: String,
    /// Members other than the sender at send time; the target for "read by all".
    #[serde(skip)]
    pub recipient_count: i64,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReceiptRow {
    pub message_id: String,
    pub reader_id: String,
    pub read_at: Timestamp,
}
