use super::models::ReceiptRow;
use super::{Db, now, sql};
use crate::types::{MessageId, UserId};

/// Result of recording one reader's receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptOutcome {
    /// false when the reader had already marked the message
    pub inserted: bool,
    /// Receipts on the message after this insert from readers who were
    /// members when it was sent
    pub read_count: i64,
}

/// Inserts the receipt and counts the message's receipts in one transaction,
/// so the count reflects this insert.
#[tracing::instrument(skip(pool), err)]
pub async fn record_receipt(
    pool: &Db,
    message_id: &MessageId,
    reader_id: &UserId,
) -> Result<ReceiptOutcome, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let q = sql(
        "INSERT INTO message_receipts (message_id, reader_id, read_at) VALUES (?, ?, ?)
         ON CONFLICT (message_id, reader_id) DO NOTHING",
    );
    let inserted = sqlx::query(&q)
        .bind(message_id.as_str())
        .bind(reader_id.as_str())
        .bind(now())
        .execute(&mut *tx)
        .await?
        .rows_affected()
        > 0;

    // 送信時点のメンバーの既読だけを数える（後から参加したユーザは除外）
    let q = sql("SELECT COUNT(*) FROM message_receipts r \
         INNER JOIN messages m ON m.id = r.message_id \
         INNER JOIN chat_members cm ON cm.chat_id = m.chat_id AND cm.user_id = r.reader_id \
         WHERE r.message_id = ? AND r.reader_id <> m.sender_id AND cm.joined_at <= m.created_at");
    let (read_count,): (i64,) = sqlx::query_as(&q)
        .bind(message_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(ReceiptOutcome {
        inserted,
        read_count,
    })
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_receipts(
    pool: &Db,
    message_id: &MessageId,
) -> Result<Vec<ReceiptRow>, sqlx::Error> {
    let q = sql("SELECT * FROM message_receipts WHERE message_id = ? ORDER BY read_at ASC");
    sqlx::query_as::<_, ReceiptRow>(&q)
        .bind(message_id.as_str())
        .fetch_all(pool)
        .await
}
