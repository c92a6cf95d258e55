use super::models::MessageRow;
use super::{Db, sql};
use crate::types::{ChatId, IdempotencyKey, MessageId, UserId};

/// `(chat_id, idempotency_key)` が未使用ならメッセージを挿入して true を返す。
/// 既に同じキーの行があれば何もせず false を返す（一意制約が重複送信を裁定する）。
#[tracing::instrument(skip(pool, message), fields(id = %message.id), err)]
pub async fn insert_message(pool: &Db, message: &MessageRow) -> Result<bool, sqlx::Error> {
    let q = sql(
        "INSERT INTO messages (id, chat_id, sender_id, text, idempotency_key, recipient_count, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (chat_id, idempotency_key) DO NOTHING",
    );
    let result = sqlx::query(&q)
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(&message.text)
        .bind(&message.idempotency_key)
        .bind(message.recipient_count)
        .bind(&message.created_at)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_message_by_id(
    pool: &Db,
    id: &MessageId,
) -> Result<Option<MessageRow>, sqlx::Error> {
    let q = sql("SELECT * FROM messages WHERE id = ?");
    sqlx::query_as::<_, MessageRow>(&q)
        .bind(id.as_str())
        .fetch_optional(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_message_by_key(
    pool: &Db,
    chat_id: &ChatId,
    key: &IdempotencyKey,
) -> Result<Option<MessageRow>, sqlx::Error> {
    let q = sql("SELECT * FROM messages WHERE chat_id = ? AND idempotency_key = ?");
    sqlx::query_as::<_, MessageRow>(&q)
        .bind(chat_id.as_str())
        .bind(key.as_str())
        .fetch_optional(pool)
        .await
}

/// チャットの履歴を `(created_at, id)` の昇順で取得する。
#[tracing::instrument(skip(pool), err)]
pub async fn get_history(
    pool: &Db,
    chat_id: &ChatId,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    let q = sql("SELECT * FROM messages WHERE chat_id = ?
         ORDER BY created_at ASC, id ASC
         LIMIT ? OFFSET ?");
    sqlx::query_as::<_, MessageRow>(&q)
        .bind(chat_id.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

/// ユーザが所属する全チャットの未読メッセージ（自分の送信分を除く）を古い順に取得する。
#[tracing::instrument(skip(pool), err)]
pub async fn get_unread_for_user(
    pool: &Db,
    user_id: &UserId,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    let q = sql("SELECT m.* FROM messages m \
         INNER JOIN chat_members cm ON cm.chat_id = m.chat_id AND cm.user_id = ? \
         WHERE m.sender_id <> ? \
         AND NOT EXISTS (SELECT 1 FROM message_receipts r \
             WHERE r.message_id = m.id AND r.reader_id = ?) \
         ORDER BY m.created_at ASC, m.id ASC \
         LIMIT ?");
    sqlx::query_as::<_, MessageRow>(&q)
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .bind(limit)
        .fetch_all(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_unread_ids_in_chat(
    pool: &Db,
    chat_id: &ChatId,
    user_id: &UserId,
) -> Result<Vec<MessageId>, sqlx::Error> {
    let q = sql("SELECT m.id FROM messages m \
         WHERE m.chat_id = ? AND m.sender_id <> ? \
         AND NOT EXISTS (SELECT 1 FROM message_receipts r \
             WHERE r.message_id = m.id AND r.reader_id = ?) \
         ORDER BY m.created_at ASC, m.id ASC");
    let rows: Vec<(String,)> = sqlx::query_as(&q)
        .bind(chat_id.as_str())
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| MessageId(id)).collect())
}

#[tracing::instrument(skip(pool), err)]
pub async fn count_unread_in_chat(
    pool: &Db,
    chat_id: &ChatId,
    user_id: &UserId,
) -> Result<i64, sqlx::Error> {
    let q = sql("SELECT COUNT(*) FROM messages m \
         WHERE m.chat_id = ? AND m.sender_id <> ? \
         AND NOT EXISTS (SELECT 1 FROM message_receipts r \
             WHERE r.message_id = m.id AND r.reader_id = ?)");
    let (count,): (i64,) = sqlx::query_as(&q)
        .bind(chat_id.as_str())
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn row(chat: &ChatId, sender: &str, key: &str, created_at: &str) -> MessageRow {
        MessageRow {
            id: MessageId::new_v7().0,
            chat_id: chat.0.clone(),
            sender_id: sender.to_string(),
            text: format!("hello from {sender}"),
            idempotency_key: key.to_string(),
            recipient_count: 1,
            created_at: test_support::ts(created_at),
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected_by_constraint() {
        let pool = test_support::pool().await;
        let chat = test_support::private(&pool, "alice", "bob").await;

        let first = row(&chat, "alice", "k1", "2025-01-01T00:00:00Z");
        let retry = row(&chat, "alice", "k1", "2025-01-01T00:00:01Z");
        assert!(insert_message(&pool, &first).await.unwrap());
        assert!(!insert_message(&pool, &retry).await.unwrap());

        let stored = get_message_by_key(&pool, &chat, &IdempotencyKey::parse("k1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, first.id);
        let dropped = get_message_by_id(&pool, &MessageId(retry.id)).await.unwrap();
        assert!(dropped.is_none());
    }

    #[tokio::test]
    async fn same_key_in_other_chat_is_independent() {
        let pool = test_support::pool().await;
        let a = test_support::private(&pool, "alice", "bob").await;
        let b = test_support::private(&pool, "alice", "carol").await;

        let in_a = row(&a, "alice", "k", "2025-01-01T00:00:00Z");
        let in_b = row(&b, "alice", "k", "2025-01-01T00:00:00Z");
        assert!(insert_message(&pool, &in_a).await.unwrap());
        assert!(insert_message(&pool, &in_b).await.unwrap());
    }

    #[tokio::test]
    async fn history_is_ascending_with_id_tiebreak() {
        let pool = test_support::pool().await;
        let chat = test_support::private(&pool, "alice", "bob").await;

        let mut tied_a = row(&chat, "bob", "k2", "2025-01-01T00:00:05Z");
        let mut tied_b = row(&chat, "alice", "k3", "2025-01-01T00:00:05Z");
        tied_a.id = "00000000-0000-7000-8000-00000000000b".into();
        tied_b.id = "00000000-0000-7000-8000-00000000000a".into();
        let late = row(&chat, "alice", "k4", "2025-01-01T00:00:09Z");
        let early = row(&chat, "alice", "k1", "2025-01-01T00:00:01Z");
        for m in [&late, &tied_a, &early, &tied_b] {
            insert_message(&pool, m).await.unwrap();
        }

        let ids: Vec<String> = get_history(&pool, &chat, 10, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(
            ids,
            vec![
                early.id.clone(),
                tied_b.id.clone(),
                tied_a.id.clone(),
                late.id.clone()
            ]
        );

        let page: Vec<String> = get_history(&pool, &chat, 2, 1)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(page, vec![tied_b.id, tied_a.id]);
    }

    #[tokio::test]
    async fn unread_excludes_own_and_receipted_messages() {
        let pool = test_support::pool().await;
        let chat = test_support::private(&pool, "alice", "bob").await;
        let other = test_support::private(&pool, "carol", "dave").await;

        let own = row(&chat, "bob", "k1", "2025-01-01T00:00:01Z");
        let read = row(&chat, "alice", "k2", "2025-01-01T00:00:02Z");
        let unread = row(&chat, "alice", "k3", "2025-01-01T00:00:03Z");
        let foreign = row(&other, "carol", "k4", "2025-01-01T00:00:04Z");
        for m in [&own, &read, &unread, &foreign] {
            insert_message(&pool, m).await.unwrap();
        }
        let bob = UserId::from("bob");
        crate::db::receipts::record_receipt(&pool, &MessageId(read.id.clone()), &bob)
            .await
            .unwrap();

        let pending = get_unread_for_user(&pool, &bob, 50).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, unread.id);
        assert_eq!(count_unread_in_chat(&pool, &chat, &bob).await.unwrap(), 1);
        assert_eq!(
            get_unread_ids_in_chat(&pool, &chat, &bob).await.unwrap(),
            vec![MessageId(unread.id)]
        );
    }
}
