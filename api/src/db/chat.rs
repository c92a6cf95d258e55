use super::models::{ChatMemberRow, ChatRow};
use super::{Db, now, sql};
use crate::types::{ChatId, ChatKind, Membership, UserId};

#[tracing::instrument(skip(pool), err)]
pub async fn get_chat(pool: &Db, chat_id: &ChatId) -> Result<Option<ChatRow>, sqlx::Error> {
    let q = sql("SELECT * FROM chats WHERE id = ?");
    sqlx::query_as::<_, ChatRow>(&q)
        .bind(chat_id.as_str())
        .fetch_optional(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_chat_members(
    pool: &Db,
    chat_id: &ChatId,
) -> Result<Vec<ChatMemberRow>, sqlx::Error> {
    let q = sql("SELECT * FROM chat_members WHERE chat_id = ? ORDER BY user_id");
    sqlx::query_as::<_, ChatMemberRow>(&q)
        .bind(chat_id.as_str())
        .fetch_all(pool)
        .await
}

/// チャットの種別とメンバー一覧を取得する。チャットが存在しなければ `None`。
#[tracing::instrument(skip(pool), err)]
pub async fn get_membership(
    pool: &Db,
    chat_id: &ChatId,
) -> Result<Option<Membership>, sqlx::Error> {
    let Some(chat) = get_chat(pool, chat_id).await? else {
        return Ok(None);
    };
    let kind = ChatKind::parse(&chat.kind).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown chat kind {:?}", chat.kind).into())
    })?;
    let members = get_chat_members(pool, chat_id)
        .await?
        .into_iter()
        .map(|m| UserId(m.user_id))
        .collect();
    Ok(Some(Membership {
        chat_id: chat_id.clone(),
        kind,
        members,
    }))
}

/// Seeds a chat with its members. Membership management proper belongs to the
/// chat service; this is the minimal write path used for provisioning.
#[tracing::instrument(skip(pool), err)]
pub async fn create_chat(
    pool: &Db,
    id: &ChatId,
    kind: ChatKind,
    name: Option<&str>,
    member_ids: &[UserId],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let q = sql("INSERT INTO chats (id, kind, name) VALUES (?, ?, ?)");
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(kind.as_str())
        .bind(name)
        .execute(&mut *tx)
        .await?;

    let q = sql(
        "INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES (?, ?, ?)
         ON CONFLICT (chat_id, user_id) DO NOTHING",
    );
    let joined_at = now();
    for member_id in member_ids {
        sqlx::query(&q)
            .bind(id.as_str())
            .bind(member_id.as_str())
            .bind(&joined_at)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[tracing::instrument(skip(pool), err)]
pub async fn add_member(pool: &Db, chat_id: &ChatId, user_id: &UserId) -> Result<(), sqlx::Error> {
    let q = sql(
        "INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES (?, ?, ?)
         ON CONFLICT (chat_id, user_id) DO NOTHING",
    );
    sqlx::query(&q)
        .bind(chat_id.as_str())
        .bind(user_id.as_str())
        .bind(now())
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn membership_of_missing_chat_is_none() {
        let pool = test_support::pool().await;
        let m = get_membership(&pool, &ChatId::from("nope")).await.unwrap();
        assert!(m.is_none());
    }

    #[tokio::test]
    async fn membership_lists_members() {
        let pool = test_support::pool().await;
        let chat = test_support::group(&pool, &["alice", "bob", "carol"]).await;

        let m = get_membership(&pool, &chat).await.unwrap().unwrap();
        assert_eq!(m.kind, ChatKind::Group);
        assert_eq!(
            m.members,
            vec![UserId::from("alice"), UserId::from("bob"), UserId::from("carol")]
        );
        assert!(m.contains(&UserId::from("bob")));
        assert!(!m.contains(&UserId::from("mallory")));
    }

    #[tokio::test]
    async fn add_member_is_idempotent() {
        let pool = test_support::pool().await;
        let chat = test_support::private(&pool, "alice", "bob").await;
        add_member(&pool, &chat, &UserId::from("bob")).await.unwrap();
        assert_eq!(get_chat_members(&pool, &chat).await.unwrap().len(), 2);
    }
}
