pub mod chat;
pub mod messages;
pub mod models;
pub mod receipts;

use chrono::{DateTime, Utc};

use models::Timestamp;

#[cfg(not(feature = "postgres"))]
pub type Db = sqlx::SqlitePool;
#[cfg(feature = "postgres")]
pub type Db = sqlx::PgPool;

/// `?` プレースホルダを PostgreSQL の `$1, $2, ...` に変換する。
/// SQLite ビルドではそのまま返す。
#[cfg(not(feature = "postgres"))]
pub(crate) fn sql(query: &str) -> std::borrow::Cow<'_, str> {
    std::borrow::Cow::Borrowed(query)
}

#[cfg(feature = "postgres")]
pub(crate) fn sql(query: &str) -> std::borrow::Cow<'_, str> {
    use std::fmt::Write;
    let mut result = String::with_capacity(query.len() + 16);
    let mut idx = 0u32;
    let mut in_literal = false;
    for ch in query.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                result.push(ch);
            }
            '?' if !in_literal => {
                idx += 1;
                write!(result, "${idx}").unwrap();
            }
            _ => result.push(ch),
        }
    }
    std::borrow::Cow::Owned(result)
}

/// Server clock value in the column representation of the active backend.
///
/// SQLite stores fixed-width RFC 3339 text with microseconds so that string
/// comparison orders rows chronologically.
#[cfg(not(feature = "postgres"))]
pub(crate) fn timestamp(t: DateTime<Utc>) -> Timestamp {
    t.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

#[cfg(feature = "postgres")]
pub(crate) fn timestamp(t: DateTime<Utc>) -> Timestamp {
    t
}

pub(crate) fn now() -> Timestamp {
    timestamp(Utc::now())
}

pub async fn connect(url: &str) -> Result<Db, sqlx::Error> {
    connect_with(url, 5).await
}

pub async fn connect_with(url: &str, max_connections: u32) -> Result<Db, sqlx::Error> {
    #[cfg(not(feature = "postgres"))]
    {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            // in-memory databases live only as long as their connection
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;
        Ok(pool)
    }
    #[cfg(feature = "postgres")]
    {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(pool)
    }
}

pub async fn migrate(pool: &Db) -> Result<(), sqlx::migrate::MigrateError> {
    #[cfg(not(feature = "postgres"))]
    {
        sqlx::migrate!("./migrations/sqlite").run(pool).await?;
    }
    #[cfg(feature = "postgres")]
    {
        sqlx::migrate!("./migrations/postgres").run(pool).await?;
    }
    Ok(())
}
