use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::types::{ChatId, MessageId};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/chat/{chat_id}/message",
            get(get_messages).post(post_message),
        )
        .route("/chat/{chat_id}/message/{message_id}", get(get_message_by_id))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let messages = state
        .hub
        .history(&auth.user_id, &ChatId(chat_id), query.limit, query.offset)
        .await?;

    Ok(Json(serde_json::json!({
        "messages": messages,
        "count": messages.len(),
    })))
}

async fn get_message_by_id(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, String)>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let message = state
        .hub
        .message(&auth.user_id, &MessageId(message_id))
        .await?;
    // パスのチャットと一致しない場合は存在を明かさない
    if message.chat_id != chat_id {
        return Err(AppError::NotFound("message not found".into()));
    }
    Ok(Json(serde_json::json!(message)))
}

#[derive(Deserialize)]
struct PostMessageBody {
    text: String,
    idempotency_key: String,
}

/// 新規作成なら 201、同じキーの再送なら既存メッセージを 200 で返す。
async fn post_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    auth: AuthenticatedUser,
    Json(body): Json<PostMessageBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let submission = state
        .hub
        .submit(
            &ChatId(chat_id),
            &auth.user_id,
            &body.text,
            &body.idempotency_key,
        )
        .await?;

    let status = if submission.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(serde_json::json!(submission.message))))
}
