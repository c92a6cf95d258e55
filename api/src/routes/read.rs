use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::types::{ChatId, MessageId};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/read", post(mark_read))
        .route("/chat/{chat_id}/read", post(mark_chat_read))
        .route("/chat/{chat_id}/unread", get(get_unread_count))
}

#[derive(Deserialize)]
struct ReadBody {
    message_ids: Vec<MessageId>,
}

async fn mark_read(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<ReadBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.message_ids.is_empty() {
        return Err(AppError::InvalidInput("message_ids must not be empty".into()));
    }
    let results = state.hub.mark_read(&auth.user_id, &body.message_ids).await;
    Ok(Json(serde_json::json!({ "results": results })))
}

async fn mark_chat_read(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let results = state
        .hub
        .mark_chat_read(&auth.user_id, &ChatId(chat_id))
        .await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

async fn get_unread_count(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let chat_id = ChatId(chat_id);
    let unread = state.hub.unread_count(&chat_id, &auth.user_id).await?;
    Ok(Json(serde_json::json!({
        "chat_id": chat_id,
        "unread": unread,
    })))
}
