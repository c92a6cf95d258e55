use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::put;
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::realtime::drafts::Draft;
use crate::types::ChatId;

pub fn routes() -> Router<AppState> {
    Router::new().route("/chat/{chat_id}/draft", put(put_draft).delete(delete_draft))
}

#[derive(Deserialize)]
struct DraftBody {
    text: String,
}

async fn put_draft(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    auth: AuthenticatedUser,
    Json(body): Json<DraftBody>,
) -> Result<Json<Draft>, AppError> {
    let draft = state
        .hub
        .update_draft(&ChatId(chat_id), &auth.user_id, &body.text)
        .await?;
    Ok(Json(draft))
}

async fn delete_draft(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<StatusCode, AppError> {
    state
        .hub
        .delete_draft(&ChatId(chat_id), &auth.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
