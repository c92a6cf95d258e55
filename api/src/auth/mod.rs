use std::collections::HashMap;

use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::types::UserId;

/// HS256 token claims. Tokens are issued by the account service; `sub` is the user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Authenticated user extracted from `Authorization: Bearer <token>`.
///
/// ブラウザの WebSocket はヘッダーを付けられないため、`?token=` クエリも受け付ける。
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
}

/// トークンを検証し、ユーザIDを返す。
pub fn authenticate(secret: &str, token: &str) -> Result<UserId, AppError> {
    let mut validation = Validation::default();
    validation.leeway = 5;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AppError::Unauthorized(format!("invalid token: {e}")))?;

    if data.claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized("token has no subject".into()));
    }
    Ok(UserId(data.claims.sub))
}

/// Signs a token for `user_id` valid for `ttl`. Used by tooling and tests.
pub fn issue_token(
    secret: &str,
    user_id: &UserId,
    ttl: std::time::Duration,
) -> Result<String, AppError> {
    let exp = chrono::Utc::now().timestamp() as usize + ttl.as_secs() as usize;
    let claims = Claims {
        sub: user_id.0.clone(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let header = parts.headers.get("authorization")?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
}

fn query_token(parts: &Parts) -> Option<String> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri).ok()?;
    params.get("token").cloned()
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| query_token(parts))
            .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;

        let user_id = authenticate(&state.config.jwt_secret, &token)?;
        Ok(AuthenticatedUser { user_id })
    }
}
