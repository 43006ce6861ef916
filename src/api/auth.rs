//! Identity exchange: GitHub token in, user token out.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::github::IdentityError;

use super::error::ApiError;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    /// GitHub bearer token to verify.
    pub github_token: String,
    /// Claimed GitHub user id; must match the token's owner.
    pub github_id: u64,
    /// Claimed login handle.
    pub github_login: String,
    /// Email to record for the user.
    pub email: String,
}

/// POST /v1/auth/exchange
///
/// Confirms the presented token belongs to the claimed identity, gets or
/// creates the local user, and mints a long-lived user token.
pub async fn exchange(
    State(state): State<AppState>,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.github_token.is_empty() {
        return Err(ApiError::BadRequest("github_token is required".to_owned()));
    }

    let identity = state
        .identity
        .verify(&body.github_token)
        .await
        .map_err(|e| match e {
            IdentityError::Unauthorized => {
                ApiError::Unauthorized("identity token rejected".to_owned())
            }
            IdentityError::Http(message) => ApiError::Internal(message),
        })?;

    if identity.id != body.github_id {
        warn!(
            claimed = body.github_id,
            actual = identity.id,
            "identity exchange id mismatch"
        );
        return Err(ApiError::Unauthorized(
            "token does not belong to the claimed identity".to_owned(),
        ));
    }

    let email = identity.email.unwrap_or_else(|| body.email.clone());
    let user = state
        .users
        .get_or_create(identity.id, &body.github_login, &email)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let token = state.tokens.generate_user_token(&user.id, state.user_ttl)?;

    info!(user_id = %user.id, login = %user.login, "identity exchanged");
    Ok(Json(json!({
        "token": token,
        "user": user,
    })))
}
