//! Bearer user-token middleware.
//!
//! Applied to every `/v1` route except the auth exchange, the heartbeat
//! endpoint, and the WebSocket attach route (which authenticates with its
//! own instance token). The authenticated [`User`] is stored in request
//! extensions for handlers to extract.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::auth::users::User;
use crate::auth::TokenType;

use super::error::ApiError;
use super::AppState;

/// Require a valid user token; inject the resolved [`User`].
pub async fn require_user(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request)
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_owned()))?;

    let claims = state.tokens.validate(&token)?;
    if claims.typ != TokenType::User {
        return Err(ApiError::Unauthorized("user token required".to_owned()));
    }

    let user = state
        .users
        .get(&claims.sub)
        .await
        .ok_or_else(|| ApiError::Unauthorized("unknown user".to_owned()))?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn bearer_token(request: &Request) -> Option<String> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = header.strip_prefix("Bearer ")?;
    if token.is_empty() {
        None
    } else {
        Some(token.to_owned())
    }
}

/// Extracts the authenticated user injected by [`require_user`].
pub type AuthedUser = axum::Extension<User>;
