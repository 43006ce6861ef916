//! Secret CRUD handlers.
//!
//! Secret values flow in on create and out to sandbox environments only;
//! list and get responses expose entry keys, never values.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::provider::{ProviderError, Secret};

use super::error::ApiError;
use super::middleware::AuthedUser;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSecretRequest {
    /// Secret name, unique within the namespace.
    pub name: String,
    /// Entry mapping.
    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// POST /v1/secrets
pub async fn create_secret(
    State(state): State<AppState>,
    _user: AuthedUser,
    Json(body): Json<CreateSecretRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("secret name is required".to_owned()));
    }
    if body.data.is_empty() {
        return Err(ApiError::BadRequest("secret data is required".to_owned()));
    }

    let secret = state
        .provider
        .create_secret(&body.name, body.data)
        .await
        .map_err(|e| match e {
            ProviderError::SecretExists(_) => ApiError::BadRequest(e.to_string()),
            other => other.into(),
        })?;

    info!(name = %secret.name, "secret created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "name": secret.name,
            "namespace": secret.namespace,
            "created_at": secret.created_at,
        })),
    ))
}

/// GET /v1/secrets
pub async fn list_secrets(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let secrets = state.provider.list_secrets().await?;
    let summaries: Vec<serde_json::Value> = secrets.iter().map(summarize).collect();
    Ok(Json(json!({ "secrets": summaries })))
}

/// GET /v1/secrets/{name}
pub async fn get_secret(
    State(state): State<AppState>,
    _user: AuthedUser,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let secret = state.provider.get_secret(&name).await?;
    Ok(Json(summarize(&secret)))
}

/// DELETE /v1/secrets/{name}
pub async fn delete_secret(
    State(state): State<AppState>,
    _user: AuthedUser,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.provider.delete_secret(&name).await?;
    info!(name = %name, "secret deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn summarize(secret: &Secret) -> serde_json::Value {
    json!({
        "name": secret.name,
        "namespace": secret.namespace,
        "created_at": secret.created_at,
        "keys": secret.keys(),
    })
}
