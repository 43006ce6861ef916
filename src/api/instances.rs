//! Instance lifecycle handlers: create, get, list, delete, heartbeat.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::billing::record_instance_usage;
use crate::provider::{InstanceSpec, ORG_LABEL};

use super::error::ApiError;
use super::middleware::AuthedUser;
use super::AppState;

/// Tiers accepted by the API. The provider treats the label as opaque.
pub const TIERS: [&str; 4] = ["small", "medium", "large", "gpu"];

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    /// Resource tier; one of [`TIERS`].
    pub tier: String,
    /// Names of secrets to mount as environment variables.
    #[serde(default)]
    pub secrets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateInstanceResponse {
    pub id: String,
    pub status: crate::provider::InstanceStatus,
    pub attach_url: String,
    pub created_at: DateTime<Utc>,
}

/// POST /v1/instances — admit, materialize, register, mint attach URL.
pub async fn create_instance(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(body): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), ApiError> {
    if !TIERS.contains(&body.tier.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "invalid tier {:?}: expected one of {}",
            body.tier,
            TIERS.join(", ")
        )));
    }

    let org_id = user.org_id.clone();

    // Optimistic admission: the slot is held from here on, and released
    // on any subsequent failure.
    state.instance_quota.try_acquire(&org_id).await?;

    let spec = InstanceSpec {
        tier: body.tier.clone(),
        secret_names: body.secrets.clone(),
        labels: Default::default(),
    };
    let instance = match state.provider.create_instance(spec).await {
        Ok(instance) => instance,
        Err(e) => {
            state.instance_quota.release(&org_id).await;
            warn!(org_id = %org_id, error = %e, "instance create failed");
            return Err(e.into());
        }
    };

    if let Err(e) = state
        .provider
        .label_instance(&instance.id, ORG_LABEL, &org_id)
        .await
    {
        warn!(instance_id = %instance.id, error = %e, "org labeling failed");
    }

    state.starts.record(&instance.id, Utc::now()).await;
    state.throttle.register_instance(&instance.id, &org_id).await;

    let token = state
        .tokens
        .generate_instance_token(&instance.id, state.instance_ttl)?;
    let attach_url = compose_attach_url(&state.base_url, &instance.id, &token);

    info!(
        instance_id = %instance.id,
        org_id = %org_id,
        tier = %instance.tier,
        "instance created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateInstanceResponse {
            id: instance.id,
            status: instance.status,
            attach_url,
            created_at: instance.created_at,
        }),
    ))
}

/// GET /v1/instances/{id} — stored fields plus a freshly minted attach URL.
pub async fn get_instance(
    State(state): State<AppState>,
    _user: AuthedUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance = state.provider.get_instance(&id).await?;

    let token = state
        .tokens
        .generate_instance_token(&instance.id, state.instance_ttl)?;
    let attach_url = compose_attach_url(&state.base_url, &instance.id, &token);

    Ok(Json(json!({
        "id": instance.id,
        "status": instance.status,
        "tier": instance.tier,
        "created_at": instance.created_at,
        "attach_url": attach_url,
        "labels": instance.labels,
    })))
}

/// GET /v1/instances — pass-through listing.
pub async fn list_instances(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instances = state.provider.list_instances().await?;
    Ok(Json(json!({ "instances": instances })))
}

/// DELETE /v1/instances/{id} — record usage, delete, release the slot.
pub async fn delete_instance(
    State(state): State<AppState>,
    _user: AuthedUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let instance = state.provider.get_instance(&id).await?;

    record_instance_usage(
        &state.metering,
        &state.quota,
        &state.starts,
        &instance,
        Utc::now(),
    )
    .await;

    state.provider.delete_instance(&id).await?;

    state.heartbeats.remove(&id).await;
    state.throttle.unregister_instance(&id).await;
    if let Some(org_id) = instance.org_id() {
        state.instance_quota.release(org_id).await;
    }

    info!(instance_id = %id, "instance deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/instances/{id}/heartbeat — record last activity.
///
/// Unauthenticated by design: the in-sandbox agent lives inside the same
/// trust zone and carries no user credential.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.provider.get_instance(&id).await?;

    state.heartbeats.record(&id).await;
    state.throttle.record_activity(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Compose the WebSocket attach URL from the configured base URL.
///
/// Scheme-rewrites http→ws and https→wss, then appends the attach path
/// with the token in the query string.
pub fn compose_attach_url(base_url: &str, instance_id: &str, token: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_owned()
    };
    let ws_base = ws_base.trim_end_matches('/');
    format!("{ws_base}/v1/instances/{instance_id}/attach?token={token}")
}
