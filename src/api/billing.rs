//! Billing summary and user info handlers.

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::billing::TIER_PRICES_CENTS;

use super::error::ApiError;
use super::middleware::AuthedUser;
use super::AppState;

/// GET /v1/billing — quota status, live count, and tier pricing.
pub async fn billing_summary(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let org_id = user.org_id.clone();
    let status = state.quota.get_usage_status(&org_id).await;
    let live_instances = state.instance_quota.count(&org_id).await;

    let prices: serde_json::Map<String, serde_json::Value> = TIER_PRICES_CENTS
        .iter()
        .map(|(tier, cents)| ((*tier).to_owned(), json!(cents)))
        .collect();

    Ok(Json(json!({
        "org_id": org_id,
        "plan": user.plan,
        "usage": status,
        "live_instances": live_instances,
        "instance_limit": state.instance_quota.limit(),
        "tier_prices_cents_per_hour": prices,
    })))
}

/// GET /v1/user — the authenticated user's record.
pub async fn current_user(user: AuthedUser) -> Json<serde_json::Value> {
    Json(json!({ "user": user.0 }))
}
