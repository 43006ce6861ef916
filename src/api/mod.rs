//! HTTP API: the `/v1` REST surface and the WebSocket attach proxy.
//!
//! Handlers are thin: they authenticate, validate, and delegate to the
//! services composed in [`ServerContext`]. Everything downstream of a
//! handler returns [`error::ApiError`], which owns the HTTP mapping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::github::IdentityVerifier;
use crate::auth::token::TokenManager;
use crate::auth::users::UserStore;
use crate::billing::meter::MeteringService;
use crate::billing::quota::{InstanceQuota, QuotaEngine};
use crate::billing::InstanceStarts;
use crate::heartbeat::HeartbeatRegistry;
use crate::metrics::Metrics;
use crate::provider::Provider;
use crate::terminal::TerminalBinder;
use crate::throttle::ThrottleService;

pub mod attach;
pub mod auth;
pub mod billing;
pub mod error;
pub mod health;
pub mod instances;
pub mod middleware;
pub mod secrets;

/// Shared state behind every handler.
pub struct ServerContext {
    /// Externally reachable base URL for attach URL composition.
    pub base_url: String,
    /// Instance token lifetime.
    pub instance_ttl: Duration,
    /// User token lifetime.
    pub user_ttl: Duration,
    /// Sandbox provider.
    pub provider: Arc<dyn Provider>,
    /// Terminal session binder for the attach proxy.
    pub binder: Arc<dyn TerminalBinder>,
    /// Capability token mint/verify.
    pub tokens: TokenManager,
    /// Persisted user mapping.
    pub users: Arc<UserStore>,
    /// External identity verifier for the auth exchange.
    pub identity: Arc<dyn IdentityVerifier>,
    /// Last-activity registry.
    pub heartbeats: Arc<HeartbeatRegistry>,
    /// Monthly hours accounting.
    pub quota: Arc<QuotaEngine>,
    /// Live-instance admission counts.
    pub instance_quota: Arc<InstanceQuota>,
    /// Runtime throttling.
    pub throttle: Arc<ThrottleService>,
    /// Usage metering queue.
    pub metering: Arc<MeteringService>,
    /// Instance start times.
    pub starts: Arc<InstanceStarts>,
    /// Metric instruments.
    pub metrics: Metrics,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// Handler state alias.
pub type AppState = Arc<ServerContext>;

/// Per-request timeout applied to all non-WebSocket routes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    // Bearer user-token routes.
    let authed = Router::new()
        .route(
            "/instances",
            post(instances::create_instance).get(instances::list_instances),
        )
        .route(
            "/instances/:id",
            get(instances::get_instance).delete(instances::delete_instance),
        )
        .route(
            "/secrets",
            post(secrets::create_secret).get(secrets::list_secrets),
        )
        .route(
            "/secrets/:name",
            get(secrets::get_secret).delete(secrets::delete_secret),
        )
        .route("/billing", get(billing::billing_summary))
        .route("/user", get(billing::current_user))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_user,
        ));

    // Routes outside the user-auth group. The heartbeat endpoint trusts
    // the in-sandbox agent (same private network) and requires only that
    // the instance exists.
    let open = Router::new()
        .route("/auth/exchange", post(auth::exchange))
        .route("/instances/:id/heartbeat", post(instances::heartbeat));

    let v1 = authed
        .merge(open)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        // The attach socket is long-lived; no request timeout.
        .route("/instances/:id/attach", get(attach::attach));

    Router::new()
        .nest("/v1", v1)
        .route("/health", get(health::health))
        .route("/metrics", get(health::metrics_text))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
