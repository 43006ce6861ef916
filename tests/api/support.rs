//! Shared fixtures for API integration tests: a full server on an
//! ephemeral port, backed by the fake provider and a canned identity
//! verifier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orzbob::api::{router, AppState, ServerContext};
use orzbob::auth::github::{GitHubIdentity, IdentityError, IdentityVerifier};
use orzbob::auth::token::TokenManager;
use orzbob::auth::users::{User, UserStore};
use orzbob::billing::meter::MeteringService;
use orzbob::billing::quota::{InstanceQuota, QuotaEngine};
use orzbob::billing::InstanceStarts;
use orzbob::heartbeat::HeartbeatRegistry;
use orzbob::metrics::Metrics;
use orzbob::provider::fake::FakeProvider;
use orzbob::terminal::EchoBinder;
use orzbob::throttle::{ThrottleLimits, ThrottleService};

/// Issuer used by all test servers.
pub const TEST_ISSUER: &str = "orzbob-test";

/// Identity verifier that accepts any token except `"bad-token"` and
/// always answers with the same identity.
pub struct StaticVerifier {
    pub id: u64,
    pub login: String,
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<GitHubIdentity, IdentityError> {
        if token == "bad-token" {
            return Err(IdentityError::Unauthorized);
        }
        Ok(GitHubIdentity {
            id: self.id,
            login: self.login.clone(),
            email: Some(format!("{}@example.com", self.login)),
        })
    }
}

/// A running control plane bound to an ephemeral port.
pub struct TestServer {
    /// `http://127.0.0.1:{port}` base.
    pub base_url: String,
    /// Shared state, for poking internals mid-test.
    pub state: AppState,
    _tmp: tempfile::TempDir,
}

/// Spawn a server with the default instance quota of 3.
pub async fn spawn_server() -> TestServer {
    spawn_server_with_quota(3).await
}

/// Spawn a server with a specific per-org instance cap.
pub async fn spawn_server_with_quota(max_instances: u32) -> TestServer {
    let tmp = tempfile::tempdir().expect("tempdir");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    let base_url = format!("http://{addr}");

    let metrics = Metrics::new().expect("metrics");
    let quota_engine = Arc::new(QuotaEngine::new(None, None));
    let metering = Arc::new(MeteringService::new(
        None,
        quota_engine.clone(),
        metrics.clone(),
        Duration::from_secs(60),
    ));

    let state: AppState = Arc::new(ServerContext {
        base_url: base_url.clone(),
        instance_ttl: Duration::from_secs(120),
        user_ttl: Duration::from_secs(90 * 24 * 60 * 60),
        provider: Arc::new(FakeProvider::new()),
        binder: Arc::new(EchoBinder),
        tokens: TokenManager::generate(TEST_ISSUER).expect("keygen"),
        users: Arc::new(UserStore::load(tmp.path().join("users.json")).expect("user store")),
        identity: Arc::new(StaticVerifier {
            id: 7777,
            login: "octocat".to_owned(),
        }),
        heartbeats: Arc::new(HeartbeatRegistry::new()),
        quota: quota_engine,
        instance_quota: Arc::new(InstanceQuota::new(max_instances)),
        throttle: Arc::new(ThrottleService::new(
            ThrottleLimits::from_config(&Default::default()),
            None,
        )),
        metering,
        starts: Arc::new(InstanceStarts::new()),
        metrics,
        started_at: Instant::now(),
    });

    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestServer {
        base_url,
        state,
        _tmp: tmp,
    }
}

impl TestServer {
    /// Create a user and mint a valid user token for it.
    pub async fn seed_user(&self, github_id: u64, login: &str) -> (String, User) {
        let user = self
            .state
            .users
            .get_or_create(github_id, login, &format!("{login}@example.com"))
            .await
            .expect("seed user");
        let token = self
            .state
            .tokens
            .generate_user_token(&user.id, Duration::from_secs(3600))
            .expect("user token");
        (token, user)
    }
}
