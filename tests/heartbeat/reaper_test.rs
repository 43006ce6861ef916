//! Idle reaper sweeps against the fake provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use orzbob::billing::meter::MeteringService;
use orzbob::billing::quota::{InstanceQuota, QuotaEngine};
use orzbob::billing::InstanceStarts;
use orzbob::heartbeat::{sweep_once, HeartbeatRegistry, ReaperDeps};
use orzbob::metrics::Metrics;
use orzbob::provider::fake::FakeProvider;
use orzbob::provider::{InstanceSpec, Provider, ORG_LABEL};
use orzbob::throttle::{ThrottleLimits, ThrottleService};

fn deps_with(provider: Arc<FakeProvider>) -> ReaperDeps {
    let metrics = Metrics::new().expect("metrics");
    let quota = Arc::new(QuotaEngine::new(None, None));
    ReaperDeps {
        provider,
        heartbeats: Arc::new(HeartbeatRegistry::new()),
        metering: Arc::new(MeteringService::new(
            None,
            quota.clone(),
            metrics.clone(),
            StdDuration::from_secs(60),
        )),
        quota,
        starts: Arc::new(InstanceStarts::new()),
        instance_quota: Arc::new(InstanceQuota::new(3)),
        throttle: Arc::new(ThrottleService::new(
            ThrottleLimits::from_config(&Default::default()),
            None,
        )),
        metrics,
    }
}

async fn create_org_instance(provider: &FakeProvider, org_id: &str) -> String {
    let mut labels = HashMap::new();
    labels.insert(ORG_LABEL.to_owned(), org_id.to_owned());
    provider
        .create_instance(InstanceSpec {
            tier: "small".to_owned(),
            secret_names: Vec::new(),
            labels,
        })
        .await
        .expect("create")
        .id
}

#[tokio::test]
async fn idle_instances_are_reaped_active_ones_survive() {
    let provider = Arc::new(FakeProvider::new());
    let deps = deps_with(provider.clone());
    let now = Utc::now();

    let fresh = create_org_instance(&provider, "org-a").await;
    let stale = create_org_instance(&provider, "org-a").await;

    deps.heartbeats
        .record_at(&fresh, now - Duration::minutes(10))
        .await;
    deps.heartbeats
        .record_at(&stale, now - Duration::minutes(35))
        .await;
    deps.starts
        .record(&stale, now - Duration::minutes(35))
        .await;
    deps.instance_quota.try_acquire("org-a").await.expect("slot");
    deps.instance_quota.try_acquire("org-a").await.expect("slot");

    let reaped = sweep_once(&deps, Duration::minutes(30), now).await;
    assert_eq!(reaped, 1);

    // The active instance survives with its heartbeat intact.
    assert!(provider.get_instance(&fresh).await.is_ok());
    assert!(deps.heartbeats.last_seen(&fresh).await.is_some());

    // The stale one is gone everywhere.
    assert!(provider.get_instance(&stale).await.is_err());
    assert!(deps.heartbeats.last_seen(&stale).await.is_none());
    assert_eq!(deps.instance_quota.count("org-a").await, 1);

    // One final usage sample was queued for the reaped instance.
    assert_eq!(deps.metering.queue_len().await, 1);
}

#[tokio::test]
async fn instances_without_heartbeats_age_from_creation() {
    let provider = Arc::new(FakeProvider::new());
    let deps = deps_with(provider.clone());

    let id = create_org_instance(&provider, "org-b").await;

    // Created "now": not yet idle, nothing reaped.
    let reaped = sweep_once(&deps, Duration::minutes(30), Utc::now()).await;
    assert_eq!(reaped, 0);

    // Jump the clock past the idle window.
    let later = Utc::now() + Duration::minutes(31);
    let reaped = sweep_once(&deps, Duration::minutes(30), later).await;
    assert_eq!(reaped, 1);
    assert!(provider.get_instance(&id).await.is_err());
}

#[tokio::test]
async fn sub_minute_runtime_emits_no_sample() {
    let provider = Arc::new(FakeProvider::new());
    let deps = deps_with(provider.clone());
    let now = Utc::now();

    let id = create_org_instance(&provider, "org-c").await;
    deps.heartbeats
        .record_at(&id, now - Duration::minutes(45))
        .await;
    // The run started 30 seconds ago (e.g. re-created after a restart).
    deps.starts.record(&id, now - Duration::seconds(30)).await;

    let reaped = sweep_once(&deps, Duration::minutes(30), now).await;
    assert_eq!(reaped, 1);
    assert_eq!(deps.metering.queue_len().await, 0);
}
