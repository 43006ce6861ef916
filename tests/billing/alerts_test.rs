//! Budget alerts: thresholds, once-per-period replay protection, re-arming.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use orzbob::auth::users::UserStore;
use orzbob::billing::alerts::BudgetAlertService;
use orzbob::billing::quota::QuotaEngine;

use super::support::{FakeMeter, RecordingSender};

fn at(rfc3339: &str) -> DateTime<Utc> {
    rfc3339.parse().expect("timestamp")
}

struct Fixture {
    quota: Arc<QuotaEngine>,
    sender: Arc<RecordingSender>,
    service: BudgetAlertService,
    org_id: String,
    _tmp: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().expect("tempdir");
    let users = Arc::new(UserStore::load(tmp.path().join("users.json")).expect("store"));
    let user = users
        .get_or_create(55, "alertee", "alertee@example.com")
        .await
        .expect("user");

    let quota = Arc::new(QuotaEngine::new(
        Some(FakeMeter::with_product("prod_free_tier")),
        None,
    ));
    let sender = RecordingSender::new();
    let service = BudgetAlertService::new(
        quota.clone(),
        users,
        sender.clone(),
        "https://orzbob.dev/account/plan".to_owned(),
    );

    Fixture {
        quota,
        sender,
        service,
        org_id: user.org_id,
        _tmp: tmp,
    }
}

#[tokio::test]
async fn fifty_percent_alert_fires_once_per_period() {
    let fx = fixture().await;
    let now = at("2026-03-10T12:00:00Z");

    // 5.5 of 10 included hours: 55%.
    fx.quota
        .record_usage_at(&fx.org_id, "cust-55", 5.5, now)
        .await;

    assert_eq!(fx.service.check_once(now).await, 1);
    let sent = fx.sender.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "alertee@example.com");
    assert_eq!(sent[0].1.threshold_percent, 50);

    // Re-checking the same period sends nothing new.
    assert_eq!(fx.service.check_once(now).await, 0);
}

#[tokio::test]
async fn ninety_percent_alert_is_independent_of_fifty() {
    let fx = fixture().await;
    let now = at("2026-03-10T12:00:00Z");

    fx.quota
        .record_usage_at(&fx.org_id, "cust-55", 5.5, now)
        .await;
    fx.service.check_once(now).await;

    fx.quota
        .record_usage_at(&fx.org_id, "cust-55", 4.0, now)
        .await;

    // 9.5 of 10: the 90% alert fires, the 50% one stays sent.
    assert_eq!(fx.service.check_once(now).await, 1);
    let sent = fx.sender.sent().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].1.threshold_percent, 90);
}

#[tokio::test]
async fn failed_delivery_is_retried_on_the_next_pass() {
    let fx = fixture().await;
    let now = at("2026-03-10T12:00:00Z");

    fx.quota
        .record_usage_at(&fx.org_id, "cust-55", 6.0, now)
        .await;

    fx.sender.set_fail(true).await;
    assert_eq!(fx.service.check_once(now).await, 0);
    assert!(fx.sender.sent().await.is_empty());

    fx.sender.set_fail(false).await;
    assert_eq!(fx.service.check_once(now).await, 1);
}

#[tokio::test]
async fn thresholds_rearm_after_the_month_rolls_over() {
    let fx = fixture().await;

    let march = at("2026-03-10T12:00:00Z");
    fx.quota
        .record_usage_at(&fx.org_id, "cust-55", 6.0, march)
        .await;
    assert_eq!(fx.service.check_once(march).await, 1);

    // New month, fresh usage crossing 50% again.
    let april = at("2026-04-05T12:00:00Z");
    fx.quota
        .record_usage_at(&fx.org_id, "cust-55", 7.0, april)
        .await;
    assert_eq!(fx.service.check_once(april).await, 1);

    let sent = fx.sender.sent().await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|(_, a)| a.threshold_percent == 50));
}

#[tokio::test]
async fn orgs_without_included_hours_never_alert() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let users = Arc::new(UserStore::load(tmp.path().join("users.json")).expect("store"));
    users
        .get_or_create(56, "freeloader", "free@example.com")
        .await
        .expect("user");

    let quota = Arc::new(QuotaEngine::new(
        Some(FakeMeter::with_product("prod_usage_only")),
        None,
    ));
    let sender = RecordingSender::new();
    let service = BudgetAlertService::new(
        quota.clone(),
        users,
        sender.clone(),
        "https://orzbob.dev/account/plan".to_owned(),
    );

    let now = at("2026-03-10T12:00:00Z");
    quota.record_usage_at("org-gh-56", "cust-56", 100.0, now).await;

    assert_eq!(service.check_once(now).await, 0);
    assert!(sender.sent().await.is_empty());
}
