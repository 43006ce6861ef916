//! Throttle limit evaluation, pause callbacks, and daily accounting.
//!
//! All tests drive the service with explicit clocks so they are stable
//! regardless of when they run.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use orzbob::throttle::{PauseHandler, PauseReason, ThrottleLimits, ThrottleService};

/// Records pause calls; optionally fails them.
struct RecordingHandler {
    calls: Mutex<Vec<(String, PauseReason)>>,
    fail: Mutex<bool>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        })
    }

    async fn calls(&self) -> Vec<(String, PauseReason)> {
        self.calls.lock().await.clone()
    }

    async fn set_fail(&self, fail: bool) {
        *self.fail.lock().await = fail;
    }
}

#[async_trait]
impl PauseHandler for RecordingHandler {
    async fn pause(&self, instance_id: &str, reason: PauseReason) -> anyhow::Result<()> {
        if *self.fail.lock().await {
            anyhow::bail!("pause refused");
        }
        self.calls
            .lock()
            .await
            .push((instance_id.to_owned(), reason));
        Ok(())
    }
}

fn default_limits() -> ThrottleLimits {
    ThrottleLimits {
        continuous: Duration::hours(8),
        daily: Duration::hours(24),
        idle: Duration::minutes(30),
    }
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    rfc3339.parse().expect("timestamp")
}

#[tokio::test]
async fn continuous_limit_pauses_after_eight_hours() {
    let handler = RecordingHandler::new();
    let service = ThrottleService::new(default_limits(), Some(handler.clone()));

    let now = at("2026-06-15T12:00:00Z");
    service.register_instance_at("inst-1", "org-a", now).await;
    // Running since just over eight hours ago, recently active.
    service
        .set_tracker_times_for_test(
            "inst-1",
            now - Duration::hours(8) - Duration::seconds(1),
            now - Duration::minutes(1),
            now - Duration::hours(8) - Duration::seconds(1),
        )
        .await;

    let paused = service.tick_once(now).await;
    assert_eq!(
        paused,
        vec![("inst-1".to_owned(), PauseReason::ContinuousLimit)]
    );
    assert_eq!(
        handler.calls().await,
        vec![("inst-1".to_owned(), PauseReason::ContinuousLimit)]
    );

    let status = service
        .get_instance_status_at("inst-1", now)
        .await
        .expect("tracked");
    assert!(status.paused);
    assert_eq!(status.reason, Some(PauseReason::ContinuousLimit));
    assert_eq!(status.resume_hint, Some("resumes after a break"));
    assert!(status.can_resume);

    // A paused tracker is not evaluated again.
    let paused = service.tick_once(now + Duration::minutes(1)).await;
    assert!(paused.is_empty());
}

#[tokio::test]
async fn idle_pause_after_thirty_minutes_without_activity() {
    let handler = RecordingHandler::new();
    let service = ThrottleService::new(default_limits(), Some(handler.clone()));

    let now = at("2026-06-15T12:00:00Z");
    service.register_instance_at("inst-1", "org-a", now).await;
    service
        .set_tracker_times_for_test(
            "inst-1",
            now - Duration::hours(1),
            now - Duration::minutes(31),
            now - Duration::hours(1),
        )
        .await;

    let paused = service.tick_once(now).await;
    assert_eq!(paused, vec![("inst-1".to_owned(), PauseReason::Idle)]);

    let status = service
        .get_instance_status_at("inst-1", now)
        .await
        .expect("tracked");
    assert_eq!(status.resume_hint, Some("resumes anytime"));
    assert!(status.can_resume);
}

#[tokio::test]
async fn recent_activity_defers_the_idle_pause() {
    let service = ThrottleService::new(default_limits(), None);

    let now = at("2026-06-15T12:00:00Z");
    service.register_instance_at("inst-1", "org-a", now).await;
    service
        .set_tracker_times_for_test(
            "inst-1",
            now - Duration::hours(1),
            now - Duration::minutes(10),
            now - Duration::hours(1),
        )
        .await;

    assert!(service.tick_once(now).await.is_empty());
}

#[tokio::test]
async fn daily_cap_counts_completed_and_in_flight_runtime() {
    let handler = RecordingHandler::new();
    let limits = ThrottleLimits {
        continuous: Duration::hours(48),
        daily: Duration::hours(10),
        idle: Duration::hours(2),
    };
    let service = ThrottleService::new(limits, Some(handler.clone()));

    let now = at("2026-06-15T12:00:00Z");

    // A finished run earlier today: 6 hours credited at unregister.
    service
        .register_instance_at("inst-done", "org-a", at("2026-06-15T01:00:00Z"))
        .await;
    service
        .unregister_instance_at("inst-done", at("2026-06-15T07:00:00Z"))
        .await;
    assert_eq!(
        service
            .get_org_daily_usage_at("org-a", now.date_naive(), now)
            .await,
        Duration::hours(6)
    );

    // A live run with 4.5 in-flight hours pushes the org past 10.
    service
        .register_instance_at("inst-live", "org-a", at("2026-06-15T07:30:00Z"))
        .await;
    service
        .set_tracker_times_for_test(
            "inst-live",
            at("2026-06-15T07:30:00Z"),
            now - Duration::minutes(5),
            at("2026-06-15T07:30:00Z"),
        )
        .await;

    let paused = service.tick_once(now).await;
    assert_eq!(
        paused,
        vec![("inst-live".to_owned(), PauseReason::DailyLimit)]
    );

    let status = service
        .get_instance_status_at("inst-live", now)
        .await
        .expect("tracked");
    assert_eq!(status.resume_hint, Some("resumes tomorrow"));
    assert!(!status.can_resume);

    // The day rolls over: resumable again.
    let tomorrow = at("2026-06-16T00:05:00Z");
    let status = service
        .get_instance_status_at("inst-live", tomorrow)
        .await
        .expect("tracked");
    assert!(!status.paused || status.can_resume);
}

#[tokio::test]
async fn failed_pause_callback_reverts_and_retries_next_tick() {
    let handler = RecordingHandler::new();
    let service = ThrottleService::new(default_limits(), Some(handler.clone()));

    let now = at("2026-06-15T12:00:00Z");
    service.register_instance_at("inst-1", "org-a", now).await;
    service
        .set_tracker_times_for_test(
            "inst-1",
            now - Duration::hours(9),
            now - Duration::minutes(1),
            now - Duration::hours(9),
        )
        .await;

    handler.set_fail(true).await;
    let paused = service.tick_once(now).await;
    assert!(paused.is_empty());

    let status = service
        .get_instance_status_at("inst-1", now)
        .await
        .expect("tracked");
    assert!(!status.paused, "failed callback must revert the flag");

    handler.set_fail(false).await;
    let paused = service.tick_once(now + Duration::minutes(1)).await;
    assert_eq!(paused.len(), 1);
}

#[tokio::test]
async fn pause_credits_accrued_runtime_to_the_daily_bucket() {
    let service = ThrottleService::new(default_limits(), None);

    let now = at("2026-06-15T12:00:00Z");
    service.register_instance_at("inst-1", "org-a", now).await;
    service
        .set_tracker_times_for_test(
            "inst-1",
            now - Duration::hours(9),
            now - Duration::minutes(1),
            now - Duration::hours(9),
        )
        .await;

    service.tick_once(now).await;

    assert_eq!(
        service
            .get_org_daily_usage_at("org-a", now.date_naive(), now)
            .await,
        Duration::hours(9)
    );
}

#[tokio::test]
async fn reset_daily_usage_clears_buckets() {
    let service = ThrottleService::new(default_limits(), None);

    let now = at("2026-06-15T12:00:00Z");
    service
        .register_instance_at("inst-1", "org-a", now - Duration::hours(2))
        .await;
    service.unregister_instance_at("inst-1", now).await;
    assert!(
        service
            .get_org_daily_usage_at("org-a", now.date_naive(), now)
            .await
            > Duration::zero()
    );

    service.reset_daily_usage().await;
    assert_eq!(
        service
            .get_org_daily_usage_at("org-a", now.date_naive(), now)
            .await,
        Duration::zero()
    );
}
