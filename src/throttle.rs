//! Runtime throttling: continuous-run, per-org daily, and idle limits.
//!
//! Each registered instance carries a tracker (run start, last activity,
//! day start); each org accumulates per-UTC-day runtime. A background tick
//! evaluates every not-paused tracker against the limits and pauses
//! violators through an injected [`PauseHandler`], invoked outside the
//! state lock. Evaluation runs against a snapshot, so enforcement is
//! "pause at the next tick", not immediate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::ThrottleConfig;

/// Why an instance was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// Continuous run exceeded the limit.
    ContinuousLimit,
    /// No activity within the idle window.
    Idle,
    /// The org's daily runtime cap was reached.
    DailyLimit,
}

impl PauseReason {
    /// Stable string form used in logs and status payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContinuousLimit => "continuous_limit",
            Self::Idle => "idle",
            Self::DailyLimit => "daily_limit",
        }
    }

    /// Human-readable resume hint for this reason.
    pub fn resume_hint(self) -> &'static str {
        match self {
            Self::ContinuousLimit => "resumes after a break",
            Self::Idle => "resumes anytime",
            Self::DailyLimit => "resumes tomorrow",
        }
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Carries out the actual pause when a limit trips.
///
/// Invoked outside the throttle lock. An error reverts the paused flag so
/// the next tick retries.
#[async_trait]
pub trait PauseHandler: Send + Sync {
    /// Pause the given instance.
    async fn pause(&self, instance_id: &str, reason: PauseReason) -> anyhow::Result<()>;
}

/// Throttle limits, converted once from config.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleLimits {
    /// Maximum continuous run.
    pub continuous: Duration,
    /// Maximum accumulated per-org runtime per UTC day.
    pub daily: Duration,
    /// Maximum gap since last activity.
    pub idle: Duration,
}

impl ThrottleLimits {
    /// Build limits from the config section.
    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            continuous: Duration::hours(i64::try_from(config.continuous_limit_hours).unwrap_or(8)),
            daily: Duration::hours(i64::try_from(config.daily_limit_hours).unwrap_or(24)),
            idle: Duration::minutes(i64::try_from(config.idle_timeout_mins).unwrap_or(30)),
        }
    }
}

/// Pause state reported for one instance.
#[derive(Debug, Clone)]
pub struct InstanceThrottleStatus {
    /// Whether the instance is currently paused.
    pub paused: bool,
    /// Reason for the pause, when paused.
    pub reason: Option<PauseReason>,
    /// Human-readable resume hint, when paused.
    pub resume_hint: Option<&'static str>,
    /// Whether the instance may resume now. `false` only for daily-limit
    /// pauses until the UTC day rolls over.
    pub can_resume: bool,
}

/// Per-instance runtime tracking state.
#[derive(Debug, Clone)]
struct Tracker {
    org_id: String,
    start: DateTime<Utc>,
    last_active: DateTime<Utc>,
    day_start: DateTime<Utc>,
    paused: bool,
    pause_reason: Option<PauseReason>,
    paused_on: Option<NaiveDate>,
}

#[derive(Default)]
struct ThrottleState {
    trackers: HashMap<String, Tracker>,
    daily: HashMap<(String, NaiveDate), Duration>,
}

/// Per-instance continuous-run, per-org daily, and per-instance idle
/// enforcement.
pub struct ThrottleService {
    state: Mutex<ThrottleState>,
    limits: ThrottleLimits,
    pause_handler: Option<Arc<dyn PauseHandler>>,
}

impl ThrottleService {
    /// Create a throttle service.
    ///
    /// Without a pause handler, trips mark trackers paused but perform no
    /// external action (a deliberate no-op, used in tests).
    pub fn new(limits: ThrottleLimits, pause_handler: Option<Arc<dyn PauseHandler>>) -> Self {
        Self {
            state: Mutex::new(ThrottleState::default()),
            limits,
            pause_handler,
        }
    }

    /// The configured limits.
    pub fn limits(&self) -> ThrottleLimits {
        self.limits
    }

    /// Start tracking an instance for the given org.
    pub async fn register_instance(&self, instance_id: &str, org_id: &str) {
        self.register_instance_at(instance_id, org_id, Utc::now())
            .await;
    }

    /// Start tracking with an explicit clock (tests).
    pub async fn register_instance_at(
        &self,
        instance_id: &str,
        org_id: &str,
        now: DateTime<Utc>,
    ) {
        let tracker = Tracker {
            org_id: org_id.to_owned(),
            start: now,
            last_active: now,
            day_start: now,
            paused: false,
            pause_reason: None,
            paused_on: None,
        };
        self.state
            .lock()
            .await
            .trackers
            .insert(instance_id.to_owned(), tracker);
    }

    /// Stop tracking an instance, crediting its accrued runtime to the
    /// org's daily bucket.
    pub async fn unregister_instance(&self, instance_id: &str) {
        self.unregister_instance_at(instance_id, Utc::now()).await;
    }

    /// Stop tracking with an explicit clock (tests).
    pub async fn unregister_instance_at(&self, instance_id: &str, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(tracker) = state.trackers.remove(instance_id) {
            if !tracker.paused {
                let accrued = now.signed_duration_since(tracker.day_start);
                if accrued > Duration::zero() {
                    credit_daily(&mut state.daily, &tracker.org_id, now.date_naive(), accrued);
                }
            }
        }
    }

    /// Advance an instance's last-active time to now.
    pub async fn record_activity(&self, instance_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(tracker) = state.trackers.get_mut(instance_id) {
            tracker.last_active = Utc::now();
        }
    }

    /// Pause state for one instance, when tracked.
    pub async fn get_instance_status(&self, instance_id: &str) -> Option<InstanceThrottleStatus> {
        self.get_instance_status_at(instance_id, Utc::now()).await
    }

    /// Pause state with an explicit clock (tests).
    pub async fn get_instance_status_at(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Option<InstanceThrottleStatus> {
        let state = self.state.lock().await;
        let tracker = state.trackers.get(instance_id)?;

        let can_resume = match (tracker.paused, tracker.pause_reason) {
            (false, _) => true,
            (true, Some(PauseReason::DailyLimit)) => tracker
                .paused_on
                .is_none_or(|paused_on| now.date_naive() > paused_on),
            (true, _) => true,
        };

        Some(InstanceThrottleStatus {
            paused: tracker.paused,
            reason: tracker.pause_reason,
            resume_hint: tracker.pause_reason.map(PauseReason::resume_hint),
            can_resume,
        })
    }

    /// Accumulated runtime for an org on a given UTC date, including the
    /// in-flight runtime of currently tracked instances.
    pub async fn get_org_daily_usage(&self, org_id: &str, date: NaiveDate) -> Duration {
        self.get_org_daily_usage_at(org_id, date, Utc::now()).await
    }

    /// Accumulated runtime with an explicit clock (tests).
    pub async fn get_org_daily_usage_at(
        &self,
        org_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Duration {
        let state = self.state.lock().await;
        let mut total = state
            .daily
            .get(&(org_id.to_owned(), date))
            .copied()
            .unwrap_or_else(Duration::zero);

        if now.date_naive() == date {
            for tracker in state.trackers.values() {
                if tracker.org_id == org_id && !tracker.paused {
                    let accrued = now.signed_duration_since(tracker.day_start);
                    if accrued > Duration::zero() {
                        total = total
                            .checked_add(&accrued)
                            .unwrap_or(Duration::MAX);
                    }
                }
            }
        }
        total
    }

    /// Clear all per-day accumulation. Testing and manual resets only.
    pub async fn reset_daily_usage(&self) {
        self.state.lock().await.daily.clear();
    }

    /// Evaluate every not-paused tracker against the limits at `now`.
    ///
    /// Returns the instances paused this tick with their reasons.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Vec<(String, PauseReason)> {
        // Phase 1: snapshot and evaluate under the lock, rolling day
        // boundaries as we go.
        let candidates: Vec<(String, PauseReason)> = {
            let mut state = self.state.lock().await;
            let today = now.date_naive();

            // Roll trackers whose day_start belongs to a previous day:
            // credit the span up to midnight to the old bucket.
            let mut rollovers: Vec<(String, NaiveDate, Duration)> = Vec::new();
            for tracker in state.trackers.values_mut() {
                let day = tracker.day_start.date_naive();
                if day < today && !tracker.paused {
                    let midnight = day
                        .succ_opt()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .map(|naive| naive.and_utc());
                    if let Some(midnight) = midnight {
                        let span = midnight.signed_duration_since(tracker.day_start);
                        if span > Duration::zero() {
                            rollovers.push((tracker.org_id.clone(), day, span));
                        }
                        tracker.day_start = midnight;
                    }
                }
            }
            for (org_id, day, span) in rollovers {
                credit_daily(&mut state.daily, &org_id, day, span);
            }

            let daily = state.daily.clone();
            state
                .trackers
                .iter()
                .filter(|(_, t)| !t.paused)
                .filter_map(|(id, tracker)| {
                    let continuous = now.signed_duration_since(tracker.start);
                    if continuous > self.limits.continuous {
                        return Some((id.clone(), PauseReason::ContinuousLimit));
                    }

                    let idle = now.signed_duration_since(tracker.last_active);
                    if idle > self.limits.idle {
                        return Some((id.clone(), PauseReason::Idle));
                    }

                    let prior = daily
                        .get(&(tracker.org_id.clone(), today))
                        .copied()
                        .unwrap_or_else(Duration::zero);
                    let in_flight = now.signed_duration_since(tracker.day_start);
                    let total = prior.checked_add(&in_flight).unwrap_or(Duration::MAX);
                    if total > self.limits.daily {
                        return Some((id.clone(), PauseReason::DailyLimit));
                    }

                    None
                })
                .collect()
        };

        // Phase 2: mark paused and credit accrued runtime under the lock,
        // then invoke the callback outside it.
        let mut paused = Vec::with_capacity(candidates.len());
        for (instance_id, reason) in candidates {
            {
                let mut state = self.state.lock().await;
                let Some(tracker) = state.trackers.get(&instance_id).cloned() else {
                    continue; // Unregistered between phases.
                };
                let accrued = now.signed_duration_since(tracker.day_start);
                if accrued > Duration::zero() {
                    credit_daily(&mut state.daily, &tracker.org_id, now.date_naive(), accrued);
                }
                if let Some(tracker) = state.trackers.get_mut(&instance_id) {
                    tracker.paused = true;
                    tracker.pause_reason = Some(reason);
                    tracker.paused_on = Some(now.date_naive());
                    tracker.day_start = now;
                }
            }

            if let Some(handler) = &self.pause_handler {
                if let Err(e) = handler.pause(&instance_id, reason).await {
                    warn!(
                        instance_id = %instance_id,
                        reason = %reason,
                        error = %e,
                        "pause callback failed; will retry next tick"
                    );
                    let mut state = self.state.lock().await;
                    if let Some(tracker) = state.trackers.get_mut(&instance_id) {
                        tracker.paused = false;
                        tracker.pause_reason = None;
                        tracker.paused_on = None;
                    }
                    continue;
                }
            }

            info!(instance_id = %instance_id, reason = %reason, "instance paused");
            paused.push((instance_id, reason));
        }

        paused
    }

    /// Test hook: overwrite a tracker's start/last-active/day-start.
    #[doc(hidden)]
    pub async fn set_tracker_times_for_test(
        &self,
        instance_id: &str,
        start: DateTime<Utc>,
        last_active: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(tracker) = state.trackers.get_mut(instance_id) {
            tracker.start = start;
            tracker.last_active = last_active;
            tracker.day_start = day_start;
        }
    }
}

fn credit_daily(
    daily: &mut HashMap<(String, NaiveDate), Duration>,
    org_id: &str,
    day: NaiveDate,
    span: Duration,
) {
    let entry = daily
        .entry((org_id.to_owned(), day))
        .or_insert_with(Duration::zero);
    *entry = entry.checked_add(&span).unwrap_or(Duration::MAX);
}

/// Run the throttle background loop.
///
/// Ticks every `interval`; exits on the shutdown signal.
pub async fn run_throttle(
    service: Arc<ThrottleService>,
    interval: StdDuration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(StdDuration::from_secs(1)));
    info!(interval_secs = interval.as_secs(), "throttle service started");

    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = service.tick_once(Utc::now()).await;
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("throttle service shutting down");
                    break;
                }
            }
        }
    }
}
