//! Billing: usage samples, quota accounting, metering, and budget alerts.
//!
//! The flow is one-directional: lifecycle events emit [`UsageSample`]s into
//! the [`meter::MeteringService`] queue; flushes aggregate them, submit to
//! the external meter, and feed the resulting hours into the
//! [`quota::QuotaEngine`]; the [`alerts`] service reads quota state and
//! emails threshold warnings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub mod alerts;
pub mod meter;
pub mod polar;
pub mod quota;

/// Tier → price in cents per hour, used by usage aggregation.
pub const TIER_PRICES_CENTS: [(&str, f64); 4] = [
    ("small", 8.3),
    ("medium", 16.7),
    ("large", 33.3),
    ("gpu", 208.0),
];

/// Hourly price in cents for a tier. Unknown tiers price at zero.
pub fn tier_price_cents(tier: &str) -> f64 {
    TIER_PRICES_CENTS
        .iter()
        .find(|(name, _)| *name == tier)
        .map(|(_, price)| *price)
        .unwrap_or(0.0)
}

/// Immutable runtime sample emitted when an instance leaves `Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    /// Org the runtime is accounted against.
    pub org_id: String,
    /// External billing customer id.
    pub customer_id: String,
    /// Whole minutes of runtime. Samples that round to zero are not
    /// emitted.
    pub minutes: u64,
    /// Tier label of the instance.
    pub tier: String,
    /// Wall-clock time the sample was taken.
    pub timestamp: DateTime<Utc>,
}

/// Start times of currently running instances, for usage recording.
///
/// One mutex; writers are the create handler and the usage recorder.
#[derive(Default)]
pub struct InstanceStarts {
    starts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InstanceStarts {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of an instance's current run.
    pub async fn record(&self, instance_id: &str, at: DateTime<Utc>) {
        self.starts.lock().await.insert(instance_id.to_owned(), at);
    }

    /// Remove and return the start of an instance's run, when known.
    ///
    /// Callers fall back to the instance's `created_at` when the start was
    /// lost (process restart).
    pub async fn take(&self, instance_id: &str) -> Option<DateTime<Utc>> {
        self.starts.lock().await.remove(instance_id)
    }

    /// Peek the start of an instance's run without consuming it.
    pub async fn get(&self, instance_id: &str) -> Option<DateTime<Utc>> {
        self.starts.lock().await.get(instance_id).copied()
    }
}

/// Whole minutes between `start` and `end`, clamped at zero.
pub fn runtime_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    let minutes = end.signed_duration_since(start).num_minutes();
    u64::try_from(minutes).unwrap_or(0)
}

/// Emit the final usage sample for an instance leaving `Running`.
///
/// Shared by the delete handler, the idle reaper, and throttle pauses.
/// The run start falls back to the instance's `created_at` when the
/// in-memory start was lost; runtimes that round to zero minutes emit
/// nothing.
pub async fn record_instance_usage(
    metering: &meter::MeteringService,
    quota: &quota::QuotaEngine,
    starts: &InstanceStarts,
    instance: &crate::provider::Instance,
    now: DateTime<Utc>,
) {
    let Some(org_id) = instance.org_id() else {
        return;
    };

    let start = starts
        .take(&instance.id)
        .await
        .unwrap_or(instance.created_at);
    let minutes = runtime_minutes(start, now);
    if minutes == 0 {
        return;
    }

    let customer_id = quota
        .customer_id_for(org_id)
        .await
        .unwrap_or_else(|| org_id.to_owned());
    metering
        .record_usage(org_id, &customer_id, minutes, &instance.tier)
        .await;
}
