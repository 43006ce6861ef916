//! Per-org quota accounting: live-instance admission and monthly hours.
//!
//! [`InstanceQuota`] serializes read-check-increment admission under one
//! mutex; the only tolerated overshoot is the optimistic increment that a
//! failed provider create compensates with a decrement.
//!
//! [`QuotaEngine`] accumulates metered hours per org against the hours
//! included with the org's subscription product, resetting exactly once
//! when the calendar month rolls over (UTC). The full map can be
//! snapshotted to a JSON file with an atomic rename, and loaded on start.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::polar::BillingMeter;

/// Hours bundled with each known product.
fn included_hours_for_product(product_id: &str) -> f64 {
    match product_id {
        "prod_free_tier" => 10.0,
        "prod_base_plus_usage" => 200.0,
        "prod_usage_only" => 0.0,
        _ => 0.0,
    }
}

/// Errors produced by instance admission.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The org is at its live-instance cap.
    #[error("Quota exceeded: maximum {limit} instances allowed for free tier")]
    Exceeded {
        /// Configured per-org cap.
        limit: u32,
    },
}

/// Live-instance counts per org, with a fixed admission cap.
pub struct InstanceQuota {
    max_per_org: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl InstanceQuota {
    /// Create with the given per-org cap.
    pub fn new(max_per_org: u32) -> Self {
        Self {
            max_per_org,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// The configured per-org cap.
    pub fn limit(&self) -> u32 {
        self.max_per_org
    }

    /// Admit one instance for the org, or fail when at the cap.
    ///
    /// Read-check-increment is serialized under the lock, so admission for
    /// a single org is linearizable. Callers must [`release`](Self::release)
    /// on any post-admission failure.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] at the cap.
    pub async fn try_acquire(&self, org_id: &str) -> Result<(), QuotaError> {
        let mut counts = self.counts.lock().await;
        let count = counts.entry(org_id.to_owned()).or_insert(0);
        if *count >= self.max_per_org {
            return Err(QuotaError::Exceeded {
                limit: self.max_per_org,
            });
        }
        *count = count.saturating_add(1);
        Ok(())
    }

    /// Release one instance slot for the org. Saturates at zero.
    pub async fn release(&self, org_id: &str) {
        let mut counts = self.counts.lock().await;
        if let Some(count) = counts.get_mut(org_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Current live count for the org.
    pub async fn count(&self, org_id: &str) -> u32 {
        self.counts.lock().await.get(org_id).copied().unwrap_or(0)
    }
}

/// One org's usage state for the current billing period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgUsage {
    /// External billing customer id.
    pub customer_id: String,
    /// Subscription product, once resolved.
    pub product_id: Option<String>,
    /// Hours bundled with the product.
    pub included_hours: f64,
    /// Hours consumed this period. Monotonically non-decreasing until the
    /// month rolls over.
    pub used_hours: f64,
    /// First UTC day of the current billing period.
    pub period_start: NaiveDate,
    /// Whether used has crossed included.
    pub in_overage: bool,
    /// Last mutation time.
    pub last_updated: DateTime<Utc>,
}

/// Usage status reported to clients and the alert service.
#[derive(Debug, Clone, Serialize)]
pub struct UsageStatus {
    /// Hours bundled with the subscription.
    pub included_hours: f64,
    /// Hours consumed this period.
    pub used_hours: f64,
    /// Hours remaining, clamped at zero.
    pub remaining_hours: f64,
    /// Whether the org is past its included hours.
    pub in_overage: bool,
    /// Used as a percentage of included (0 when nothing is included).
    pub percent_used: f64,
    /// First day of the next billing period (UTC).
    pub reset_date: NaiveDate,
}

/// Per-org monthly usage accounting and included-hours enforcement.
pub struct QuotaEngine {
    state: Mutex<HashMap<String, OrgUsage>>,
    meter: Option<Arc<dyn BillingMeter>>,
    snapshot_path: Option<PathBuf>,
}

impl QuotaEngine {
    /// Create an engine, loading the snapshot file when it exists.
    ///
    /// A `None` snapshot path keeps the engine memory-only.
    pub fn new(meter: Option<Arc<dyn BillingMeter>>, snapshot_path: Option<PathBuf>) -> Self {
        let state = snapshot_path
            .as_deref()
            .and_then(load_snapshot)
            .unwrap_or_default();

        Self {
            state: Mutex::new(state),
            meter,
            snapshot_path,
        }
    }

    /// Record metered hours for an org.
    ///
    /// Rolls the billing period first when it is stale (zeroing used hours
    /// exactly once), resolves the subscription product on first contact
    /// when a meter client is configured, then accumulates.
    pub async fn record_usage(&self, org_id: &str, customer_id: &str, hours: f64) {
        self.record_usage_at(org_id, customer_id, hours, Utc::now())
            .await;
    }

    /// [`record_usage`](Self::record_usage) with an explicit clock (tests).
    pub async fn record_usage_at(
        &self,
        org_id: &str,
        customer_id: &str,
        hours: f64,
        now: DateTime<Utc>,
    ) {
        let month_start = first_of_month(now);

        // Resolve product info outside the lock; the meter call may block
        // for up to its 30-second timeout.
        let needs_product = {
            let state = self.state.lock().await;
            state
                .get(org_id)
                .map(|usage| usage.product_id.is_none())
                .unwrap_or(true)
        };
        let resolved_product = if needs_product {
            match &self.meter {
                Some(meter) => match meter.subscription_product(customer_id).await {
                    Ok(product) => product,
                    Err(e) => {
                        warn!(org_id, error = %e, "subscription lookup failed");
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let mut state = self.state.lock().await;
        let usage = state.entry(org_id.to_owned()).or_insert_with(|| OrgUsage {
            customer_id: customer_id.to_owned(),
            product_id: None,
            included_hours: 0.0,
            used_hours: 0.0,
            period_start: month_start,
            in_overage: false,
            last_updated: now,
        });

        // Stale period: zero out before accumulating so the new delta is
        // read against a fresh month.
        if usage.period_start < month_start {
            info!(org_id, period_start = %month_start, "billing period rolled over");
            usage.used_hours = 0.0;
            usage.in_overage = false;
            usage.period_start = month_start;
        }

        if let Some(product_id) = resolved_product {
            usage.included_hours = included_hours_for_product(&product_id);
            usage.product_id = Some(product_id);
        }

        usage.used_hours += hours;
        usage.in_overage = usage.used_hours > usage.included_hours;
        usage.last_updated = now;

        debug!(
            org_id,
            hours,
            used = usage.used_hours,
            included = usage.included_hours,
            "usage recorded"
        );
    }

    /// Usage status for one org, when known.
    pub async fn get_usage_status(&self, org_id: &str) -> Option<UsageStatus> {
        self.get_usage_status_at(org_id, Utc::now()).await
    }

    /// [`get_usage_status`](Self::get_usage_status) with an explicit clock.
    pub async fn get_usage_status_at(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Option<UsageStatus> {
        let state = self.state.lock().await;
        let usage = state.get(org_id)?;

        // A stale record reads as a fresh period even before the next
        // RecordUsage rolls it.
        let stale = usage.period_start < first_of_month(now);
        let used = if stale { 0.0 } else { usage.used_hours };
        let included = usage.included_hours;

        let percent_used = if included > 0.0 {
            (used / included) * 100.0
        } else {
            0.0
        };

        Some(UsageStatus {
            included_hours: included,
            used_hours: used,
            remaining_hours: (included - used).max(0.0),
            in_overage: if stale { false } else { usage.in_overage },
            percent_used,
            reset_date: first_of_next_month(now),
        })
    }

    /// External billing customer id for an org, when known.
    pub async fn customer_id_for(&self, org_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .get(org_id)
            .map(|usage| usage.customer_id.clone())
    }

    /// All orgs the engine has usage records for.
    pub async fn orgs(&self) -> Vec<String> {
        self.state.lock().await.keys().cloned().collect()
    }

    /// Write the full mapping to the snapshot file via atomic rename.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding or the filesystem write fails.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let rendered = {
            let state = self.state.lock().await;
            serde_json::to_string_pretty(&*state)?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, rendered)?;
        std::fs::rename(&tmp_path, path)?;

        debug!(path = %path.display(), "quota snapshot written");
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Option<HashMap<String, OrgUsage>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(state) => {
                info!(path = %path.display(), "quota snapshot loaded");
                Some(state)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable quota snapshot");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable quota snapshot");
            None
        }
    }
}

/// First UTC day of the month containing `now`.
pub fn first_of_month(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive().with_day(1).unwrap_or(now.date_naive())
}

/// First UTC day of the month after the one containing `now`.
pub fn first_of_next_month(now: DateTime<Utc>) -> NaiveDate {
    let date = now.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year().saturating_add(1), 1)
    } else {
        (date.year(), date.month().saturating_add(1))
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

/// Run the quota snapshot persister loop.
///
/// Writes every `interval`; failures are logged and retried next tick.
pub async fn run_persister(
    engine: Arc<QuotaEngine>,
    interval: StdDuration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(StdDuration::from_secs(1)));
    info!(interval_secs = interval.as_secs(), "quota persister started");

    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.persist().await {
                    warn!(error = %e, "quota snapshot failed; retrying next tick");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    if let Err(e) = engine.persist().await {
                        warn!(error = %e, "final quota snapshot failed");
                    }
                    info!("quota persister shutting down");
                    break;
                }
            }
        }
    }
}
