//! Budget alerts: email warnings at 50% and 90% of included hours.
//!
//! A background pass reads every org's usage status from the quota engine
//! and sends at most one email per (org, threshold) per billing period.
//! Replay is detected by comparing the recorded sent-at timestamp against
//! the start of the current period (reset date minus one month); when the
//! reset date advances past a recorded sent-at, the threshold re-arms
//! automatically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::auth::users::UserStore;
use crate::email::{BudgetAlert, EmailSender};

use super::quota::QuotaEngine;

/// Alert thresholds, as percentages of included hours.
const THRESHOLDS: [u8; 2] = [50, 90];

/// Periodic 50%/90% budget alert checker.
pub struct BudgetAlertService {
    quota: Arc<QuotaEngine>,
    users: Arc<UserStore>,
    sender: Arc<dyn EmailSender>,
    plan_url: String,
    sent: Mutex<HashMap<(String, u8), DateTime<Utc>>>,
}

impl BudgetAlertService {
    /// Create the alert service.
    pub fn new(
        quota: Arc<QuotaEngine>,
        users: Arc<UserStore>,
        sender: Arc<dyn EmailSender>,
        plan_url: String,
    ) -> Self {
        Self {
            quota,
            users,
            sender,
            plan_url,
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate every known org once at wall-clock `now`.
    ///
    /// Returns the number of alerts sent.
    pub async fn check_once(&self, now: DateTime<Utc>) -> usize {
        let mut sent_count = 0_usize;

        for org_id in self.quota.orgs().await {
            let Some(status) = self.quota.get_usage_status_at(&org_id, now).await else {
                continue;
            };
            if status.included_hours <= 0.0 {
                continue;
            }

            for threshold in THRESHOLDS {
                if status.percent_used < f64::from(threshold) {
                    continue;
                }
                if self
                    .already_sent(&org_id, threshold, status.reset_date)
                    .await
                {
                    continue;
                }

                let Some(user) = self.users.find_by_org(&org_id).await else {
                    warn!(org_id = %org_id, "no user for org; skipping budget alert");
                    continue;
                };

                let alert = BudgetAlert {
                    org_id: org_id.clone(),
                    threshold_percent: threshold,
                    used_hours: status.used_hours,
                    included_hours: status.included_hours,
                    reset_date: status.reset_date,
                    plan_url: self.plan_url.clone(),
                };

                match self.sender.send_budget_alert(&user.email, &alert).await {
                    Ok(()) => {
                        // Only a successful send is recorded, so failures
                        // retry on the next pass.
                        self.sent
                            .lock()
                            .await
                            .insert((org_id.clone(), threshold), now);
                        info!(
                            org_id = %org_id,
                            threshold,
                            percent_used = status.percent_used,
                            "budget alert sent"
                        );
                        sent_count = sent_count.saturating_add(1);
                    }
                    Err(e) => {
                        warn!(org_id = %org_id, threshold, error = %e, "budget alert failed");
                    }
                }
            }
        }

        sent_count
    }

    /// Whether an alert for (org, threshold) already went out this period.
    async fn already_sent(&self, org_id: &str, threshold: u8, reset_date: NaiveDate) -> bool {
        let sent = self.sent.lock().await;
        let Some(sent_at) = sent.get(&(org_id.to_owned(), threshold)) else {
            return false;
        };
        let period_start = previous_month(reset_date);
        sent_at.date_naive() >= period_start
    }
}

/// The reset date minus one month: the start of the current period.
fn previous_month(reset_date: NaiveDate) -> NaiveDate {
    let (year, month) = if reset_date.month() == 1 {
        (reset_date.year().saturating_sub(1), 12)
    } else {
        (reset_date.year(), reset_date.month().saturating_sub(1))
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(reset_date)
}

/// Run the budget alert background loop.
pub async fn run_alerts(
    service: Arc<BudgetAlertService>,
    interval: StdDuration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(StdDuration::from_secs(1)));
    info!(interval_secs = interval.as_secs(), "budget alert service started");

    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = service.check_once(Utc::now()).await;
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("budget alert service shutting down");
                    break;
                }
            }
        }
    }
}
