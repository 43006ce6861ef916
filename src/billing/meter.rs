//! Usage metering: batch samples in memory, flush aggregated hours.
//!
//! Samples accumulate in a locked queue and flush when any of three
//! triggers fires: the periodic ticker, a deferred per-sample deadline
//! (last sample + one interval), or an explicit flush at shutdown.
//!
//! Delivery is at-least-once on the queue side but at-most-once on the
//! network side: a failed flush drops its batch rather than retrying, so
//! meter outages lose samples instead of double-billing. The queue depth
//! and error counters are exported so operators can alarm on this.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

use super::polar::BillingMeter;
use super::quota::QuotaEngine;
use super::UsageSample;

/// Batching usage pipeline in front of the external billing meter.
pub struct MeteringService {
    queue: Mutex<Vec<UsageSample>>,
    last_sample: Mutex<Option<Instant>>,
    queue_changed: Notify,
    meter: Option<Arc<dyn BillingMeter>>,
    quota: Arc<QuotaEngine>,
    metrics: Metrics,
    flush_interval: StdDuration,
}

impl MeteringService {
    /// Create a metering service.
    ///
    /// Without a meter client, flushes skip the network submission and
    /// feed hours straight into the quota engine (local development).
    pub fn new(
        meter: Option<Arc<dyn BillingMeter>>,
        quota: Arc<QuotaEngine>,
        metrics: Metrics,
        flush_interval: StdDuration,
    ) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            last_sample: Mutex::new(None),
            queue_changed: Notify::new(),
            meter,
            quota,
            metrics,
            flush_interval,
        }
    }

    /// Queue a runtime sample. Zero-minute samples are dropped.
    pub async fn record_usage(&self, org_id: &str, customer_id: &str, minutes: u64, tier: &str) {
        if minutes == 0 {
            return;
        }

        let sample = UsageSample {
            org_id: org_id.to_owned(),
            customer_id: customer_id.to_owned(),
            minutes,
            tier: tier.to_owned(),
            timestamp: Utc::now(),
        };

        let depth = {
            let mut queue = self.queue.lock().await;
            queue.push(sample);
            queue.len()
        };
        *self.last_sample.lock().await = Some(Instant::now());
        self.metrics
            .metering_queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
        self.queue_changed.notify_one();

        debug!(org_id, minutes, tier, depth, "usage sample queued");
    }

    /// Samples currently queued.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain the queue, aggregate, and submit to the meter.
    ///
    /// Aggregation groups by (customer id, tier) and converts summed
    /// minutes to hours. One submission per group; on any submission
    /// error the remainder of the batch is dropped and the error counter
    /// incremented. Successfully submitted hours feed the quota engine so
    /// quotas reflect metered hours exactly.
    pub async fn flush(&self) {
        let batch: Vec<UsageSample> = {
            let mut queue = self.queue.lock().await;
            std::mem::take(&mut *queue)
        };
        self.metrics.metering_queue_depth.set(0);
        if batch.is_empty() {
            return;
        }

        // (customer_id, tier) → (minutes, org_id)
        let mut groups: HashMap<(String, String), (u64, String)> = HashMap::new();
        for sample in &batch {
            let entry = groups
                .entry((sample.customer_id.clone(), sample.tier.clone()))
                .or_insert((0, sample.org_id.clone()));
            entry.0 = entry.0.saturating_add(sample.minutes);
        }

        let now = Utc::now();
        let mut submitted = 0_u64;
        for ((customer_id, tier), (minutes, org_id)) in groups {
            let hours = minutes_to_hours(minutes);

            if let Some(meter) = &self.meter {
                if let Err(e) = meter
                    .record_usage(&customer_id, hours, &org_id, &tier, now)
                    .await
                {
                    warn!(
                        customer_id = %customer_id,
                        tier = %tier,
                        error = %e,
                        "meter submission failed; dropping batch"
                    );
                    self.metrics.metering_flush_errors.inc();
                    return;
                }
            }

            self.quota.record_usage(&org_id, &customer_id, hours).await;
            self.metrics.metering_records_submitted.inc();
            submitted = submitted.saturating_add(1);
        }

        self.metrics.metering_flushes.inc();
        info!(
            samples = batch.len(),
            records = submitted,
            "metering flush complete"
        );
    }

    /// Deadline for the deferred per-sample flush, when samples exist.
    async fn deferred_deadline(&self) -> Option<Instant> {
        let last = (*self.last_sample.lock().await)?;
        if self.queue.lock().await.is_empty() {
            return None;
        }
        Some(last.checked_add(self.flush_interval).unwrap_or(last))
    }
}

/// Whole minutes → fractional hours.
pub fn minutes_to_hours(minutes: u64) -> f64 {
    // Sample magnitudes keep this lossless in practice.
    #[allow(clippy::cast_precision_loss)]
    let m = minutes as f64;
    m / 60.0
}

/// Run the metering flush loop.
///
/// Flushes on the periodic ticker and on the per-sample deferred deadline;
/// issues one final flush on shutdown.
pub async fn run_flusher(service: Arc<MeteringService>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(service.flush_interval.max(StdDuration::from_secs(1)));
    info!(
        interval_secs = service.flush_interval.as_secs(),
        "metering flusher started"
    );

    ticker.tick().await;

    loop {
        let deadline = service.deferred_deadline().await;
        let deferred = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ticker.tick() => {
                service.flush().await;
            }
            () = deferred => {
                service.flush().await;
            }
            // A new sample re-arms the deferred deadline.
            _ = service.queue_changed.notified() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    service.flush().await;
                    info!("metering flusher shutting down");
                    break;
                }
            }
        }
    }
}
