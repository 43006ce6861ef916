//! Heartbeat registry and the idle reaper.
//!
//! The in-sandbox agent pings `/v1/instances/{id}/heartbeat`; the registry
//! maps instance id → last-observed time under a readers-writer lock. The
//! reaper runs as a background Tokio task, ticking once a minute: it takes
//! a snapshot (never iterating under the write lock), falls back to the
//! instance's creation time when no heartbeat was ever seen, and deletes
//! instances idle past the timeout — recording a final usage sample first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

use crate::billing::meter::MeteringService;
use crate::billing::quota::{InstanceQuota, QuotaEngine};
use crate::billing::{record_instance_usage, InstanceStarts};
use crate::config::ReaperConfig;
use crate::metrics::Metrics;
use crate::provider::Provider;
use crate::throttle::ThrottleService;

/// Last-observed heartbeat per instance, guarded by a single RW lock.
#[derive(Default)]
pub struct HeartbeatRegistry {
    beats: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl HeartbeatRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat for an instance at the current wall-clock time.
    pub async fn record(&self, instance_id: &str) {
        self.record_at(instance_id, Utc::now()).await;
    }

    /// Record a heartbeat at an explicit time (tests, backfills).
    pub async fn record_at(&self, instance_id: &str, at: DateTime<Utc>) {
        self.beats.write().await.insert(instance_id.to_owned(), at);
    }

    /// Copy of all (instance id, last heartbeat) pairs.
    ///
    /// Reapers iterate the copy so provider deletion never happens inside
    /// the critical section.
    pub async fn snapshot(&self) -> Vec<(String, DateTime<Utc>)> {
        self.beats
            .read()
            .await
            .iter()
            .map(|(id, at)| (id.clone(), *at))
            .collect()
    }

    /// Last heartbeat for one instance.
    pub async fn last_seen(&self, instance_id: &str) -> Option<DateTime<Utc>> {
        self.beats.read().await.get(instance_id).copied()
    }

    /// Forget an instance (deleted or reaped).
    pub async fn remove(&self, instance_id: &str) {
        self.beats.write().await.remove(instance_id);
    }
}

/// Shared dependencies for the reaper loop.
pub struct ReaperDeps {
    /// Sandbox provider used for listing and deletion.
    pub provider: Arc<dyn Provider>,
    /// Heartbeat registry consulted for last activity.
    pub heartbeats: Arc<HeartbeatRegistry>,
    /// Metering queue receiving final usage samples.
    pub metering: Arc<MeteringService>,
    /// Quota engine, for customer-id resolution on samples.
    pub quota: Arc<QuotaEngine>,
    /// Start times for runtime computation.
    pub starts: Arc<InstanceStarts>,
    /// Per-org live-instance admission counts.
    pub instance_quota: Arc<InstanceQuota>,
    /// Throttle service to unregister reaped instances from.
    pub throttle: Arc<ThrottleService>,
    /// Metric instruments.
    pub metrics: Metrics,
}

/// Run the idle reaper background loop.
///
/// Ticks every `config.interval_secs`. Exits when the shutdown signal is
/// received or the watch channel closes.
pub async fn run_reaper(
    deps: ReaperDeps,
    config: ReaperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let idle_timeout = chrono::Duration::minutes(i64::try_from(config.idle_timeout_mins).unwrap_or(30));
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    info!(
        idle_timeout_mins = config.idle_timeout_mins,
        interval_secs = config.interval_secs,
        "idle reaper started"
    );

    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let reaped = sweep_once(&deps, idle_timeout, Utc::now()).await;
                if reaped > 0 {
                    info!(reaped, "idle sweep complete");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("idle reaper shutting down");
                    break;
                }
            }
        }
    }
}

/// Execute a single reaper sweep at wall-clock `now`.
///
/// Returns the number of instances deleted.
pub async fn sweep_once(
    deps: &ReaperDeps,
    idle_timeout: chrono::Duration,
    now: DateTime<Utc>,
) -> usize {
    let instances = match deps.provider.list_instances().await {
        Ok(instances) => instances,
        Err(e) => {
            warn!(error = %e, "reaper could not list instances");
            return 0;
        }
    };

    let beats: HashMap<String, DateTime<Utc>> =
        deps.heartbeats.snapshot().await.into_iter().collect();

    let mut reaped = 0_usize;
    for instance in instances {
        // Never heartbeated: age from creation.
        let last_seen = beats
            .get(&instance.id)
            .copied()
            .unwrap_or(instance.created_at);
        if now.signed_duration_since(last_seen) <= idle_timeout {
            continue;
        }

        info!(
            instance_id = %instance.id,
            last_seen = %last_seen,
            "reaping idle instance"
        );

        // Record usage before deletion so the runtime is not lost if the
        // provider call fails and the instance lingers another tick.
        record_instance_usage(&deps.metering, &deps.quota, &deps.starts, &instance, now).await;

        if let Err(e) = deps.provider.delete_instance(&instance.id).await {
            error!(instance_id = %instance.id, error = %e, "failed to reap instance");
            continue;
        }

        deps.heartbeats.remove(&instance.id).await;
        deps.throttle.unregister_instance(&instance.id).await;
        if let Some(org_id) = instance.org_id() {
            deps.instance_quota.release(org_id).await;
        }
        deps.metrics.instances_reaped.inc();
        reaped = reaped.saturating_add(1);
    }

    reaped
}
