//! Prometheus metrics for the control plane.
//!
//! One [`Metrics`] value owns the registry and every instrument; services
//! receive a clone (instruments are internally reference counted).

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Control-plane metric instruments backed by a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Usage samples currently queued for the next metering flush.
    pub metering_queue_depth: IntGauge,
    /// Completed metering flushes.
    pub metering_flushes: IntCounter,
    /// Metering flushes that failed and dropped their batch.
    pub metering_flush_errors: IntCounter,
    /// Aggregated usage records submitted to the external meter.
    pub metering_records_submitted: IntCounter,
    /// Instances reaped for missing heartbeats.
    pub instances_reaped: IntCounter,
    /// Instances paused by the throttle service.
    pub instances_paused: IntCounter,
}

impl Metrics {
    /// Create and register all control-plane instruments.
    ///
    /// # Errors
    ///
    /// Returns an error if an instrument cannot be registered (duplicate
    /// names within one registry).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let metering_queue_depth = IntGauge::new(
            "orzbob_metering_queue_depth",
            "Usage samples queued for the next metering flush",
        )?;
        let metering_flushes = IntCounter::new(
            "orzbob_metering_flushes_total",
            "Completed metering flushes",
        )?;
        let metering_flush_errors = IntCounter::new(
            "orzbob_metering_flush_errors_total",
            "Metering flushes that failed and dropped their batch",
        )?;
        let metering_records_submitted = IntCounter::new(
            "orzbob_metering_records_submitted_total",
            "Aggregated usage records submitted to the external meter",
        )?;
        let instances_reaped = IntCounter::new(
            "orzbob_instances_reaped_total",
            "Instances deleted for missing heartbeats",
        )?;
        let instances_paused = IntCounter::new(
            "orzbob_instances_paused_total",
            "Instances paused by the throttle service",
        )?;

        registry.register(Box::new(metering_queue_depth.clone()))?;
        registry.register(Box::new(metering_flushes.clone()))?;
        registry.register(Box::new(metering_flush_errors.clone()))?;
        registry.register(Box::new(metering_records_submitted.clone()))?;
        registry.register(Box::new(instances_reaped.clone()))?;
        registry.register(Box::new(instances_paused.clone()))?;

        Ok(Self {
            registry,
            metering_queue_depth,
            metering_flushes,
            metering_flush_errors,
            metering_records_submitted,
            instances_reaped,
            instances_paused,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
