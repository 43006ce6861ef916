//! Metering service: aggregation, flush triggers, and failure handling.

use std::sync::Arc;
use std::time::Duration;

use orzbob::billing::meter::MeteringService;
use orzbob::billing::quota::QuotaEngine;
use orzbob::metrics::Metrics;

use super::support::{FakeMeter, MeterCall};

fn service_with(meter: Arc<FakeMeter>) -> (Arc<MeteringService>, Arc<QuotaEngine>, Metrics) {
    let metrics = Metrics::new().expect("metrics");
    let quota = Arc::new(QuotaEngine::new(None, None));
    let service = Arc::new(MeteringService::new(
        Some(meter),
        quota.clone(),
        metrics.clone(),
        Duration::from_secs(60),
    ));
    (service, quota, metrics)
}

#[tokio::test]
async fn flush_aggregates_by_customer_and_tier() {
    let meter = FakeMeter::without_product();
    let (service, quota, metrics) = service_with(meter.clone());

    service.record_usage("org-x", "cust-x", 30, "small").await;
    service.record_usage("org-x", "cust-x", 45, "small").await;
    service.record_usage("org-x", "cust-x", 60, "small").await;
    service.record_usage("org-x", "cust-x", 90, "medium").await;
    assert_eq!(service.queue_len().await, 4);

    service.flush().await;

    let mut calls = meter.calls().await;
    calls.sort_by(|a, b| a.tier.cmp(&b.tier));
    assert_eq!(
        calls,
        vec![
            MeterCall {
                customer_id: "cust-x".to_owned(),
                hours: 1.5,
                tier: "medium".to_owned(),
            },
            MeterCall {
                customer_id: "cust-x".to_owned(),
                hours: 2.25,
                tier: "small".to_owned(),
            },
        ]
    );

    // Submitted hours landed in the quota engine (135 + 90 minutes).
    let status = quota.get_usage_status("org-x").await.expect("known org");
    assert_eq!(status.used_hours, 3.75);

    assert_eq!(service.queue_len().await, 0);
    assert_eq!(metrics.metering_records_submitted.get(), 2);
    assert_eq!(metrics.metering_flushes.get(), 1);
    assert_eq!(metrics.metering_flush_errors.get(), 0);
}

#[tokio::test]
async fn zero_minute_samples_are_dropped() {
    let meter = FakeMeter::without_product();
    let (service, _quota, _metrics) = service_with(meter);

    service.record_usage("org-x", "cust-x", 0, "small").await;
    assert_eq!(service.queue_len().await, 0);
}

#[tokio::test]
async fn failed_flush_drops_the_batch_and_counts_the_error() {
    let meter = FakeMeter::without_product();
    let (service, quota, metrics) = service_with(meter.clone());

    meter.set_fail(true).await;
    service.record_usage("org-x", "cust-x", 120, "large").await;
    service.flush().await;

    // At-most-once on the network side: the batch is gone, not retried.
    assert_eq!(service.queue_len().await, 0);
    assert!(meter.calls().await.is_empty());
    assert_eq!(metrics.metering_flush_errors.get(), 1);
    assert!(quota.get_usage_status("org-x").await.is_none());

    // Later samples flush normally.
    meter.set_fail(false).await;
    service.record_usage("org-x", "cust-x", 60, "large").await;
    service.flush().await;
    assert_eq!(meter.calls().await.len(), 1);
}

#[tokio::test]
async fn empty_flush_is_a_no_op() {
    let meter = FakeMeter::without_product();
    let (service, _quota, metrics) = service_with(meter);

    service.flush().await;
    assert_eq!(metrics.metering_flushes.get(), 0);
}

#[tokio::test]
async fn queue_depth_gauge_tracks_the_queue() {
    let meter = FakeMeter::without_product();
    let (service, _quota, metrics) = service_with(meter);

    service.record_usage("org-x", "cust-x", 5, "small").await;
    service.record_usage("org-y", "cust-y", 5, "small").await;
    assert_eq!(metrics.metering_queue_depth.get(), 2);

    service.flush().await;
    assert_eq!(metrics.metering_queue_depth.get(), 0);
}
