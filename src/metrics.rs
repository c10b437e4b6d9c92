//! Prometheus metrics for tier movement and checkpointing
//!
//! Counters are process-wide. They are updated on batch paths (eviction,
//! shrink, save) and on promotion, never per column access.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref PROMOTIONS_TOTAL: IntCounter = IntCounter::new(
        "evstore_promotions_total",
        "Keys copied from a capacity tier into the primary tier"
    ).unwrap();

    pub static ref PROMOTION_RACES_TOTAL: IntCounter = IntCounter::new(
        "evstore_promotion_races_total",
        "Promotions or creations that lost the insert race"
    ).unwrap();

    pub static ref EVICTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("evstore_evictions_total", "Keys moved out of the primary tier"),
        &["mode"]
    ).unwrap();

    pub static ref RETIRED_SLOTS: IntGauge = IntGauge::new(
        "evstore_retired_slots",
        "Slots waiting for deferred reclamation"
    ).unwrap();

    pub static ref SHRUNK_KEYS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("evstore_shrunk_keys_total", "Keys dropped by shrink policies"),
        &["tier"]
    ).unwrap();

    pub static ref CHECKPOINT_KEYS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("evstore_checkpoint_keys_total", "Keys written to checkpoints"),
        &["kind"]
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(PROMOTIONS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(PROMOTION_RACES_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(EVICTIONS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(RETIRED_SLOTS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(SHRUNK_KEYS_TOTAL.clone())).ok();
    METRICS_REGISTRY.register(Box::new(CHECKPOINT_KEYS_TOTAL.clone())).ok();
}

pub fn record_eviction(delayed: bool, count: usize) {
    let mode = if delayed { "delayed" } else { "immediate" };
    EVICTIONS_TOTAL.with_label_values(&[mode]).inc_by(count as u64);
}

pub fn record_shrink(tier: &str, count: usize) {
    SHRUNK_KEYS_TOTAL.with_label_values(&[tier]).inc_by(count as u64);
}

pub fn record_checkpoint(admitted: usize, filtered: usize) {
    CHECKPOINT_KEYS_TOTAL
        .with_label_values(&["admitted"])
        .inc_by(admitted as u64);
    CHECKPOINT_KEYS_TOTAL
        .with_label_values(&["filtered"])
        .inc_by(filtered as u64);
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
