// Prometheus metrics for the publish gate
//
// Exposed on the /metrics endpoint of the admin server:
// - Admission decisions per platform (counter)
// - Publish outcomes and latency per platform (counter, histogram)
// - Rate limit saturation per platform (gauge)
// - Store availability and dispatch halts (gauge, counter)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, GaugeVec, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::{Arc, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Admission metrics
    pub static ref QUOTA_DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("quota_decisions_total", "Admission decisions by platform and outcome"),
        &["platform", "decision"]
    ).expect("Failed to create quota decisions metric");

    pub static ref RATE_LIMIT_SATURATION: GaugeVec = GaugeVec::new(
        prometheus::Opts::new("rate_limit_saturation_percent", "Used share of the effective quota"),
        &["platform"]
    ).expect("Failed to create saturation metric");

    // Publish metrics
    pub static ref PUBLISH_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("publish_attempts_total", "Publish attempts by platform and outcome"),
        &["platform", "outcome"]
    ).expect("Failed to create publish attempts metric");

    pub static ref PUBLISH_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new("publish_duration_seconds", "Platform publish call duration"),
        &["platform"]
    ).expect("Failed to create publish duration metric");

    // Store / dispatcher health
    pub static ref STORE_AVAILABLE: IntGauge = IntGauge::new(
        "store_available",
        "1 while the durable store is reachable, 0 after an outage halted dispatch"
    ).expect("Failed to create store availability metric");

    pub static ref DISPATCH_HALTS_TOTAL: IntCounter = IntCounter::new(
        "dispatch_halts_total",
        "Number of times dispatch was halted by a store outage"
    ).expect("Failed to create dispatch halts metric");
}

static INIT: Once = Once::new();

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
        STORE_AVAILABLE.set(1);
    });
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(QUOTA_DECISIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_SATURATION.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(STORE_AVAILABLE.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_HALTS_TOTAL.clone()))?;
    Ok(())
}

/// Count one admission decision
pub fn record_decision(platform: &str, granted: bool) {
    let decision = if granted { "granted" } else { "denied" };
    QUOTA_DECISIONS_TOTAL
        .with_label_values(&[platform, decision])
        .inc();
}

/// Count one publish attempt and observe its latency
pub fn record_publish(platform: &str, outcome: &str, elapsed_secs: f64) {
    PUBLISH_ATTEMPTS_TOTAL
        .with_label_values(&[platform, outcome])
        .inc();
    PUBLISH_DURATION_SECONDS
        .with_label_values(&[platform])
        .observe(elapsed_secs);
}

/// Publish the current saturation for a platform
pub fn set_saturation(platform: &str, pct: u32) {
    RATE_LIMIT_SATURATION
        .with_label_values(&[platform])
        .set(pct as f64);
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
