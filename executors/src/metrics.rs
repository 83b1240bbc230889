use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry,
};
use std::sync::{Arc, RwLock};

/// Metrics for the submission, retry and indexing pipeline
pub struct EngineMetrics {
    pub transaction_queued_to_submitted_duration: HistogramVec,
    pub transaction_queued_to_mined_duration: HistogramVec,
    pub fee_escalations: IntCounterVec,
    pub reorg_reverts: IntCounterVec,
    pub submission_failures: IntCounterVec,
    pub running_indexers: IntGauge,
}

impl EngineMetrics {
    /// Create new engine metrics with the provided registry
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let transaction_queued_to_submitted_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "relay_engine_transaction_queued_to_submitted_duration_seconds",
                "Time from when transaction is queued to when the node accepts it"
            )
            .buckets(vec![
                0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0
            ]),
            &["chain_id"],
            registry
        )?;

        let transaction_queued_to_mined_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new(
                "relay_engine_transaction_queued_to_mined_duration_seconds",
                "Time from when transaction is queued to when it's mined on-chain"
            )
            .buckets(vec![
                0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0
            ]),
            &["chain_id"],
            registry
        )?;

        let fee_escalations = register_int_counter_vec_with_registry!(
            Opts::new(
                "relay_engine_fee_escalations_total",
                "Stalled transactions re-signed or rebroadcast with higher fees"
            ),
            &["chain_id"],
            registry
        )?;

        let reorg_reverts = register_int_counter_vec_with_registry!(
            Opts::new(
                "relay_engine_reorg_reverts_total",
                "Mined transactions moved back to submitted after their block was orphaned"
            ),
            &["chain_id"],
            registry
        )?;

        let submission_failures = register_int_counter_vec_with_registry!(
            Opts::new(
                "relay_engine_submission_failures_total",
                "Broadcast failures by classification"
            ),
            &["chain_id", "class"],
            registry
        )?;

        let running_indexers = register_int_gauge_with_registry!(
            Opts::new(
                "relay_engine_running_indexers",
                "Chain indexers currently running"
            ),
            registry
        )?;

        Ok(EngineMetrics {
            transaction_queued_to_submitted_duration,
            transaction_queued_to_mined_duration,
            fee_escalations,
            reorg_reverts,
            submission_failures,
            running_indexers,
        })
    }
}

lazy_static! {
    /// Default metrics registry (fallback if no external registry provided)
    static ref DEFAULT_ENGINE_METRICS_REGISTRY: Registry = Registry::new();

    /// Default metrics instance, `None` only if registration itself failed
    static ref DEFAULT_ENGINE_METRICS: Option<Arc<EngineMetrics>> =
        EngineMetrics::new(&DEFAULT_ENGINE_METRICS_REGISTRY).map(Arc::new).ok();

    /// Global metrics instance - can be set by the binary crate or uses default
    static ref ENGINE_METRICS_INSTANCE: RwLock<Option<Arc<EngineMetrics>>> = RwLock::new(None);
}

/// Initialize engine metrics with a custom registry
/// This should be called once at application startup by the binary crate
pub fn initialize_metrics(metrics: EngineMetrics) {
    if let Ok(mut instance) = ENGINE_METRICS_INSTANCE.write() {
        *instance = Some(Arc::new(metrics));
    }
}

fn get_metrics() -> Option<Arc<EngineMetrics>> {
    let custom = ENGINE_METRICS_INSTANCE
        .read()
        .ok()
        .and_then(|instance| instance.clone());
    custom.or_else(|| DEFAULT_ENGINE_METRICS.clone())
}

/// Export metrics in Prometheus format from the default registry
/// For custom registries, the binary crate should handle metrics export directly
pub fn export_default_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = DEFAULT_ENGINE_METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_transaction_queued_to_submitted(chain_id: u64, duration_seconds: f64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .transaction_queued_to_submitted_duration
            .with_label_values(&[&chain_id.to_string()])
            .observe(duration_seconds);
    }
}

pub fn record_transaction_queued_to_mined(chain_id: u64, duration_seconds: f64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .transaction_queued_to_mined_duration
            .with_label_values(&[&chain_id.to_string()])
            .observe(duration_seconds);
    }
}

pub fn record_fee_escalation(chain_id: u64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .fee_escalations
            .with_label_values(&[&chain_id.to_string()])
            .inc();
    }
}

pub fn record_reorg_revert(chain_id: u64) {
    if let Some(metrics) = get_metrics() {
        metrics
            .reorg_reverts
            .with_label_values(&[&chain_id.to_string()])
            .inc();
    }
}

pub fn record_submission_failure(chain_id: u64, class: &str) {
    if let Some(metrics) = get_metrics() {
        metrics
            .submission_failures
            .with_label_values(&[chain_id.to_string().as_str(), class])
            .inc();
    }
}

pub fn set_running_indexers(count: usize) {
    if let Some(metrics) = get_metrics() {
        metrics.running_indexers.set(count as i64);
    }
}

/// Helper to calculate duration in seconds from unix timestamps (milliseconds)
pub fn calculate_duration_seconds(start_timestamp_ms: u64, end_timestamp_ms: u64) -> f64 {
    (end_timestamp_ms.saturating_sub(start_timestamp_ms)) as f64 / 1000.0
}
