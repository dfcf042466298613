//! Prometheus metrics for state store operations

use lazy_static::lazy_static;
use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Once;
use tracing::{info, warn};

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Store operation latency
    pub static ref STORE_OP_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("flowrun_store_operation_seconds", "Store operation duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation", "store_type"]
    ).expect("valid metric definition");

    /// Store operation errors
    pub static ref STORE_OP_ERRORS: CounterVec = CounterVec::new(
        Opts::new("flowrun_store_errors_total", "Store operation errors"),
        &["operation", "store_type", "error_type"]
    ).expect("valid metric definition");

    /// Retries issued by the retry wrapper
    pub static ref STORE_RETRIES: CounterVec = CounterVec::new(
        Opts::new("flowrun_store_retries_total", "Store operation retries"),
        &["operation", "store_type"]
    ).expect("valid metric definition");

    /// Redis connection status
    pub static ref REDIS_CONNECTED: Gauge = Gauge::new(
        "flowrun_store_redis_connected",
        "Redis connection status (1=connected, 0=disconnected)"
    ).expect("valid metric definition");
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry
pub fn register_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(STORE_OP_DURATION.clone())).ok();
        REGISTRY.register(Box::new(STORE_OP_ERRORS.clone())).ok();
        REGISTRY.register(Box::new(STORE_RETRIES.clone())).ok();
        REGISTRY.register(Box::new(REDIS_CONNECTED.clone())).ok();
        info!("State store metrics registered");
    });
}

/// Helper to time a store operation
pub struct OperationTimer {
    operation: &'static str,
    store_type: &'static str,
    start: std::time::Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str, store_type: &'static str) -> Self {
        Self {
            operation,
            store_type,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        STORE_OP_DURATION
            .with_label_values(&[self.operation, self.store_type])
            .observe(duration);
    }
}

/// Record a store error
pub fn record_store_error(operation: &str, store_type: &str, error_type: &str) {
    STORE_OP_ERRORS
        .with_label_values(&[operation, store_type, error_type])
        .inc();
}

pub fn record_retry(operation: &str, store_type: &str) {
    STORE_RETRIES.with_label_values(&[operation, store_type]).inc();
}

/// Update Redis status
pub fn update_redis_status(connected: bool) {
    REDIS_CONNECTED.set(if connected { 1.0 } else { 0.0 });
}

/// Get metrics as text for Prometheus scraping
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode store metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        register_metrics();
        register_metrics();
        {
            let _timer = OperationTimer::new("get", "test");
        }
        record_store_error("get", "test", "redis");
        let text = gather_metrics();
        assert!(text.contains("flowrun_store_operation_seconds"));
        assert!(text.contains("flowrun_store_errors_total"));
    }
}
