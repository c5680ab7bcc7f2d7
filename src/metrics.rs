use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram,
};

use crate::error::{GatewayError, Result};

lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!(
            "medical_report_requests_total",
            "Total number of analysis requests"
        )
        .unwrap();
    pub static ref REQUEST_ERRORS: CounterVec = register_counter_vec!(
        "medical_report_request_errors_total",
        "Failed requests by status class",
        &["class"]
    )
    .unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("medical_report_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("medical_report_cache_misses_total", "Total cache misses").unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("medical_report_cache_size", "Current number of items in cache").unwrap();
    pub static ref UPSTREAM_ATTEMPTS: Counter =
        register_counter!(
            "medical_report_upstream_attempts_total",
            "Outbound model API calls"
        )
        .unwrap();
    pub static ref UPSTREAM_RETRIES: Counter =
        register_counter!(
            "medical_report_upstream_retries_total",
            "Outbound calls retried after a transient failure"
        )
        .unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "medical_report_request_latency_seconds",
        "Request latency in seconds",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    )
    .unwrap();
}

// Prometheus text exposition of everything registered above
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| GatewayError::Internal(format!("metrics encoding: {e}")))?;
    String::from_utf8(buffer).map_err(|e| GatewayError::Internal(format!("metrics encoding: {e}")))
}
