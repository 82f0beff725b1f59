//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gate_admissions_total` (counter): by outcome (immediate, queued, drained, exempt)
//! - `gate_completions_total` (counter): by completion signal
//! - `gate_active_requests` / `gate_queued_requests` (gauges)
//! - `gate_queue_wait_seconds` (histogram): time from enqueue to drain
//! - `gate_requests_total` (counter): forwarded requests by method, status
//! - `gate_request_duration_seconds` (histogram): forwarding latency
//!
//! All recorders are no-ops until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);

    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_admission(outcome: &'static str) {
    counter!("gate_admissions_total", "outcome" => outcome).increment(1);
}

pub fn record_completion(signal: &'static str) {
    counter!("gate_completions_total", "signal" => signal).increment(1);
}

pub fn set_gate_counts(active: usize, queued: usize) {
    gauge!("gate_active_requests").set(active as f64);
    gauge!("gate_queued_requests").set(queued as f64);
}

pub fn record_queue_wait(waited: Duration) {
    histogram!("gate_queue_wait_seconds").record(waited.as_secs_f64());
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    let method = method.to_string();
    let status = status.to_string();
    counter!("gate_requests_total", "method" => method.clone(), "status" => status.clone())
        .increment(1);
    histogram!("gate_request_duration_seconds", "method" => method, "status" => status)
        .record(start.elapsed().as_secs_f64());
}
