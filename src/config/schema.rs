//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gate.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the admission gate.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GateConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Downstream API that admitted requests are forwarded to.
    pub upstream: UpstreamConfig,

    /// Admission control settings.
    pub admission: AdmissionConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3001").
    pub bind_address: String,

    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3001".to_string(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// Downstream API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Forward admitted requests to `address`. When disabled, the fallback
    /// route answers 404 locally.
    pub enabled: bool,

    /// Upstream address (e.g., "127.0.0.1:3000").
    pub address: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1:3000".to_string(),
        }
    }
}

/// Admission control configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of concurrently admitted requests. Fixed for the
    /// lifetime of the process.
    pub max_concurrent: usize,

    /// Seconds of estimated wait reported per queue position.
    pub per_slot_wait_secs: f64,

    /// Keep the result of drained requests so callers can fetch it from the
    /// results endpoint.
    pub retain_results: bool,

    /// How long an unclaimed deferred result is kept, in seconds.
    pub result_ttl_secs: u64,

    /// Largest response body kept for a deferred result. Bigger bodies are
    /// replaced by a 502 envelope.
    pub max_result_bytes: usize,

    /// Health probe path (never queued).
    pub health_path: String,

    /// Network diagnostic path (never queued).
    pub diagnostic_path: String,

    /// Every path under this prefix is never queued.
    pub admin_prefix: String,

    /// Deferred-result polling prefix (never queued).
    pub results_prefix: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            per_slot_wait_secs: 2.0,
            retain_results: true,
            result_ttl_secs: 300,
            max_result_bytes: 1024 * 1024,
            health_path: "/api/health".to_string(),
            diagnostic_path: "/api/debug/network-info".to_string(),
            admin_prefix: "/api/admin/".to_string(),
            results_prefix: "/api/queue/".to_string(),
        }
    }
}

/// Timeout configuration.
///
/// The gate never times out queued or admitted requests while serving;
/// these bound the forwarding call and the drain at shutdown.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Upstream request timeout in seconds.
    pub upstream_secs: u64,

    /// How long shutdown waits for admitted and queued requests to finish.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
