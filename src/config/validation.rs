//! Configuration validation.
//!
//! Serde handles syntax; this module checks values the gate cannot run with.
//! Every problem is reported, not just the first.

use std::net::SocketAddr;

use crate::config::schema::GateConfig;

/// A single semantic problem in a loaded configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("admission.max_concurrent must be greater than zero")]
    ZeroCapacity,

    #[error("admission.per_slot_wait_secs must be a finite non-negative number, got {0}")]
    InvalidWait(f64),

    #[error("{field} is not a valid socket address: {value}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must start with '/': {value}")]
    RelativePath { field: &'static str, value: String },

    #[error("{field} must end with '/': {value}")]
    MissingTrailingSlash { field: &'static str, value: String },

    #[error("{first} and {second} overlap at {value}")]
    PathCollision {
        first: &'static str,
        second: &'static str,
        value: String,
    },
}

/// Validate a configuration, collecting all errors.
pub fn validate_config(config: &GateConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let admission = &config.admission;

    if admission.max_concurrent == 0 {
        errors.push(ValidationError::ZeroCapacity);
    }

    let wait = admission.per_slot_wait_secs;
    if !wait.is_finite() || wait < 0.0 {
        errors.push(ValidationError::InvalidWait(wait));
    }

    check_address(&mut errors, "listener.bind_address", &config.listener.bind_address);
    if config.upstream.enabled {
        check_address(&mut errors, "upstream.address", &config.upstream.address);
    }
    if config.observability.metrics_enabled {
        check_address(
            &mut errors,
            "observability.metrics_address",
            &config.observability.metrics_address,
        );
    }

    check_paths(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Exempt paths are routed and classified by prefix, so they must be
/// absolute, prefixes must end at a segment boundary, and no two may
/// claim the same request.
fn check_paths(errors: &mut Vec<ValidationError>, config: &GateConfig) {
    let admission = &config.admission;
    let exact = [
        ("admission.health_path", admission.health_path.as_str()),
        ("admission.diagnostic_path", admission.diagnostic_path.as_str()),
    ];
    let prefixes = [
        ("admission.admin_prefix", admission.admin_prefix.as_str()),
        ("admission.results_prefix", admission.results_prefix.as_str()),
    ];

    for &(field, value) in exact.iter().chain(prefixes.iter()) {
        if !value.starts_with('/') {
            errors.push(ValidationError::RelativePath {
                field,
                value: value.to_string(),
            });
        }
    }

    for (field, value) in prefixes {
        if !value.ends_with('/') {
            errors.push(ValidationError::MissingTrailingSlash {
                field,
                value: value.to_string(),
            });
        }
    }

    let [(health_field, health), (diagnostic_field, diagnostic)] = exact;
    if health == diagnostic {
        errors.push(collision(health_field, diagnostic_field, health));
    }

    for (prefix_field, prefix) in prefixes {
        for (path_field, path) in exact {
            if path.starts_with(prefix) {
                errors.push(collision(path_field, prefix_field, path));
            }
        }
    }

    let [(admin_field, admin), (results_field, results)] = prefixes;
    if admin.starts_with(results) {
        errors.push(collision(admin_field, results_field, results));
    } else if results.starts_with(admin) {
        errors.push(collision(admin_field, results_field, admin));
    }
}

fn collision(first: &'static str, second: &'static str, value: &str) -> ValidationError {
    ValidationError::PathCollision {
        first,
        second,
        value: value.to_string(),
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
}
