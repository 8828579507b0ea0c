//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, statuses in range)
//! - Check paired settings (cert with key)
//! - Detect duplicate transform names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{ProxyConfig, RequestTransformConfig, ResponseTransformConfig};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: `{value}` is not a socket address")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} is set without its matching key/certificate")]
    Unpaired(&'static str),

    #[error("tunnel.allow_hosts is empty; no CONNECT target could ever be approved")]
    EmptyAllowList,

    #[error("{field}: {status} is not a 4xx/5xx status")]
    InvalidStatus { field: String, status: u16 },

    #[error("transform name `{0}` is used more than once")]
    DuplicateTransform(String),

    #[error("transform `{0}`: {1}")]
    InvalidTransform(String, &'static str),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero("listener.max_connections"));
    }

    let upstream = &config.upstream;
    for (field, value) in [
        ("upstream.connect_timeout_secs", upstream.connect_timeout_secs),
        ("upstream.exchange_timeout_secs", upstream.exchange_timeout_secs),
        ("upstream.handshake_timeout_secs", upstream.handshake_timeout_secs),
        ("tunnel.idle_timeout_secs", config.tunnel.idle_timeout_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero(field));
        }
    }
    match (&upstream.client_cert_path, &upstream.client_key_path) {
        (Some(_), None) => errors.push(ValidationError::Unpaired("upstream.client_cert_path")),
        (None, Some(_)) => errors.push(ValidationError::Unpaired("upstream.client_key_path")),
        _ => {}
    }
    if upstream.retry.enabled && upstream.retry.max_attempts == 0 {
        errors.push(ValidationError::Zero("upstream.retry.max_attempts"));
    }

    if config.tunnel.allow_hosts.is_empty() {
        errors.push(ValidationError::EmptyAllowList);
    }
    check_status(&mut errors, "tunnel.deny_status", config.tunnel.deny_status);

    if config.limits.max_body_bytes == 0 {
        errors.push(ValidationError::Zero("limits.max_body_bytes"));
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    let mut seen = HashSet::new();
    for transform in &config.pipeline.request {
        if !seen.insert(transform.name().to_string()) {
            errors.push(ValidationError::DuplicateTransform(transform.name().to_string()));
        }
        match transform {
            RequestTransformConfig::InjectCookie {
                name,
                cookie,
                value,
                value_env,
            } => {
                if cookie.trim().is_empty() {
                    errors.push(ValidationError::InvalidTransform(name.clone(), "empty cookie name"));
                }
                if value.is_some() == value_env.is_some() {
                    errors.push(ValidationError::InvalidTransform(
                        name.clone(),
                        "exactly one of `value` or `value_env` is required",
                    ));
                }
            }
            RequestTransformConfig::SetHeader { name, header, .. } if header.is_empty() => {
                errors.push(ValidationError::InvalidTransform(name.clone(), "empty header name"));
            }
            RequestTransformConfig::BlockHosts { name, status, .. } => {
                check_status(&mut errors, name, *status);
            }
            _ => {}
        }
    }
    for transform in &config.pipeline.response {
        if !seen.insert(transform.name().to_string()) {
            errors.push(ValidationError::DuplicateTransform(transform.name().to_string()));
        }
        match transform {
            ResponseTransformConfig::StripCookie { name, cookie } if cookie.trim().is_empty() => {
                errors.push(ValidationError::InvalidTransform(name.clone(), "empty cookie name"));
            }
            ResponseTransformConfig::SetHeader { name, header, .. } if header.is_empty() => {
                errors.push(ValidationError::InvalidTransform(name.clone(), "empty header name"));
            }
            _ => {}
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_status(errors: &mut Vec<ValidationError>, field: &str, status: u16) {
    if !(400..600).contains(&status) {
        errors.push(ValidationError::InvalidStatus {
            field: field.to_string(),
            status,
        });
    }
}
