//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_total` (counter)
//! - `proxy_requests_total` (counter): by kind (plain, connect)
//! - `proxy_dials_total` (counter): by outcome
//! - `proxy_exchanges_total` (counter): by status, tunneled
//! - `proxy_exchange_duration_seconds` (histogram)
//! - `proxy_exchange_failures_total` (counter): by error kind
//! - `proxy_tunnel_bytes_total` (counter): by direction
//! - `proxy_response_cookies_total` (counter)

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::observability::events::ProxyEvent;

/// Start the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter"),
    }
}

/// Update counters for one event. A no-op until a recorder is installed.
pub fn record_event(event: &ProxyEvent) {
    match event {
        ProxyEvent::Accepted { .. } => {
            metrics::counter!("proxy_connections_total").increment(1);
        }
        ProxyEvent::Classified { kind, .. } => {
            metrics::counter!("proxy_requests_total", "kind" => kind.as_str()).increment(1);
        }
        ProxyEvent::ConnectDenied { .. } => {
            metrics::counter!("proxy_connect_denied_total").increment(1);
        }
        ProxyEvent::Dial { outcome, .. } => {
            metrics::counter!("proxy_dials_total", "outcome" => outcome.as_str()).increment(1);
        }
        ProxyEvent::HandshakeFailed { .. } => {
            metrics::counter!("proxy_handshake_failures_total").increment(1);
        }
        ProxyEvent::ShortCircuit { .. } => {
            metrics::counter!("proxy_short_circuits_total").increment(1);
        }
        ProxyEvent::Exchange { status, elapsed, tunneled, .. } => {
            metrics::counter!(
                "proxy_exchanges_total",
                "status" => status.to_string(),
                "tunneled" => tunneled.to_string()
            )
            .increment(1);
            metrics::histogram!("proxy_exchange_duration_seconds").record(elapsed.as_secs_f64());
        }
        ProxyEvent::ExchangeFailed { kind, .. } => {
            metrics::counter!("proxy_exchange_failures_total", "kind" => *kind).increment(1);
        }
        ProxyEvent::ResponseCookies { cookies, .. } => {
            metrics::counter!("proxy_response_cookies_total").increment(cookies.len() as u64);
        }
        ProxyEvent::TunnelClosed { bytes_up, bytes_down, .. } => {
            metrics::counter!("proxy_tunnel_bytes_total", "direction" => "up").increment(*bytes_up);
            metrics::counter!("proxy_tunnel_bytes_total", "direction" => "down").increment(*bytes_down);
        }
        ProxyEvent::ConnectApproved { .. } | ProxyEvent::Closed { .. } => {}
    }
}
