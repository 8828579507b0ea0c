//! Proxy events and the sinks that receive them.
//!
//! Handlers report each significant state transition as a [`ProxyEvent`] to an
//! injected [`EventSink`]. Production wires in [`TracingSink`]; tests use
//! [`RecordingSink`] to assert on what happened.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::net::ConnectionId;
use crate::observability::metrics;

/// How an accepted request was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Plain,
    Connect,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Plain => "plain",
            RequestKind::Connect => "connect",
        }
    }
}

/// Result of one dial attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    Connected { elapsed: Duration },
    Failed { reason: String },
    TimedOut { timeout: Duration },
}

impl DialOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialOutcome::Connected { .. } => "connected",
            DialOutcome::Failed { .. } => "failed",
            DialOutcome::TimedOut { .. } => "timed_out",
        }
    }
}

/// Why an opaque relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
    Shutdown,
    Error,
}

impl RelayEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayEnd::ClientClosed => "client_closed",
            RelayEnd::UpstreamClosed => "upstream_closed",
            RelayEnd::IdleTimeout => "idle_timeout",
            RelayEnd::Shutdown => "shutdown",
            RelayEnd::Error => "error",
        }
    }
}

/// One significant state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Accepted {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    Classified {
        connection: ConnectionId,
        kind: RequestKind,
        target: String,
    },
    ConnectApproved {
        connection: ConnectionId,
        target: String,
        intercept: bool,
    },
    ConnectDenied {
        connection: ConnectionId,
        target: String,
        status: u16,
    },
    Dial {
        connection: ConnectionId,
        target: String,
        outcome: DialOutcome,
    },
    HandshakeFailed {
        connection: ConnectionId,
        peer: String,
        reason: String,
    },
    ShortCircuit {
        connection: ConnectionId,
        transform: String,
        status: u16,
    },
    Exchange {
        connection: ConnectionId,
        method: String,
        uri: String,
        status: u16,
        elapsed: Duration,
        tunneled: bool,
    },
    ExchangeFailed {
        connection: ConnectionId,
        kind: &'static str,
        error: String,
        status: u16,
    },
    /// Cookies an upstream set, reported by the `log_cookies` transform.
    ResponseCookies {
        connection: ConnectionId,
        host: String,
        status: u16,
        cookies: Vec<String>,
    },
    TunnelClosed {
        connection: ConnectionId,
        target: String,
        end: RelayEnd,
        bytes_up: u64,
        bytes_down: u64,
    },
    Closed {
        connection: ConnectionId,
    },
}

impl ProxyEvent {
    /// Connection this event belongs to.
    pub fn connection(&self) -> ConnectionId {
        match self {
            ProxyEvent::Accepted { connection, .. }
            | ProxyEvent::Classified { connection, .. }
            | ProxyEvent::ConnectApproved { connection, .. }
            | ProxyEvent::ConnectDenied { connection, .. }
            | ProxyEvent::Dial { connection, .. }
            | ProxyEvent::HandshakeFailed { connection, .. }
            | ProxyEvent::ShortCircuit { connection, .. }
            | ProxyEvent::Exchange { connection, .. }
            | ProxyEvent::ExchangeFailed { connection, .. }
            | ProxyEvent::ResponseCookies { connection, .. }
            | ProxyEvent::TunnelClosed { connection, .. }
            | ProxyEvent::Closed { connection } => *connection,
        }
    }
}

/// Destination for proxy events. Must tolerate concurrent callers.
pub trait EventSink: Send + Sync {
    fn record(&self, event: ProxyEvent);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn EventSink>;

/// Emits each event as one structured `tracing` event and updates metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: ProxyEvent) {
        metrics::record_event(&event);

        match &event {
            ProxyEvent::Accepted { connection, peer } => {
                tracing::debug!(connection_id = %connection, peer_addr = %peer, "Connection accepted");
            }
            ProxyEvent::Classified { connection, kind, target } => {
                tracing::info!(connection_id = %connection, kind = kind.as_str(), target = %target, "Request classified");
            }
            ProxyEvent::ConnectApproved { connection, target, intercept } => {
                tracing::info!(connection_id = %connection, target = %target, intercept, "CONNECT approved");
            }
            ProxyEvent::ConnectDenied { connection, target, status } => {
                tracing::info!(connection_id = %connection, target = %target, status, "CONNECT denied");
            }
            ProxyEvent::Dial { connection, target, outcome } => match outcome {
                DialOutcome::Connected { elapsed } => {
                    tracing::debug!(connection_id = %connection, target = %target, elapsed_ms = elapsed.as_millis() as u64, "Upstream dialed");
                }
                DialOutcome::Failed { reason } => {
                    tracing::warn!(connection_id = %connection, target = %target, reason = %reason, "DialFailed");
                }
                DialOutcome::TimedOut { timeout } => {
                    tracing::warn!(connection_id = %connection, target = %target, timeout_ms = timeout.as_millis() as u64, "DialTimeout");
                }
            },
            ProxyEvent::HandshakeFailed { connection, peer, reason } => {
                tracing::warn!(connection_id = %connection, peer = %peer, reason = %reason, "HandshakeFailed");
            }
            ProxyEvent::ShortCircuit { connection, transform, status } => {
                tracing::info!(connection_id = %connection, transform = %transform, status, "Transform short-circuited exchange");
            }
            ProxyEvent::Exchange { connection, method, uri, status, elapsed, tunneled } => {
                tracing::info!(
                    connection_id = %connection,
                    method = %method,
                    uri = %uri,
                    status,
                    tunneled,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Exchange complete"
                );
            }
            ProxyEvent::ExchangeFailed { connection, kind, error, status } => {
                tracing::error!(connection_id = %connection, kind = *kind, error = %error, status, "Exchange failed");
            }
            ProxyEvent::ResponseCookies { connection, host, status, cookies } => {
                tracing::info!(connection_id = %connection, host = %host, status, "Response received");
                for cookie in cookies {
                    tracing::info!(connection_id = %connection, host = %host, cookie = %cookie, "Cookie received");
                }
            }
            ProxyEvent::TunnelClosed { connection, target, end, bytes_up, bytes_down } => {
                tracing::info!(
                    connection_id = %connection,
                    target = %target,
                    end = end.as_str(),
                    bytes_up,
                    bytes_down,
                    "Tunnel closed"
                );
            }
            ProxyEvent::Closed { connection } => {
                tracing::debug!(connection_id = %connection, "Connection closed");
            }
        }
    }
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProxyEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<ProxyEvent> {
        self.events.lock().clone()
    }

    /// Events recorded for one connection.
    pub fn for_connection(&self, connection: ConnectionId) -> Vec<ProxyEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.connection() == connection)
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: ProxyEvent) {
        self.events.lock().push(event);
    }
}
