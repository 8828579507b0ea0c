//! Proxy handlers.
//!
//! # Data Flow
//! ```text
//! Request on a client connection
//!     → CONNECT?
//!         yes → connect.rs
//!             → policy.rs (approve, intercept or deny)
//!             → intercept: upstream.rs (TLS link) → TLS accept → exchange.rs per request
//!             → relay:     upstream.rs (TCP)      → relay.rs
//!         no  → plain.rs (absolute-form check) → exchange.rs
//! ```
//!
//! # Design Decisions
//! - All handler state lives in one immutable [`ProxyContext`] shared behind `Arc`
//! - Every failure is scoped to its exchange or tunnel
//! - A tunnel outlives the hyper connection that upgraded it, so it carries
//!   the connection's [`ConnectionLease`] until it closes

pub mod connect;
pub mod exchange;
pub mod plain;
pub mod policy;
pub mod relay;
pub mod upstream;

use std::sync::Arc;
use std::time::Duration;

use http::{Method, Request, Response};
use hyper::body::Incoming;
use tokio_rustls::TlsAcceptor;

use crate::http::ProxyBody;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionGuard;
use crate::net::listener::ConnectionPermit;
use crate::net::{ConnectionId, ConnectionTracker, Transport};
use crate::observability::{ProxyEvent, SharedSink};
use crate::pipeline::Pipeline;
use crate::resilience::RetryPolicy;

pub use policy::{ConnectDecision, ConnectPolicy, HostPattern, HostSet};

/// Everything a handler needs, fixed at startup.
pub struct ProxyContext {
    pub transport: Transport,
    pub retry: RetryPolicy,
    pub pipeline: Pipeline,
    pub policy: ConnectPolicy,
    /// Certificate presented inside intercepted tunnels.
    pub acceptor: Option<TlsAcceptor>,
    pub sink: SharedSink,
    pub max_body_bytes: usize,
    pub exchange_timeout: Duration,
    pub idle_timeout: Duration,
    pub tracker: ConnectionTracker,
    pub shutdown: Shutdown,
}

/// Everything an accepted client connection holds until its last user is gone.
///
/// The connection task and any tunnel it upgraded into share one lease. When
/// the last clone drops, the connection slot goes back to the listener, the
/// drain tracker is released and `Closed` is recorded.
#[derive(Clone)]
pub struct ConnectionLease {
    inner: Arc<LeaseInner>,
}

struct LeaseInner {
    id: ConnectionId,
    sink: SharedSink,
    _permit: ConnectionPermit,
    _guard: ConnectionGuard,
}

impl ConnectionLease {
    pub fn new(id: ConnectionId, permit: ConnectionPermit, ctx: &ProxyContext) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                id,
                sink: Arc::clone(&ctx.sink),
                _permit: permit,
                _guard: ctx.tracker.track(id),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.sink.record(ProxyEvent::Closed { connection: self.id });
    }
}

/// Route one request from a client connection.
pub async fn dispatch(
    ctx: Arc<ProxyContext>,
    lease: ConnectionLease,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        connect::handle_connect(ctx, lease, req).await
    } else {
        plain::handle_plain(ctx, lease.id(), req).await
    }
}
