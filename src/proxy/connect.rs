//! CONNECT tunnels.
//!
//! # State Machine
//! ```text
//! Requested
//!     → policy denies           → Denied (deny status, connection stays usable)
//!     → dial upstream
//!         → fails               → Failed (502/504, no tunnel)
//!         → ok                  → 200 Connection Established → Upgraded
//! Upgraded, relay mode          → opaque byte copy           → Closed
//! Upgraded, intercept mode      → TLS accept with client
//!         → handshake fails     → Closed (HandshakeFailed event)
//!         → ok                  → serve HTTP/1.1, each request through the exchange core
//!                               → Closed
//! ```
//!
//! The upstream is dialed before the 200 goes out, so dial and upstream TLS
//! failures are still reportable as a status line.

use std::convert::Infallible;
use std::sync::Arc;

use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::ProxyError;
use crate::http::{connection_established, error_response, tunneled_uri, ProxyBody};
use crate::net::{ConnectionId, Target};
use crate::observability::{ProxyEvent, RelayEnd, RequestKind};
use crate::proxy::exchange::{fail, run_exchange, Upstream};
use crate::proxy::policy::ConnectDecision;
use crate::proxy::relay::{relay, RelayStats};
use crate::proxy::upstream::{dial_tcp, UpstreamLink};
use crate::proxy::{ConnectionLease, ProxyContext};

pub async fn handle_connect(
    ctx: Arc<ProxyContext>,
    lease: ConnectionLease,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let connection = lease.id();
    let target = match req
        .uri()
        .authority()
        .and_then(|authority| Target::parse_connect(authority.as_str()))
    {
        Some(target) => target,
        None => {
            let err = ProxyError::BadRequest(format!("invalid CONNECT target `{}`", req.uri()));
            return fail(&ctx, connection, &err);
        }
    };

    ctx.sink.record(ProxyEvent::Classified {
        connection,
        kind: RequestKind::Connect,
        target: target.to_string(),
    });

    match ctx.policy.decide(&target) {
        ConnectDecision::Deny(status) => deny(&ctx, connection, &target, status),
        ConnectDecision::Relay => {
            approve(&ctx, connection, &target, false);
            let upstream = match dial_tcp(&ctx, connection, &target).await {
                Ok(upstream) => upstream,
                Err(err) => return fail(&ctx, connection, &err),
            };
            tokio::spawn(run_relay(Arc::clone(&ctx), lease, target, req, upstream));
            connection_established()
        }
        ConnectDecision::Intercept => {
            approve(&ctx, connection, &target, true);
            let link = match UpstreamLink::open(&ctx, connection, target).await {
                Ok(link) => link,
                Err(err) => return fail(&ctx, connection, &err),
            };
            tokio::spawn(run_intercept(Arc::clone(&ctx), lease, req, link));
            connection_established()
        }
    }
}

fn deny(
    ctx: &ProxyContext,
    connection: ConnectionId,
    target: &Target,
    status: StatusCode,
) -> Response<ProxyBody> {
    ctx.sink.record(ProxyEvent::ConnectDenied {
        connection,
        target: target.to_string(),
        status: status.as_u16(),
    });
    error_response(&ProxyError::RequestDenied {
        target: target.to_string(),
        status,
    })
}

fn approve(ctx: &ProxyContext, connection: ConnectionId, target: &Target, intercept: bool) {
    ctx.sink.record(ProxyEvent::ConnectApproved {
        connection,
        target: target.to_string(),
        intercept,
    });
}

async fn upgrade(connection: ConnectionId, req: Request<Incoming>) -> Option<Upgraded> {
    match hyper::upgrade::on(req).await {
        Ok(upgraded) => Some(upgraded),
        Err(e) => {
            tracing::warn!(connection_id = %connection, error = %e, "CONNECT upgrade failed");
            None
        }
    }
}

async fn run_relay(
    ctx: Arc<ProxyContext>,
    lease: ConnectionLease,
    target: Target,
    req: Request<Incoming>,
    upstream: TcpStream,
) {
    let connection = lease.id();
    let mut shutdown = ctx.shutdown.subscribe();

    let stats = match upgrade(connection, req).await {
        Some(upgraded) => {
            relay(TokioIo::new(upgraded), upstream, ctx.idle_timeout, &mut shutdown).await
        }
        None => RelayStats {
            end: RelayEnd::Error,
            bytes_up: 0,
            bytes_down: 0,
        },
    };

    ctx.sink.record(ProxyEvent::TunnelClosed {
        connection,
        target: target.to_string(),
        end: stats.end,
        bytes_up: stats.bytes_up,
        bytes_down: stats.bytes_down,
    });
}

async fn run_intercept(
    ctx: Arc<ProxyContext>,
    lease: ConnectionLease,
    req: Request<Incoming>,
    link: UpstreamLink,
) {
    let connection = lease.id();
    let Some(acceptor) = ctx.acceptor.clone() else {
        tracing::error!(connection_id = %connection, "Interception requested without TLS material");
        return;
    };
    let Some(upgraded) = upgrade(connection, req).await else {
        return;
    };

    let peer = link.target().to_string();
    let handshake_timeout = ctx.transport.handshake_timeout();
    let accepted =
        tokio::time::timeout(handshake_timeout, acceptor.accept(TokioIo::new(upgraded))).await;
    let tls = match accepted {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            handshake_failed(&ctx, connection, peer, e.to_string());
            return;
        }
        Err(_) => {
            handshake_failed(&ctx, connection, peer, format!("timed out after {handshake_timeout:?}"));
            return;
        }
    };

    let link = Arc::new(link);
    let service = {
        let ctx = Arc::clone(&ctx);
        service_fn(move |req: Request<Incoming>| {
            let ctx = Arc::clone(&ctx);
            let link = Arc::clone(&link);
            async move { Ok::<_, Infallible>(serve_tunneled(&ctx, connection, &link, req).await) }
        })
    };

    let conn = http1::Builder::new().serve_connection(TokioIo::new(tls), service);
    tokio::pin!(conn);
    let mut shutdown = ctx.shutdown.subscribe();

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.recv() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        tracing::debug!(connection_id = %connection, error = %e, "Intercepted tunnel ended with error");
    }
    tracing::debug!(connection_id = %connection, target = %peer, "Intercepted tunnel closed");
}

fn handshake_failed(ctx: &ProxyContext, connection: ConnectionId, peer: String, reason: String) {
    ctx.sink.record(ProxyEvent::HandshakeFailed {
        connection,
        peer,
        reason,
    });
}

async fn serve_tunneled(
    ctx: &ProxyContext,
    connection: ConnectionId,
    link: &UpstreamLink,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let target = link.target().clone();
    match tunneled_uri(&target, req.uri()) {
        Ok(uri) => *req.uri_mut() = uri,
        Err(err) => return fail(ctx, connection, &err),
    }
    run_exchange(ctx, connection, req, target, true, Upstream::Link(link)).await
}
