//! Client-facing server.
//!
//! # Responsibilities
//! - Accept connections under the listener's connection limit
//! - Serve HTTP/1.1 on each, with upgrades enabled for CONNECT
//! - Stop accepting on shutdown, ask live connections to finish, drain
//!
//! # Design Decisions
//! - One task per client connection; a failure never leaks into another task
//! - Draining is bounded; stragglers are abandoned when the deadline passes

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::lifecycle::Shutdown;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::ConnectionId;
use crate::observability::ProxyEvent;
use crate::proxy::{dispatch, ConnectionLease, ProxyContext};

/// How long shutdown waits for live connections and tunnels.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound proxy, ready to serve.
pub struct ProxyServer {
    listener: Listener,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(listener: Listener, ctx: ProxyContext) -> Self {
        Self {
            listener,
            ctx: Arc::new(ctx),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Handle that stops [`run`](Self::run) when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.ctx.shutdown.clone()
    }

    /// Accept and serve until shutdown, then drain.
    pub async fn run(self) -> Result<(), ListenerError> {
        let addr = self.listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(address = %addr, intercept = self.ctx.policy.intercepts(), "Proxy server starting");

        let mut shutdown = self.ctx.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => self.spawn_connection(stream, peer, permit),
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => return Err(e),
                },
                _ = shutdown.recv() => break,
            }
        }

        let active = self.ctx.tracker.active_count();
        tracing::info!(active_connections = active, "Stopped accepting, draining connections");
        if self.ctx.tracker.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = self.ctx.tracker.active_count(),
                "Drain deadline passed, abandoning connections"
            );
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        let ctx = Arc::clone(&self.ctx);
        let connection = ConnectionId::next();
        ctx.sink.record(ProxyEvent::Accepted { connection, peer });
        let lease = ConnectionLease::new(connection, permit, &ctx);

        tokio::spawn(async move {
            let mut shutdown = ctx.shutdown.subscribe();

            let service = {
                let ctx = Arc::clone(&ctx);
                service_fn(move |req: Request<Incoming>| {
                    let ctx = Arc::clone(&ctx);
                    let lease = lease.clone();
                    async move { Ok::<_, Infallible>(dispatch(ctx, lease, req).await) }
                })
            };

            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.recv() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %connection, error = %e, "Connection ended with error");
            }
        });
    }
}
