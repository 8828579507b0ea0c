//! Upstream connections.
//!
//! # Responsibilities
//! - Dial targets through the shared [`Transport`](crate::net::Transport), reporting each attempt
//! - Run the HTTP/1.1 client handshake over a dialed stream
//! - Hold the upstream side of an intercepted tunnel, redialing when it closes
//!
//! # Design Decisions
//! - Retries wrap the dial only; the request is sent exactly once
//! - The client connection task is spawned and ends when its sender is dropped

use std::time::Instant;

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::client::TlsStream;

use crate::error::ProxyError;
use crate::http::{collect_response, InterceptedResponse, ProxyBody};
use crate::net::transport::error_chain;
use crate::net::{ConnectionId, Target};
use crate::observability::{DialOutcome, ProxyEvent};
use crate::proxy::ProxyContext;
use crate::resilience::with_retries;

/// Sending half of an upstream HTTP/1.1 connection.
pub type UpstreamSender = SendRequest<ProxyBody>;

/// Dial `target` over TCP, honoring the retry policy.
pub async fn dial_tcp(
    ctx: &ProxyContext,
    connection: ConnectionId,
    target: &Target,
) -> Result<TcpStream, ProxyError> {
    with_retries(ctx.retry, move |_| async move {
        let started = Instant::now();
        let result = ctx.transport.dial(target).await;
        let outcome = match &result {
            Ok(_) => DialOutcome::Connected {
                elapsed: started.elapsed(),
            },
            Err(ProxyError::DialTimeout { timeout, .. }) => DialOutcome::TimedOut { timeout: *timeout },
            Err(ProxyError::DialFailed { reason, .. }) => DialOutcome::Failed {
                reason: reason.clone(),
            },
            Err(other) => DialOutcome::Failed {
                reason: other.to_string(),
            },
        };
        ctx.sink.record(ProxyEvent::Dial {
            connection,
            target: target.to_string(),
            outcome,
        });
        result
    })
    .await
}

/// Dial `target` and complete a verified TLS handshake.
pub async fn dial_tls(
    ctx: &ProxyContext,
    connection: ConnectionId,
    target: &Target,
) -> Result<TlsStream<TcpStream>, ProxyError> {
    let tcp = dial_tcp(ctx, connection, target).await?;
    ctx.transport.secure(target, tcp).await.inspect_err(|e| {
        if let ProxyError::HandshakeFailed { peer, reason } = e {
            ctx.sink.record(ProxyEvent::HandshakeFailed {
                connection,
                peer: peer.clone(),
                reason: reason.clone(),
            });
        }
    })
}

/// Start an HTTP/1.1 client connection over `io`.
pub async fn handshake<IO>(connection: ConnectionId, io: IO) -> Result<UpstreamSender, ProxyError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(error_chain(&e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(connection_id = %connection, error = %e, "Upstream connection ended with error");
        }
    });
    Ok(sender)
}

/// Send one request and wait for the response head.
pub async fn send(
    sender: &mut UpstreamSender,
    req: Request<ProxyBody>,
) -> Result<Response<Incoming>, ProxyError> {
    sender
        .ready()
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(error_chain(&e)))?;
    sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(error_chain(&e)))
}

/// One fresh connection per exchange: dial, handshake, send, buffer.
pub async fn round_trip_once(
    ctx: &ProxyContext,
    connection: ConnectionId,
    target: &Target,
    req: Request<ProxyBody>,
) -> Result<InterceptedResponse, ProxyError> {
    let tcp = dial_tcp(ctx, connection, target).await?;
    let mut sender = handshake(connection, tcp).await?;
    let resp = send(&mut sender, req).await?;
    collect_response(resp, ctx.max_body_bytes).await
}

/// Upstream side of an intercepted tunnel.
///
/// Exchanges on one tunnel are sequential, so the lock is never contended.
/// A sender that is no longer ready (the upstream closed it) is replaced.
pub struct UpstreamLink {
    target: Target,
    sender: Mutex<Option<UpstreamSender>>,
}

impl UpstreamLink {
    /// Dial the target over TLS and open the HTTP/1.1 connection.
    pub async fn open(
        ctx: &ProxyContext,
        connection: ConnectionId,
        target: Target,
    ) -> Result<Self, ProxyError> {
        let tls = dial_tls(ctx, connection, &target).await?;
        let sender = handshake(connection, tls).await?;
        Ok(Self {
            target,
            sender: Mutex::new(Some(sender)),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Send `req` on the link, redialing first if the upstream closed it.
    pub async fn round_trip(
        &self,
        ctx: &ProxyContext,
        connection: ConnectionId,
        req: Request<ProxyBody>,
    ) -> Result<InterceptedResponse, ProxyError> {
        let mut slot = self.sender.lock().await;

        let reusable = match slot.take() {
            Some(mut sender) => sender.ready().await.is_ok().then_some(sender),
            None => None,
        };
        let mut sender = match reusable {
            Some(sender) => sender,
            None => {
                tracing::debug!(connection_id = %connection, target = %self.target, "Redialing upstream");
                let tls = dial_tls(ctx, connection, &self.target).await?;
                handshake(connection, tls).await?
            }
        };

        let result = send(&mut sender, req).await;
        *slot = Some(sender);
        collect_response(result?, ctx.max_body_bytes).await
    }
}
