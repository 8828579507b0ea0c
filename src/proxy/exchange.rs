//! The exchange core shared by plain requests and intercepted tunnels.
//!
//! ```text
//! Request<Incoming>
//!     → buffer (bounded)
//!     → request transforms ── short-circuit ──┐
//!     → upstream round trip                    │
//!     → buffer (bounded)                       │
//!     → response transforms ◀──────────────────┘
//!     → client
//! ```
//!
//! The whole sequence runs under the exchange deadline. Any failure becomes a
//! gateway-class reply; a partial upstream message is never forwarded.

use std::sync::Arc;
use std::time::Instant;

use http::{Method, Request, Response};
use hyper::body::Incoming;

use crate::error::ProxyError;
use crate::http::{
    collect_request, error_response, into_client_response, into_upstream_request, ProxyBody,
};
use crate::net::{ConnectionId, Target};
use crate::observability::ProxyEvent;
use crate::pipeline::{ExchangeContext, RequestOutcome};
use crate::proxy::upstream::{round_trip_once, UpstreamLink};
use crate::proxy::ProxyContext;
use crate::resilience::with_deadline;

/// Where the upstream response comes from.
pub enum Upstream<'a> {
    /// Dial a new connection for this exchange.
    Fresh,
    /// Reuse the tunnel's upstream link.
    Link(&'a UpstreamLink),
}

/// Run one exchange end to end and produce the client reply.
pub async fn run_exchange(
    ctx: &ProxyContext,
    connection: ConnectionId,
    req: Request<Incoming>,
    target: Target,
    tunneled: bool,
    upstream: Upstream<'_>,
) -> Response<ProxyBody> {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let head_request = method == Method::HEAD;

    let cx = ExchangeContext {
        connection,
        target,
        tunneled,
        method: method.clone(),
        uri: uri.clone(),
        sink: Arc::clone(&ctx.sink),
    };

    match with_deadline(ctx.exchange_timeout, exchange(ctx, &cx, req, upstream)).await {
        Ok(resp) => {
            ctx.sink.record(ProxyEvent::Exchange {
                connection,
                method: method.to_string(),
                uri: uri.to_string(),
                status: resp.status().as_u16(),
                elapsed: started.elapsed(),
                tunneled,
            });
            into_client_response(resp, head_request)
        }
        Err(err) => fail(ctx, connection, &err),
    }
}

async fn exchange(
    ctx: &ProxyContext,
    cx: &ExchangeContext,
    req: Request<Incoming>,
    upstream: Upstream<'_>,
) -> Result<crate::http::InterceptedResponse, ProxyError> {
    let req = collect_request(req, ctx.max_body_bytes).await?;

    let resp = match ctx.pipeline.apply_request(req, cx).await? {
        RequestOutcome::Forward(req) => {
            let req = into_upstream_request(req, &cx.target)?;
            match upstream {
                Upstream::Fresh => round_trip_once(ctx, cx.connection, &cx.target, req).await?,
                Upstream::Link(link) => link.round_trip(ctx, cx.connection, req).await?,
            }
        }
        RequestOutcome::ShortCircuit {
            transform,
            response,
        } => {
            ctx.sink.record(ProxyEvent::ShortCircuit {
                connection: cx.connection,
                transform,
                status: response.status().as_u16(),
            });
            response
        }
    };

    ctx.pipeline.apply_response(resp, cx).await
}

/// Report a failure and build the reply for it.
pub fn fail(ctx: &ProxyContext, connection: ConnectionId, err: &ProxyError) -> Response<ProxyBody> {
    let resp = error_response(err);
    ctx.sink.record(ProxyEvent::ExchangeFailed {
        connection,
        kind: err.kind(),
        error: err.to_string(),
        status: resp.status().as_u16(),
    });
    resp
}
