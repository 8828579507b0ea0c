//! Plain (non-CONNECT) proxy requests.
//!
//! Only absolute-form targets (`GET http://host/path HTTP/1.1`) are proxied.
//! Origin-form requests are answered with 400: this is a forward proxy, not
//! an origin server. `Host` is rewritten from the request target before any
//! transform runs.

use std::sync::Arc;

use http::uri::Scheme;
use http::{Request, Response};
use hyper::body::Incoming;

use crate::http::{default_port, plain_target, set_host, ProxyBody};
use crate::net::ConnectionId;
use crate::observability::{ProxyEvent, RequestKind};
use crate::proxy::exchange::{fail, run_exchange, Upstream};
use crate::proxy::ProxyContext;

pub async fn handle_plain(
    ctx: Arc<ProxyContext>,
    connection: ConnectionId,
    mut req: Request<Incoming>,
) -> Response<ProxyBody> {
    let target = match plain_target(req.uri()) {
        Ok(target) => target,
        Err(err) => return fail(&ctx, connection, &err),
    };
    if let Err(err) = set_host(req.headers_mut(), &target, default_port(&Scheme::HTTP)) {
        return fail(&ctx, connection, &err);
    }

    ctx.sink.record(ProxyEvent::Classified {
        connection,
        kind: RequestKind::Plain,
        target: target.to_string(),
    });

    run_exchange(&ctx, connection, req, target, false, Upstream::Fresh).await
}
