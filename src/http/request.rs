//! Intercepted requests and their preparation for forwarding.
//!
//! # Responsibilities
//! - Buffer the client body (bounded) into an owned [`InterceptedRequest`]
//! - Strip hop-by-hop headers before forwarding
//! - Rewrite absolute-form targets to origin-form for the upstream
//!
//! # Design Decisions
//! - Bodies are fully buffered so transforms see complete messages
//! - Content-Length is recomputed from the final body

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Scheme};
use http::{Request, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;

use crate::error::ProxyError;
use crate::net::Target;

/// A fully buffered request owned by one exchange.
pub type InterceptedRequest = Request<Bytes>;

/// Body type written on the wire in both directions.
pub type ProxyBody = Full<Bytes>;

/// Why a body could not be buffered.
#[derive(Debug)]
pub enum BodyError {
    TooLarge,
    Read(String),
}

/// Buffer a body, refusing more than `limit` bytes.
pub async fn collect_body<B>(body: B, limit: usize) -> Result<Bytes, BodyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => {
            Err(BodyError::TooLarge)
        }
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

/// Buffer a client request.
pub async fn collect_request<B>(req: Request<B>, limit: usize) -> Result<InterceptedRequest, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let body = collect_body(body, limit).await.map_err(|e| match e {
        BodyError::TooLarge => ProxyError::BodyTooLarge { limit },
        BodyError::Read(reason) => ProxyError::BadRequest(format!("request body: {reason}")),
    })?;
    Ok(Request::from_parts(parts, body))
}

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any the `Connection` header names.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Default port for a scheme.
pub fn default_port(scheme: &Scheme) -> u16 {
    if *scheme == Scheme::HTTPS {
        443
    } else {
        80
    }
}

/// Upstream peer named by an absolute-form request target.
pub fn plain_target(uri: &Uri) -> Result<Target, ProxyError> {
    let authority = uri.authority().ok_or_else(|| {
        ProxyError::BadRequest("request target must be an absolute http:// URI".into())
    })?;
    let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
    if scheme != Scheme::HTTP {
        return Err(ProxyError::BadRequest(format!(
            "unsupported scheme `{scheme}` for plain proxying"
        )));
    }
    Ok(Target::from_authority(authority, default_port(&scheme)))
}

/// Absolute URI for a request seen inside an intercepted tunnel.
pub fn tunneled_uri(target: &Target, uri: &Uri) -> Result<Uri, ProxyError> {
    let path = uri
        .path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/");
    format!("https://{}{}", target.host_header(443), path)
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::BadRequest(e.to_string()))
}

/// Point `Host` at the peer the request is actually sent to.
pub fn set_host(headers: &mut HeaderMap, target: &Target, default_port: u16) -> Result<(), ProxyError> {
    let host = HeaderValue::from_str(&target.host_header(default_port))
        .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
    headers.insert(header::HOST, host);
    Ok(())
}

/// Turn an intercepted request into the one written to the upstream.
pub fn into_upstream_request(
    req: InterceptedRequest,
    target: &Target,
) -> Result<Request<ProxyBody>, ProxyError> {
    let (mut parts, body) = req.into_parts();
    let scheme = parts.uri.scheme().cloned().unwrap_or(Scheme::HTTP);

    let origin_form = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(origin_form);

    strip_hop_by_hop(&mut parts.headers);
    if !parts.headers.contains_key(header::HOST) {
        set_host(&mut parts.headers, target, default_port(&scheme))?;
    }
    if !body.is_empty() || parts.headers.contains_key(header::CONTENT_LENGTH) {
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }

    Ok(Request::from_parts(parts, Full::new(body)))
}
