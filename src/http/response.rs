//! Intercepted responses and client-facing replies.
//!
//! # Responsibilities
//! - Buffer the upstream response (bounded) into an owned [`InterceptedResponse`]
//! - Strip hop-by-hop headers before replying
//! - Map proxy errors to gateway-class replies
//!
//! # Design Decisions
//! - A failed exchange never forwards a partial upstream message
//! - Error bodies are short fixed strings

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::body::Body;

use crate::error::ProxyError;
use crate::http::request::{collect_body, strip_hop_by_hop, BodyError, ProxyBody};

/// A fully buffered response owned by one exchange.
pub type InterceptedResponse = Response<Bytes>;

/// Buffer an upstream response. Oversized or broken bodies are protocol errors.
pub async fn collect_response<B>(resp: Response<B>, limit: usize) -> Result<InterceptedResponse, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = resp.into_parts();
    let body = collect_body(body, limit).await.map_err(|e| match e {
        BodyError::TooLarge => {
            ProxyError::UpstreamProtocol(format!("response body exceeds {limit} bytes"))
        }
        BodyError::Read(reason) => ProxyError::UpstreamProtocol(format!("response body: {reason}")),
    })?;
    Ok(Response::from_parts(parts, body))
}

/// A small synthetic response, used by short-circuiting transforms.
pub fn synthetic(status: StatusCode, body: impl Into<Bytes>) -> InterceptedResponse {
    let body = body.into();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Reply sent to the client for a failed exchange.
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut resp = Response::new(Full::new(Bytes::from_static(err.client_message().as_bytes())));
    *resp.status_mut() = err.status();
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// `200 Connection Established`, the reply that opens a CONNECT tunnel.
pub fn connection_established() -> Response<ProxyBody> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    resp.extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    resp
}

/// Turn the final intercepted response into what is written to the client.
pub fn into_client_response(resp: InterceptedResponse, head_request: bool) -> Response<ProxyBody> {
    let (mut parts, body) = resp.into_parts();
    strip_hop_by_hop(&mut parts.headers);

    let status = parts.status;
    if status.is_informational() || status == StatusCode::NO_CONTENT {
        parts.headers.remove(header::CONTENT_LENGTH);
    } else if !head_request && status != StatusCode::NOT_MODIFIED {
        parts
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    }

    Response::from_parts(parts, Full::new(body))
}
