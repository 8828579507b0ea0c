//! Error taxonomy for the proxy.
//!
//! Two families:
//! - [`StartupError`]: fatal, the process exits before serving anything.
//! - [`ProxyError`]: scoped to one exchange or tunnel. Reported to the client
//!   as a status line and logged; other connections are unaffected.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::config::loader::ConfigError;
use crate::net::listener::ListenerError;
use crate::net::tls::TlsMaterialError;
use crate::pipeline::PipelineBuildError;

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS material error: {0}")]
    Tls(#[from] TlsMaterialError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineBuildError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
}

/// Errors raised while handling a single exchange or tunnel.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("dial to {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    #[error("dial to {target} failed: {reason}")]
    DialFailed { target: String, reason: String },

    #[error("TLS handshake with {peer} failed: {reason}")]
    HandshakeFailed { peer: String, reason: String },

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("transform `{stage}` failed: {reason}")]
    Transform { stage: String, reason: String },

    #[error("transform `{stage}` exceeded its {budget:?} budget")]
    StageTimeout { stage: String, budget: Duration },

    #[error("exchange exceeded its {0:?} deadline")]
    ExchangeTimeout(Duration),

    #[error("body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request to {target} denied by policy")]
    RequestDenied { target: String, status: StatusCode },
}

impl ProxyError {
    /// Status returned to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::DialTimeout { .. } | ProxyError::ExchangeTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::DialFailed { .. }
            | ProxyError::HandshakeFailed { .. }
            | ProxyError::UpstreamProtocol(_)
            | ProxyError::Transform { .. }
            | ProxyError::StageTimeout { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::RequestDenied { status, .. } => *status,
        }
    }

    /// Stable short name used in log events and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::DialTimeout { .. } => "dial_timeout",
            ProxyError::DialFailed { .. } => "dial_failed",
            ProxyError::HandshakeFailed { .. } => "handshake_failed",
            ProxyError::UpstreamProtocol(_) => "upstream_protocol",
            ProxyError::Transform { .. } => "transform",
            ProxyError::StageTimeout { .. } => "stage_timeout",
            ProxyError::ExchangeTimeout(_) => "exchange_timeout",
            ProxyError::BodyTooLarge { .. } => "body_too_large",
            ProxyError::BadRequest(_) => "bad_request",
            ProxyError::RequestDenied { .. } => "request_denied",
        }
    }

    /// Body text sent to the client. Transform failures stay generic so no
    /// internal detail leaks into the response.
    pub fn client_message(&self) -> &'static str {
        match self {
            ProxyError::DialTimeout { .. } => "Upstream connect timed out",
            ProxyError::DialFailed { .. } => "Upstream connect failed",
            ProxyError::HandshakeFailed { .. } => "Upstream TLS handshake failed",
            ProxyError::UpstreamProtocol(_) => "Upstream response was malformed",
            ProxyError::Transform { .. } | ProxyError::StageTimeout { .. } => {
                "Proxy failed to process the exchange"
            }
            ProxyError::ExchangeTimeout(_) => "Upstream exchange timed out",
            ProxyError::BodyTooLarge { .. } => "Body too large",
            ProxyError::BadRequest(_) => "Bad request",
            ProxyError::RequestDenied { .. } => "Request denied by proxy policy",
        }
    }

    /// Dial-stage failures are the only ones the retry decorator may repeat.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::DialTimeout { .. } | ProxyError::DialFailed { .. }
        )
    }
}
