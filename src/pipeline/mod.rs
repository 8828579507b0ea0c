//! Transform pipeline.
//!
//! # Data Flow
//! ```text
//! InterceptedRequest
//!     → request transforms, left to right
//!         → Forward(req')            → upstream
//!         → Respond(resp)            → upstream skipped, remaining request stages skipped
//! InterceptedResponse (upstream or synthetic)
//!     → response transforms, left to right
//!     → client
//! ```
//!
//! # Design Decisions
//! - Transforms are synchronous functions over owned messages
//! - Each stage is identified by a stable name for logging
//! - With a stage budget, each stage runs on the blocking pool under a timeout;
//!   a stage that overruns aborts the exchange

pub mod cookies;
pub mod transforms;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, Uri};
use thiserror::Error;

use crate::error::ProxyError;
use crate::http::{InterceptedRequest, InterceptedResponse};
use crate::net::{ConnectionId, Target};
use crate::observability::SharedSink;

pub use transforms::{build_pipeline, build_pipeline_with_env};

/// Read-only facts about the exchange a transform is running in.
#[derive(Clone)]
pub struct ExchangeContext {
    pub connection: ConnectionId,
    pub target: Target,
    /// True when the exchange was decrypted from a CONNECT tunnel.
    pub tunneled: bool,
    pub method: Method,
    pub uri: Uri,
    /// Where transforms that observe traffic report it.
    pub sink: SharedSink,
}

impl fmt::Debug for ExchangeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeContext")
            .field("connection", &self.connection)
            .field("target", &self.target)
            .field("tunneled", &self.tunneled)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

/// Failure raised by a transform. The exchange is aborted.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransformError(String);

impl TransformError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// What a request transform decided.
#[derive(Debug)]
pub enum RequestAction {
    /// Continue with this (possibly modified) request.
    Forward(InterceptedRequest),
    /// Answer the client directly; the upstream is never contacted.
    Respond(InterceptedResponse),
}

/// `(Request) -> Request`, or a short-circuit response.
pub trait RequestTransform: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn transform(
        &self,
        req: InterceptedRequest,
        cx: &ExchangeContext,
    ) -> Result<RequestAction, TransformError>;
}

/// `(Response) -> Response`.
pub trait ResponseTransform: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn transform(
        &self,
        resp: InterceptedResponse,
        cx: &ExchangeContext,
    ) -> Result<InterceptedResponse, TransformError>;
}

struct FnRequest<F> {
    name: String,
    f: F,
}

impl<F> RequestTransform for FnRequest<F>
where
    F: Fn(InterceptedRequest, &ExchangeContext) -> Result<RequestAction, TransformError>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        req: InterceptedRequest,
        cx: &ExchangeContext,
    ) -> Result<RequestAction, TransformError> {
        (self.f)(req, cx)
    }
}

struct FnResponse<F> {
    name: String,
    f: F,
}

impl<F> ResponseTransform for FnResponse<F>
where
    F: Fn(InterceptedResponse, &ExchangeContext) -> Result<InterceptedResponse, TransformError>
        + Send
        + Sync
        + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        resp: InterceptedResponse,
        cx: &ExchangeContext,
    ) -> Result<InterceptedResponse, TransformError> {
        (self.f)(resp, cx)
    }
}

/// Wrap a closure as a named request transform.
pub fn request_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn RequestTransform>
where
    F: Fn(InterceptedRequest, &ExchangeContext) -> Result<RequestAction, TransformError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnRequest { name: name.into(), f })
}

/// Wrap a closure as a named response transform.
pub fn response_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn ResponseTransform>
where
    F: Fn(InterceptedResponse, &ExchangeContext) -> Result<InterceptedResponse, TransformError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnResponse { name: name.into(), f })
}

/// Result of the request stage.
#[derive(Debug)]
pub enum RequestOutcome {
    Forward(InterceptedRequest),
    ShortCircuit {
        transform: String,
        response: InterceptedResponse,
    },
}

/// Errors building a pipeline from configuration.
#[derive(Debug, Error)]
pub enum PipelineBuildError {
    #[error("transform `{transform}`: environment variable `{var}` is not set")]
    MissingEnv { transform: String, var: String },

    #[error("transform `{transform}`: {reason}")]
    Invalid { transform: String, reason: String },
}

/// Ordered request and response transforms.
#[derive(Clone, Default)]
pub struct Pipeline {
    request: Vec<Arc<dyn RequestTransform>>,
    response: Vec<Arc<dyn ResponseTransform>>,
    stage_budget: Option<Duration>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("request", &self.request_names())
            .field("response", &self.response_names())
            .field("stage_budget", &self.stage_budget)
            .finish()
    }
}

impl Pipeline {
    /// An empty pipeline that runs stages inline.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request(mut self, transform: Arc<dyn RequestTransform>) -> Self {
        self.request.push(transform);
        self
    }

    pub fn with_response(mut self, transform: Arc<dyn ResponseTransform>) -> Self {
        self.response.push(transform);
        self
    }

    /// Bound every stage by `budget`. `None` runs stages inline.
    pub fn with_stage_budget(mut self, budget: Option<Duration>) -> Self {
        self.stage_budget = budget;
        self
    }

    pub fn request_names(&self) -> Vec<&str> {
        self.request.iter().map(|t| t.name()).collect()
    }

    pub fn response_names(&self) -> Vec<&str> {
        self.response.iter().map(|t| t.name()).collect()
    }

    /// Fold the request transforms over `req`.
    pub async fn apply_request(
        &self,
        mut req: InterceptedRequest,
        cx: &ExchangeContext,
    ) -> Result<RequestOutcome, ProxyError> {
        for stage in &self.request {
            let action = {
                let stage = Arc::clone(stage);
                let cx = cx.clone();
                self.run_stage(stage.name().to_string(), move || stage.transform(req, &cx))
                    .await?
            };
            match action {
                RequestAction::Forward(next) => req = next,
                RequestAction::Respond(response) => {
                    return Ok(RequestOutcome::ShortCircuit {
                        transform: stage.name().to_string(),
                        response,
                    });
                }
            }
        }
        Ok(RequestOutcome::Forward(req))
    }

    /// Fold the response transforms over `resp`.
    pub async fn apply_response(
        &self,
        mut resp: InterceptedResponse,
        cx: &ExchangeContext,
    ) -> Result<InterceptedResponse, ProxyError> {
        for stage in &self.response {
            let stage = Arc::clone(stage);
            let cx = cx.clone();
            resp = self
                .run_stage(stage.name().to_string(), move || stage.transform(resp, &cx))
                .await?;
        }
        Ok(resp)
    }

    /// Run one stage, on the blocking pool when a budget is set. An overrun
    /// abandons the stage rather than stopping it; its thread stays busy.
    async fn run_stage<T, F>(&self, name: String, f: F) -> Result<T, ProxyError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TransformError> + Send + 'static,
    {
        let result = match self.stage_budget {
            None => f(),
            Some(budget) => {
                match tokio::time::timeout(budget, tokio::task::spawn_blocking(f)).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join)) => Err(TransformError::new(format!("stage panicked: {join}"))),
                    Err(_) => return Err(ProxyError::StageTimeout { stage: name, budget }),
                }
            }
        };
        result.map_err(|e| ProxyError::Transform {
            stage: name,
            reason: e.to_string(),
        })
    }
}
