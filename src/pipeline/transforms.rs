//! Built-in transforms and the config-driven pipeline builder.

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::StatusCode;

use crate::config::{PipelineConfig, RequestTransformConfig, ResponseTransformConfig};
use crate::http::{synthetic, InterceptedRequest, InterceptedResponse};
use crate::observability::ProxyEvent;
use crate::pipeline::cookies;
use crate::pipeline::{
    ExchangeContext, Pipeline, PipelineBuildError, RequestAction, RequestTransform,
    ResponseTransform, TransformError,
};
use crate::proxy::policy::HostSet;

/// Adds a fixed cookie to every request that does not already carry one of
/// the same name.
#[derive(Debug, Clone)]
pub struct InjectCookie {
    name: String,
    cookie: String,
    value: String,
}

impl InjectCookie {
    pub fn new(name: impl Into<String>, cookie: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cookie: cookie.into(),
            value: value.into(),
        }
    }
}

impl RequestTransform for InjectCookie {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        mut req: InterceptedRequest,
        _cx: &ExchangeContext,
    ) -> Result<RequestAction, TransformError> {
        cookies::add_request_cookie(req.headers_mut(), &self.cookie, &self.value)
            .map_err(|_| TransformError::new("cookie value is not a valid header value"))?;
        Ok(RequestAction::Forward(req))
    }
}

/// Replaces one request header.
#[derive(Debug, Clone)]
pub struct SetRequestHeader {
    name: String,
    header: HeaderName,
    value: HeaderValue,
}

impl SetRequestHeader {
    pub fn new(name: impl Into<String>, header: HeaderName, value: HeaderValue) -> Self {
        Self {
            name: name.into(),
            header,
            value,
        }
    }
}

impl RequestTransform for SetRequestHeader {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        mut req: InterceptedRequest,
        _cx: &ExchangeContext,
    ) -> Result<RequestAction, TransformError> {
        req.headers_mut().insert(self.header.clone(), self.value.clone());
        Ok(RequestAction::Forward(req))
    }
}

/// Answers requests for matching hosts itself.
#[derive(Debug, Clone)]
pub struct BlockHosts {
    name: String,
    hosts: HostSet,
    status: StatusCode,
}

impl BlockHosts {
    pub fn new(name: impl Into<String>, hosts: HostSet, status: StatusCode) -> Self {
        Self {
            name: name.into(),
            hosts,
            status,
        }
    }
}

impl RequestTransform for BlockHosts {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        req: InterceptedRequest,
        cx: &ExchangeContext,
    ) -> Result<RequestAction, TransformError> {
        if self.hosts.matches(cx.target.host()) {
            let reason = self.status.canonical_reason().unwrap_or("Blocked");
            return Ok(RequestAction::Respond(synthetic(self.status, reason)));
        }
        Ok(RequestAction::Forward(req))
    }
}

/// Reports the status and every `Set-Cookie` of each response to the event sink.
#[derive(Debug, Clone)]
pub struct LogCookies {
    name: String,
}

impl LogCookies {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ResponseTransform for LogCookies {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        resp: InterceptedResponse,
        cx: &ExchangeContext,
    ) -> Result<InterceptedResponse, TransformError> {
        cx.sink.record(ProxyEvent::ResponseCookies {
            connection: cx.connection,
            host: cx.target.host().to_string(),
            status: resp.status().as_u16(),
            cookies: cookies::set_cookies(resp.headers())
                .into_iter()
                .map(|cookie| cookie.to_string())
                .collect(),
        });
        Ok(resp)
    }
}

/// Removes `Set-Cookie` headers for one cookie name.
#[derive(Debug, Clone)]
pub struct StripCookie {
    name: String,
    cookie: String,
}

impl StripCookie {
    pub fn new(name: impl Into<String>, cookie: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cookie: cookie.into(),
        }
    }
}

impl ResponseTransform for StripCookie {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        mut resp: InterceptedResponse,
        _cx: &ExchangeContext,
    ) -> Result<InterceptedResponse, TransformError> {
        cookies::remove_set_cookie(resp.headers_mut(), &self.cookie);
        Ok(resp)
    }
}

/// Replaces one response header.
#[derive(Debug, Clone)]
pub struct SetResponseHeader {
    name: String,
    header: HeaderName,
    value: HeaderValue,
}

impl SetResponseHeader {
    pub fn new(name: impl Into<String>, header: HeaderName, value: HeaderValue) -> Self {
        Self {
            name: name.into(),
            header,
            value,
        }
    }
}

impl ResponseTransform for SetResponseHeader {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(
        &self,
        mut resp: InterceptedResponse,
        _cx: &ExchangeContext,
    ) -> Result<InterceptedResponse, TransformError> {
        resp.headers_mut().insert(self.header.clone(), self.value.clone());
        Ok(resp)
    }
}

/// Build the pipeline described by `config`, reading secrets from the process environment.
pub fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline, PipelineBuildError> {
    build_pipeline_with_env(config, |var| std::env::var(var).ok())
}

/// Build the pipeline described by `config`, resolving `value_env` through `env`.
pub fn build_pipeline_with_env<E>(config: &PipelineConfig, env: E) -> Result<Pipeline, PipelineBuildError>
where
    E: Fn(&str) -> Option<String>,
{
    let mut pipeline = Pipeline::new().with_stage_budget(config.stage_budget());

    for transform in &config.request {
        let built: Arc<dyn RequestTransform> = match transform {
            RequestTransformConfig::InjectCookie {
                name,
                cookie,
                value,
                value_env,
            } => {
                let value = match (value, value_env) {
                    (Some(value), _) => value.clone(),
                    (None, Some(var)) => env(var).ok_or_else(|| PipelineBuildError::MissingEnv {
                        transform: name.clone(),
                        var: var.clone(),
                    })?,
                    (None, None) => {
                        return Err(invalid(name, "no cookie value configured"));
                    }
                };
                HeaderValue::from_str(&format!("{cookie}={value}"))
                    .map_err(|_| invalid(name, "cookie is not a valid header value"))?;
                Arc::new(InjectCookie::new(name, cookie, value))
            }
            RequestTransformConfig::SetHeader { name, header, value } => {
                let (header, value) = header_pair(name, header, value)?;
                Arc::new(SetRequestHeader::new(name, header, value))
            }
            RequestTransformConfig::BlockHosts { name, hosts, status } => {
                let status = StatusCode::from_u16(*status)
                    .map_err(|_| invalid(name, "status is out of range"))?;
                Arc::new(BlockHosts::new(name, HostSet::new(hosts), status))
            }
        };
        pipeline = pipeline.with_request(built);
    }

    for transform in &config.response {
        let built: Arc<dyn ResponseTransform> = match transform {
            ResponseTransformConfig::LogCookies { name } => Arc::new(LogCookies::new(name)),
            ResponseTransformConfig::StripCookie { name, cookie } => {
                Arc::new(StripCookie::new(name, cookie))
            }
            ResponseTransformConfig::SetHeader { name, header, value } => {
                let (header, value) = header_pair(name, header, value)?;
                Arc::new(SetResponseHeader::new(name, header, value))
            }
        };
        pipeline = pipeline.with_response(built);
    }

    Ok(pipeline)
}

fn header_pair(
    transform: &str,
    header: &str,
    value: &str,
) -> Result<(HeaderName, HeaderValue), PipelineBuildError> {
    let header = HeaderName::from_bytes(header.as_bytes())
        .map_err(|_| invalid(transform, "invalid header name"))?;
    let value = HeaderValue::from_str(value).map_err(|_| invalid(transform, "invalid header value"))?;
    Ok((header, value))
}

fn invalid(transform: &str, reason: &str) -> PipelineBuildError {
    PipelineBuildError::Invalid {
        transform: transform.to_string(),
        reason: reason.to_string(),
    }
}
