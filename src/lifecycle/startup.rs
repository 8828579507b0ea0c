//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Load TLS material and build the upstream transport
//! - Build the transform pipeline
//! - Bind the listener last
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The listener binds last (traffic only when ready)
//! - Tests may inject a transport, pipeline, sink or listener; production uses the config

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::loader::ConfigError;
use crate::config::validation::validate_config;
use crate::config::ProxyConfig;
use crate::error::StartupError;
use crate::http::ProxyServer;
use crate::lifecycle::Shutdown;
use crate::net::listener::Listener;
use crate::net::tls::load_acceptor;
use crate::net::{ConnectionTracker, Transport};
use crate::observability::{SharedSink, TracingSink};
use crate::pipeline::{build_pipeline, Pipeline};
use crate::proxy::{ConnectPolicy, ProxyContext};
use crate::resilience::RetryPolicy;

/// Assembles a [`ProxyServer`] from configuration.
pub struct ProxyBuilder {
    config: ProxyConfig,
    transport: Option<Transport>,
    pipeline: Option<Pipeline>,
    sink: SharedSink,
    shutdown: Shutdown,
    listener: Option<TcpListener>,
}

impl ProxyBuilder {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            transport: None,
            pipeline: None,
            sink: Arc::new(TracingSink),
            shutdown: Shutdown::new(),
            listener: None,
        }
    }

    /// Use this transport instead of one built from `upstream`.
    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use this pipeline instead of one built from `pipeline`.
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Serve on an already bound socket instead of `listener.bind_address`.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Run every startup step in order and bind.
    pub async fn bind(self) -> Result<ProxyServer, StartupError> {
        let config = self.config;

        validate_config(&config).map_err(ConfigError::Validation)?;
        tracing::info!(
            bind_address = %config.listener.bind_address,
            intercept = config.intercepts_tls(),
            "Configuration validated"
        );

        let acceptor = config.tls.as_ref().map(load_acceptor).transpose()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Transport::from_config(&config.upstream)?,
        };

        let pipeline = match self.pipeline {
            Some(pipeline) => pipeline,
            None => build_pipeline(&config.pipeline)?,
        };
        tracing::info!(
            request = ?pipeline.request_names(),
            response = ?pipeline.response_names(),
            "Pipeline built"
        );

        let listener = match self.listener {
            Some(listener) => Listener::from_listener(listener, config.listener.max_connections)?,
            None => Listener::bind(&config.listener).await?,
        };

        let ctx = ProxyContext {
            transport,
            retry: RetryPolicy::from_config(&config.upstream.retry),
            pipeline,
            policy: ConnectPolicy::from_config(&config.tunnel, acceptor.is_some()),
            acceptor,
            sink: self.sink,
            max_body_bytes: config.limits.max_body_bytes,
            exchange_timeout: config.upstream.exchange_timeout(),
            idle_timeout: config.tunnel.idle_timeout(),
            tracker: ConnectionTracker::new(),
            shutdown: self.shutdown,
        };

        Ok(ProxyServer::new(listener, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;

    fn local_config() -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "127.0.0.1:0".into();
        config
    }

    #[tokio::test]
    async fn binds_with_defaults() {
        let server = ProxyBuilder::new(local_config()).bind().await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let mut config = local_config();
        config.tunnel.allow_hosts.clear();

        let err = ProxyBuilder::new(config).bind().await.err().unwrap();
        assert!(matches!(err, StartupError::Config(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn missing_tls_material_is_fatal() {
        let mut config = local_config();
        config.tls = Some(TlsConfig {
            cert_path: "/nonexistent/certificate.crt".into(),
            key_path: "/nonexistent/private.key".into(),
        });

        let err = ProxyBuilder::new(config).bind().await.err().unwrap();
        assert!(matches!(err, StartupError::Tls(_)));
    }

    #[tokio::test]
    async fn missing_pipeline_secret_is_fatal() {
        let mut config = local_config();
        config.pipeline.request.push(crate::config::RequestTransformConfig::InjectCookie {
            name: "session".into(),
            cookie: "JSESSIONID".into(),
            value: None,
            value_env: Some("INTERCEPTING_PROXY_TEST_UNSET_VAR".into()),
        });

        let err = ProxyBuilder::new(config).bind().await.err().unwrap();
        assert!(matches!(err, StartupError::Pipeline(_)));
    }
}
