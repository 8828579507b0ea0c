//! Intercepting forward proxy library.
//!
//! Plain HTTP requests in absolute form are forwarded upstream. CONNECT
//! tunnels are either relayed opaquely or, when a certificate is configured,
//! decrypted so each request inside runs through the same transform pipeline.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod pipeline;
pub mod proxy;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::ProxyConfig;
pub use error::{ProxyError, StartupError};
pub use http::ProxyServer;
pub use lifecycle::{ProxyBuilder, Shutdown};
pub use pipeline::Pipeline;
