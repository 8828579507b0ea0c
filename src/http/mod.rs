//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, hyper HTTP/1.1 with upgrades)
//!     → proxy::dispatch (CONNECT or plain)
//!     → request.rs (buffer, strip hop-by-hop, origin-form for upstream)
//!     → response.rs (buffer upstream reply, error replies)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{
    collect_request, default_port, into_upstream_request, plain_target, set_host,
    strip_hop_by_hop, tunneled_uri, InterceptedRequest, ProxyBody,
};
pub use response::{
    collect_response, connection_established, error_response, into_client_response, synthetic,
    InterceptedResponse,
};
pub use server::ProxyServer;
