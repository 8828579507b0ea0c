//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (connection IDs, drain tracking)
//!     → Hand off to HTTP layer
//!
//! Outgoing connection
//!     → transport.rs (dial with timeout + keep-alive, optional TLS client)
//!
//! Intercepted tunnel
//!     → tls.rs (certificate/key loaded once at startup)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Every connection carries an ID that correlates its log events
//! - TLS material problems are startup errors, never per-connection ones

pub mod connection;
pub mod listener;
pub mod tls;
pub mod transport;

pub use connection::{ConnectionId, ConnectionTracker};
pub use transport::{Target, Transport};
