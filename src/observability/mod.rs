//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection handlers
//!     → events.rs (ProxyEvent → injected EventSink)
//!         → TracingSink → logging.rs subscriber (pretty or JSON)
//!                       → metrics.rs (Prometheus counters)
//!         → RecordingSink (tests)
//! ```
//!
//! # Design Decisions
//! - The sink is passed to handlers, not reached through a global
//! - One event per significant state transition, each tagged with a connection ID
//! - Metrics are cheap (atomic increments) and off unless enabled

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{
    DialOutcome, EventSink, ProxyEvent, RecordingSink, RelayEnd, RequestKind, SharedSink,
    TracingSink,
};
