//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Exchange:
//!     → timeouts.rs (one deadline around the whole exchange)
//!     → dial to upstream
//!         → On dial failure: retries.rs (only when enabled, with backoff)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - The core makes exactly one dial attempt; retries are an opt-in decorator
//! - Only dial failures are retried. Nothing has been sent upstream yet

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{with_retries, RetryPolicy};
pub use timeouts::with_deadline;
