//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap a whole exchange with one deadline
//! - Cancel the exchange cleanly on timeout
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; dropping the future cancels in-flight I/O
//! - Timeout errors are distinct from other errors
//! - Timed-out exchanges return 504 Gateway Timeout

use std::future::Future;
use std::time::Duration;

use crate::error::ProxyError;

/// Run `fut` under `deadline`, mapping expiry to [`ProxyError::ExchangeTimeout`].
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::ExchangeTimeout(deadline)),
    }
}
