//! Opaque byte relay for non-intercepted CONNECT tunnels.
//!
//! # Responsibilities
//! - Copy bytes both ways between client and upstream
//! - Stop on EOF or error from either side, on idle timeout, or on shutdown
//! - Count bytes per direction
//!
//! # Design Decisions
//! - Each direction is its own pump, so a write blocked on one peer never
//!   stops reads from the other
//! - Any traffic in either direction resets the idle timer
//! - Both write halves are shut down on exit so each peer sees EOF

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::observability::RelayEnd;

const BUFFER_SIZE: usize = 16 * 1024;

/// What one relay moved and why it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub end: RelayEnd,
    /// Client → upstream.
    pub bytes_up: u64,
    /// Upstream → client.
    pub bytes_down: u64,
}

/// Last time either pump moved data, as an offset from `origin`.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Copy `rd` into `wr` until EOF. `Ok` means the reading side closed cleanly.
async fn pump<R, W>(rd: &mut R, wr: &mut W, moved: &AtomicU64, activity: &Activity) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        moved.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }
}

/// Relay until either side closes, `idle` passes without traffic, or shutdown fires.
pub async fn relay<C, U>(
    client: C,
    upstream: U,
    idle: Duration,
    shutdown: &mut broadcast::Receiver<()>,
) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
    let bytes_up = AtomicU64::new(0);
    let bytes_down = AtomicU64::new(0);
    let activity = Activity::new();

    let end = {
        let up = pump(&mut client_rd, &mut upstream_wr, &bytes_up, &activity);
        let down = pump(&mut upstream_rd, &mut client_wr, &bytes_down, &activity);
        tokio::pin!(up, down);

        let idle_timer = tokio::time::sleep(idle);
        tokio::pin!(idle_timer);

        loop {
            tokio::select! {
                result = &mut up => break match result {
                    Ok(()) => RelayEnd::ClientClosed,
                    Err(_) => RelayEnd::Error,
                },
                result = &mut down => break match result {
                    Ok(()) => RelayEnd::UpstreamClosed,
                    Err(_) => RelayEnd::Error,
                },
                _ = &mut idle_timer => {
                    let deadline = activity.last() + idle;
                    if deadline <= Instant::now() {
                        break RelayEnd::IdleTimeout;
                    }
                    idle_timer.as_mut().reset(deadline);
                }
                _ = shutdown.recv() => break RelayEnd::Shutdown,
            }
        }
    };

    let _ = upstream_wr.shutdown().await;
    let _ = client_wr.shutdown().await;

    RelayStats {
        end,
        bytes_up: bytes_up.load(Ordering::Relaxed),
        bytes_down: bytes_down.load(Ordering::Relaxed),
    }
}
