//! Keepalive ping scheduling and liveness detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Liveness flag for one socket, set by the reader on every inbound frame.
pub struct Liveness {
    alive: AtomicBool,
    last_seen: Mutex<Instant>,
}

impl Liveness {
    /// A fresh link counts as alive.
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Record that the remote answered.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if the remote was heard from since the last check.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the remote was last heard from.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Why the keepalive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveResult {
    /// Nothing was heard within the liveness window.
    TimedOut,
    /// The loop was cancelled externally.
    Cancelled,
    /// The ping could not be queued because the link is gone.
    LinkClosed,
}

/// Drive pings for one connection.
///
/// At each `interval` tick the alive flag is checked; a silent tick counts
/// as a miss. After `timeout / interval` consecutive misses (at least 1) the
/// link is declared dead. Otherwise a ping is queued through `send_ping`,
/// which returns `false` once the link is gone.
pub async fn run_keepalive(
    liveness: &Liveness,
    interval: Duration,
    timeout: Duration,
    send_ping: impl Fn() -> bool,
    cancel: CancellationToken,
) -> KeepaliveResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_missed = max_missed_pings(interval, timeout);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if liveness.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    tracing::debug!(missed, max_missed, "no traffic since last ping");
                    if missed >= max_missed {
                        return KeepaliveResult::TimedOut;
                    }
                }
                if !send_ping() {
                    return KeepaliveResult::LinkClosed;
                }
            }
            () = cancel.cancelled() => {
                return KeepaliveResult::Cancelled;
            }
        }
    }
}

/// Consecutive silent ticks tolerated before the link is declared dead.
#[allow(clippy::cast_possible_truncation)]
fn max_missed_pings(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    (timeout.as_millis() / interval_ms).clamp(1, u128::from(u32::MAX)) as u32
}
