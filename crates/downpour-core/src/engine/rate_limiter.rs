//! Per-worker transfer pacing.
//!
//! Instead of a token bucket, the limiter runs a virtual transmission
//! clock: every chunk reserves the next free slot on that clock, where a
//! chunk of `n` bytes costs `n / rate` seconds, and the caller sleeps
//! until its slot comes up. Idle credit is capped at a small burst window
//! so a stalled transfer cannot save up seconds of quota and blast it out
//! at once. The scheduler re-arms the limit on every lease, which is how
//! a changing `allowable_connections` reshapes the per-worker share.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How much unused quota a transfer may carry forward.
const BURST_WINDOW: Duration = Duration::from_millis(100);

/// Paces one transfer to a byte rate. Cheap to clone; clones share the
/// same virtual clock.
#[derive(Clone)]
pub struct RateLimiter {
    // None disables pacing entirely
    pacer: Option<Arc<Mutex<Pacer>>>,
}

struct Pacer {
    /// Bytes per second.
    rate: u64,
    /// When the next chunk may start transmitting.
    next_slot: Instant,
}

impl Pacer {
    /// Reserve a slot for `bytes` and return how long the caller must wait
    /// for it. The slot floor trails `now` by the burst window, so credit
    /// for idle time is bounded.
    fn reserve(&mut self, bytes: u64) -> Duration {
        let now = Instant::now();
        let cost = Duration::from_secs_f64(bytes as f64 / self.rate as f64);
        let floor = now.checked_sub(BURST_WINDOW).unwrap_or(now);
        let slot = self.next_slot.max(floor);
        self.next_slot = slot + cost;
        slot.saturating_duration_since(now)
    }
}

impl RateLimiter {
    /// A limiter capped at `bytes_per_second`; 0 means unlimited.
    pub fn new(bytes_per_second: u64) -> Self {
        if bytes_per_second == 0 || bytes_per_second == u64::MAX {
            return Self::unlimited();
        }
        Self {
            pacer: Some(Arc::new(Mutex::new(Pacer {
                rate: bytes_per_second,
                next_slot: Instant::now(),
            }))),
        }
    }

    pub fn unlimited() -> Self {
        Self { pacer: None }
    }

    /// Wait until `bytes` may be transmitted.
    pub async fn acquire(&self, bytes: u64) {
        let Some(pacer) = &self.pacer else { return };
        let wait = pacer.lock().reserve(bytes);
        if wait > Duration::ZERO {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paces_to_the_configured_rate() {
        let limiter = RateLimiter::new(1000); // 1 KB/s

        let start = Instant::now();
        limiter.acquire(500).await; // first chunk is immediate
        assert!(start.elapsed().as_millis() < 50);

        limiter.acquire(500).await; // slotted ~0.4 s out
        limiter.acquire(500).await; // slotted ~0.9 s out
        assert!(start.elapsed().as_millis() >= 800);
    }

    #[tokio::test]
    async fn idle_credit_is_capped() {
        let limiter = RateLimiter::new(10_000);
        limiter.acquire(1000).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // a long idle gap must not fund a multi-chunk burst: only the
        // burst window (plus the head chunk) goes through unpaced
        let start = Instant::now();
        limiter.acquire(2000).await;
        limiter.acquire(2000).await;
        assert!(start.elapsed().as_millis() >= 80);
    }

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(10_000).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn zero_limit_means_unlimited() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        limiter.acquire(u64::MAX / 2).await;
        assert!(start.elapsed().as_millis() < 50);
    }
}
