//! Shared rate limiting for bandwidth and throughput caps

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Token-bucket rate limiter shared across concurrent jobs.
///
/// `acquire` deducts tokens immediately and sleeps off any deficit, so large
/// single acquisitions (an object bigger than one second of bandwidth) are
/// allowed and simply pay their debt before the next caller proceeds. A rate
/// of zero disables the throttle. Accounting is thread-safe under arbitrary
/// concurrent acquire calls from unrelated jobs.
#[derive(Debug)]
pub struct Throttle {
    state: Mutex<ThrottleState>,
}

#[derive(Debug)]
struct ThrottleState {
    /// Units per second; zero means unlimited
    rate: u64,
    /// Available tokens; may go negative while debt is being paid off
    available: f64,
    last_refill: Instant,
}

impl Throttle {
    /// Create a throttle capped at `rate` units per second
    pub fn new(rate: u64) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                rate,
                available: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Current rate cap in units per second
    pub fn rate(&self) -> u64 {
        self.state.lock().unwrap().rate
    }

    /// Change the rate cap; takes effect for subsequent acquisitions
    pub fn set_rate(&self, rate: u64) {
        let mut state = self.state.lock().unwrap();
        state.rate = rate;
        state.available = state.available.min(rate as f64);
    }

    /// Consume `amount` units, sleeping as long as the rate cap requires
    pub async fn acquire(&self, amount: u64) {
        let wait = {
            let mut state = self.state.lock().unwrap();
            if state.rate == 0 || amount == 0 {
                return;
            }
            let rate = state.rate as f64;
            let now = Instant::now();
            let refill = now.duration_since(state.last_refill).as_secs_f64() * rate;
            state.last_refill = now;
            // Burst capacity is one second of rate
            state.available = (state.available + refill).min(rate);
            state.available -= amount as f64;
            if state.available < 0.0 {
                Duration::from_secs_f64(-state.available / rate)
            } else {
                Duration::ZERO
            }
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let throttle = Throttle::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            throttle.acquire(1_000_000).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_rate_converges() {
        // 10_000 units/s with a 10_000 burst: 30_000 extra units should take
        // roughly three seconds
        let throttle = Throttle::new(10_000);
        let start = Instant::now();
        let mut acquired = 0u64;
        while acquired < 40_000 {
            throttle.acquire(2_000).await;
            acquired += 2_000;
        }
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed > 2.0, "finished too fast: {elapsed}s");
        assert!(elapsed < 6.0, "finished too slow: {elapsed}s");
    }

    #[tokio::test]
    async fn test_shared_across_tasks_sums_to_rate() {
        let throttle = Arc::new(Throttle::new(20_000));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = throttle.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    t.acquire(1_000).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 40_000 units at 20_000/s with a 20_000 burst: at least ~1 second
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed > 0.7, "finished too fast: {elapsed}s");
        assert!(elapsed < 4.0, "finished too slow: {elapsed}s");
    }

    #[tokio::test]
    async fn test_oversized_acquisition_allowed() {
        let throttle = Throttle::new(1_000);
        // Two seconds of debt in one call; the call itself pays it off
        let start = Instant::now();
        throttle.acquire(3_000).await;
        assert!(start.elapsed() >= Duration::from_millis(1_800));
    }
}
