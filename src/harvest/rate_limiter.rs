//! Global request spacing shared by every download worker.
//!
//! Callers reserve a start slot under a lock and then sleep until it, so
//! concurrent workers never start two requests closer than the configured
//! spacing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RatePolicy {
    /// Minimum time between the starts of any two requests
    pub min_spacing: Duration,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Default)]
struct RateLimiterState {
    /// Earliest instant the next request may start
    next_slot: Option<Instant>,
    total_requests: u64,
    total_wait: Duration,
    penalties: u32,
}

#[derive(Debug, Clone)]
pub struct GlobalRateLimiter {
    policy: RatePolicy,
    state: Arc<Mutex<RateLimiterState>>,
}

impl GlobalRateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(RateLimiterState::default())),
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    /// Wait for the next free start slot and return it.
    pub async fn acquire(&self) -> Instant {
        let (slot, wait) = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let slot = match state.next_slot {
                Some(next) if next > now => next,
                _ => now,
            };
            state.next_slot = Some(slot + self.policy.min_spacing);
            state.total_requests += 1;
            let wait = slot - now;
            state.total_wait += wait;
            (slot, wait)
        };

        if !wait.is_zero() {
            debug!("Rate limiter waiting for {:?}", wait);
            sleep_until(slot).await;
        }
        slot
    }

    /// Hold every worker back for at least `pause`, e.g. after a 429.
    pub fn penalize(&self, pause: Duration) {
        let mut state = self.state.lock();
        let until = Instant::now() + pause;
        if state.next_slot.is_none_or(|next| next < until) {
            state.next_slot = Some(until);
        }
        state.penalties += 1;
        info!("Server asked us to slow down, pausing requests for {:?}", pause);
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let state = self.state.lock();
        RateLimiterStats {
            spacing: self.policy.min_spacing,
            total_requests: state.total_requests,
            total_wait: state.total_wait,
            penalties: state.penalties,
        }
    }
}

/// Statistics about rate limiter activity
#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub spacing: Duration,
    pub total_requests: u64,
    pub total_wait: Duration,
    pub penalties: u32,
}

impl RateLimiterStats {
    /// Format stats for display
    pub fn format_stats(&self) -> String {
        format!(
            "Spacing: {:?} | Requests: {} | Waited: {:?} | Penalties: {}",
            self.spacing, self.total_requests, self.total_wait, self.penalties
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(ms: u64) -> GlobalRateLimiter {
        GlobalRateLimiter::new(RatePolicy {
            min_spacing: Duration::from_millis(ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_starts_immediately() {
        let limiter = limiter(200);
        let start = Instant::now();
        assert_eq!(limiter.acquire().await, start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_are_spaced() {
        let limiter = limiter(200);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut starts = Vec::new();
                for _ in 0..5 {
                    limiter.acquire().await;
                    starts.push(Instant::now());
                }
                starts
            }));
        }

        let mut starts = Vec::new();
        for handle in handles {
            starts.extend(handle.await.unwrap());
        }
        starts.sort();

        assert_eq!(starts.len(), 20);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert_eq!(limiter.get_stats().total_requests, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_pushes_the_next_slot_back() {
        let limiter = limiter(100);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.penalize(Duration::from_secs(5));

        let slot = limiter.acquire().await;

        assert!(slot - start >= Duration::from_secs(5));
        assert_eq!(limiter.get_stats().penalties, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_limiter_does_not_bank_slots() {
        let limiter = limiter(100);
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let now = Instant::now();
        assert_eq!(limiter.acquire().await, now);
    }
}
