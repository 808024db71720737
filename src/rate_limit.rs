//! Process-wide rate limiter for calls to the external claims authority.
//!
//! Sliding window (at most `max_requests` per `window`) combined with a
//! minimum spacing between consecutive requests. Every submission-engine
//! call site must acquire a slot before contacting the authority.

use crate::config::RateLimitConfig;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct LimiterState {
    recent: VecDeque<Instant>,
    last_request: Option<Instant>,
}

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    min_interval: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        RateLimiter {
            max_requests: config.max_requests as usize,
            window: Duration::from_secs(config.window_seconds),
            min_interval: Duration::from_millis(config.min_interval_ms),
            state: Mutex::new(LimiterState {
                recent: VecDeque::new(),
                last_request: None,
            }),
        }
    }

    /// Wait until a slot is available, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                match self.next_wait(&mut state) {
                    None => {
                        let now = Instant::now();
                        state.recent.push_back(now);
                        state.last_request = Some(now);
                        return;
                    }
                    Some(wait) => wait,
                }
            };
            log::debug!("rate limiter: waiting {}ms for a slot", wait.as_millis());
            tokio::time::sleep(wait).await;
        }
    }

    /// Claim a slot if one is free right now, otherwise report how long the
    /// caller would have to wait.
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        match self.next_wait(&mut state) {
            None => {
                let now = Instant::now();
                state.recent.push_back(now);
                state.last_request = Some(now);
                Ok(())
            }
            Some(wait) => Err(wait),
        }
    }

    fn next_wait(&self, state: &mut LimiterState) -> Option<Duration> {
        let now = Instant::now();

        // Drop window entries that have aged out.
        while let Some(&front) = state.recent.front() {
            if now.duration_since(front) >= self.window {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        if let Some(last) = state.last_request {
            let since_last = now.duration_since(last);
            if since_last < self.min_interval {
                return Some(self.min_interval - since_last);
            }
        }

        if state.recent.len() >= self.max_requests {
            // Window full; wait for the oldest entry to age out.
            if let Some(&oldest) = state.recent.front() {
                let remaining = self.window.saturating_sub(now.duration_since(oldest));
                return Some(remaining.max(Duration::from_millis(1)));
            }
        }

        None
    }
}
