//! Process-local circuit breaker over the fast text provider's rate-limit
//! signal. Deliberately not centralized: it reflects this replica's own
//! view of upstream health (§9 design notes).

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::BreakerConfig;

#[derive(Debug, Serialize)]
pub struct BreakerStatus {
    pub consecutive_429: u32,
    pub open: bool,
    pub retry_after_seconds: u64,
}

struct BreakerState {
    consecutive_429: u32,
    open_until: Option<Instant>,
}

pub struct CircuitBreaker {
    threshold_429: u32,
    open_duration: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold_429: config.threshold_429,
            open_duration: Duration::from_secs(config.open_seconds),
            state: Mutex::new(BreakerState {
                consecutive_429: 0,
                open_until: None,
            }),
        }
    }

    pub async fn is_open(&self) -> bool {
        let state = self.state.lock().await;
        is_open_at(&state, Instant::now())
    }

    /// Returns `true` if this call just tripped the breaker open.
    pub async fn record_rate_limited(&self) -> bool {
        let mut state = self.state.lock().await;
        state.consecutive_429 += 1;
        if state.consecutive_429 >= self.threshold_429 {
            state.open_until = Some(Instant::now() + self.open_duration);
            return true;
        }
        false
    }

    pub async fn record_non_429_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_429 = 0;
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_429 = 0;
        state.open_until = None;
    }

    pub async fn status(&self) -> BreakerStatus {
        let state = self.state.lock().await;
        let now = Instant::now();
        let retry_after_seconds = state
            .open_until
            .map(|until| until.saturating_duration_since(now).as_secs())
            .unwrap_or(0);
        BreakerStatus {
            consecutive_429: state.consecutive_429,
            open: is_open_at(&state, now),
            retry_after_seconds,
        }
    }
}

fn is_open_at(state: &BreakerState, now: Instant) -> bool {
    state.open_until.is_some_and(|until| now < until)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, open_seconds: u64) -> BreakerConfig {
        BreakerConfig {
            threshold_429: threshold,
            open_seconds,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_429s() {
        let breaker = CircuitBreaker::new(&config(2, 60));
        assert!(!breaker.record_rate_limited().await);
        assert!(!breaker.is_open().await);
        assert!(breaker.record_rate_limited().await);
        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn non_429_failure_resets_counter_without_opening() {
        let breaker = CircuitBreaker::new(&config(2, 60));
        breaker.record_rate_limited().await;
        breaker.record_non_429_failure().await;
        let status = breaker.status().await;
        assert_eq!(status.consecutive_429, 0);
        assert!(!status.open);
    }

    #[tokio::test]
    async fn success_resets_open_state() {
        let breaker = CircuitBreaker::new(&config(1, 60));
        breaker.record_rate_limited().await;
        assert!(breaker.is_open().await);
        breaker.record_success().await;
        assert!(!breaker.is_open().await);
        assert_eq!(breaker.status().await.consecutive_429, 0);
    }

    #[tokio::test]
    async fn retry_after_is_positive_while_open() {
        let breaker = CircuitBreaker::new(&config(1, 60));
        breaker.record_rate_limited().await;
        let status = breaker.status().await;
        assert!(status.open);
        assert!(status.retry_after_seconds >= 1);
    }
}
