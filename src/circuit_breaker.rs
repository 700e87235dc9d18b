//! Per-provider circuit breaker (§4.2).
//!
//! Closed → Open → Half-Open → Closed, with atomic failure/success counters
//! so concurrent callers in Closed state never lose an increment and
//! Half-Open admission is gated by a single atomic slot counter.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::errors::ProviderError;
use crate::types::BreakerStateKind;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawState {
    Closed,
    Open,
    HalfOpen,
}

/// One breaker per provider. Cheap to clone via `Arc` at the call site; the
/// internal state lives behind atomics and a small mutex for the rare
/// transition path.
pub struct CircuitBreaker {
    provider_id: String,
    config: BreakerConfig,
    state: Mutex<RawState>,
    failures: AtomicU32,
    successes: AtomicU32,
    half_open_in_flight: AtomicU32,
    opened_at_millis: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            state: Mutex::new(RawState::Closed),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            half_open_in_flight: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BreakerStateKind {
        self.maybe_transition_open_to_half_open();
        match *self.state.lock().unwrap() {
            RawState::Closed => BreakerStateKind::Closed,
            RawState::Open => BreakerStateKind::Open,
            RawState::HalfOpen => BreakerStateKind::HalfOpen,
        }
    }

    fn maybe_transition_open_to_half_open(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != RawState::Open {
            return;
        }
        let opened_at = self.opened_at_millis.load(Ordering::SeqCst);
        let now = now_millis();
        if now.saturating_sub(opened_at) >= self.config.reset_timeout.as_millis() as u64 {
            *state = RawState::HalfOpen;
            self.failures.store(0, Ordering::SeqCst);
            self.successes.store(0, Ordering::SeqCst);
            self.half_open_in_flight.store(0, Ordering::SeqCst);
            tracing::info!(provider = %self.provider_id, "circuit breaker half-open");
        }
    }

    /// Runs `f` if the breaker admits the call, surfacing the inner error
    /// unchanged on failure or `ProviderError::CircuitOpen` on rejection.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        self.maybe_transition_open_to_half_open();

        let admitted_half_open = {
            let state = self.state.lock().unwrap();
            match *state {
                RawState::Open => false,
                RawState::Closed => true,
                RawState::HalfOpen => {
                    let prior = self.half_open_in_flight.fetch_add(1, Ordering::SeqCst);
                    if prior < self.config.half_open_max_calls {
                        true
                    } else {
                        self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
                        false
                    }
                }
            }
        };

        if !admitted_half_open {
            return Err(ProviderError::CircuitOpen(self.provider_id.clone()));
        }

        let result = f().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }

        result
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            RawState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
            }
            RawState::HalfOpen => {
                *state = RawState::Closed;
                self.failures.store(0, Ordering::SeqCst);
                self.successes.store(0, Ordering::SeqCst);
                self.half_open_in_flight.store(0, Ordering::SeqCst);
                tracing::info!(provider = %self.provider_id, "circuit breaker closed after half-open success");
            }
            RawState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            RawState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    *state = RawState::Open;
                    self.opened_at_millis.store(now_millis(), Ordering::SeqCst);
                    self.failures.store(0, Ordering::SeqCst);
                    tracing::warn!(provider = %self.provider_id, "circuit breaker opened");
                }
            }
            RawState::HalfOpen => {
                *state = RawState::Open;
                self.opened_at_millis.store(now_millis(), Ordering::SeqCst);
                self.failures.store(0, Ordering::SeqCst);
                self.half_open_in_flight.store(0, Ordering::SeqCst);
                tracing::warn!(provider = %self.provider_id, "circuit breaker reopened after half-open failure");
            }
            RawState::Open => {}
        }
    }
}

fn now_millis() -> u64 {
    static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(20),
            half_open_max_calls: 1,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("p1", fast_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ProviderError::Network("boom".into())) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerStateKind::Open);

        let result = breaker.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(ProviderError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn half_open_success_closes_breaker() {
        let breaker = CircuitBreaker::new("p1", fast_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ProviderError::Network("boom".into())) })
                .await;
        }
        assert_eq!(breaker.state(), BreakerStateKind::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerStateKind::HalfOpen);

        let result = breaker.execute(|| async { Ok::<_, ProviderError>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), BreakerStateKind::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_breaker() {
        let breaker = CircuitBreaker::new("p1", fast_config());
        for _ in 0..3 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(ProviderError::Network("boom".into())) })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerStateKind::HalfOpen);

        let _ = breaker
            .execute(|| async { Err::<(), _>(ProviderError::Network("boom again".into())) })
            .await;
        assert_eq!(breaker.state(), BreakerStateKind::Open);
    }

    #[tokio::test]
    async fn closed_state_resets_failures_on_success() {
        let breaker = CircuitBreaker::new("p1", fast_config());
        let _ = breaker
            .execute(|| async { Err::<(), _>(ProviderError::Network("boom".into())) })
            .await;
        let _ = breaker.execute(|| async { Ok::<_, ProviderError>(()) }).await;
        let _ = breaker
            .execute(|| async { Err::<(), _>(ProviderError::Network("boom".into())) })
            .await;
        let _ = breaker
            .execute(|| async { Err::<(), _>(ProviderError::Network("boom".into())) })
            .await;
        // Only 2 consecutive failures since the reset; should still be closed.
        assert_eq!(breaker.state(), BreakerStateKind::Closed);
    }
}
