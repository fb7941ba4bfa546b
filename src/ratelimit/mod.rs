//! Per-provider rate-limit state machine (spec §4.10).
//!
//! The controller performs no I/O itself: it only tracks whether a provider
//! is currently gated and schedules when the gate should be considered
//! expired. The actual retry is just the next caller's ordinary request
//! going through once `is_limited` returns false again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::cache::Provider;

/// HTTP statuses the providers use to signal rate limiting.
pub const RATE_LIMIT_STATUSES: [u16; 3] = [403, 429, 509];

/// Backoff schedule in minutes; the last value repeats once exhausted.
pub const BACKOFF_MINUTES: [i64; 5] = [5, 10, 15, 20, 30];

/// Tunables for the controller.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_retries: 20 }
    }
}

/// A provider's state while gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitedState {
    pub first_seen: DateTime<Utc>,
    pub retry_attempt: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_status_code: u16,
}

/// Event payload handed to the `on_rate_limit`/`on_retry` callbacks.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEvent {
    pub provider: Provider,
    pub retry_attempt: u32,
    pub next_retry_at: DateTime<Utc>,
    pub status_code: u16,
}

/// Callbacks the controller fires on state transitions, driving the UI
/// banner described in spec §7. Async so an embedder can forward the event
/// to a UI channel or persist it without blocking the controller's lock
/// any longer than necessary. Default methods are no-ops so embedders only
/// need to implement what they care about.
#[async_trait]
pub trait RateLimitListener: Send + Sync {
    async fn on_rate_limit(&self, _event: RateLimitEvent) {}
    async fn on_recovered(&self, _provider: Provider) {}
    async fn on_retry(&self, _event: RateLimitEvent) {}
}

/// A listener that does nothing, the default when no callbacks are wired.
pub struct NoopListener;
#[async_trait]
impl RateLimitListener for NoopListener {}

/// The rate-limit controller (C10): a small per-provider critical section
/// plus whatever listener the embedder registered.
pub struct RateLimitController {
    config: RateLimitConfig,
    state: Mutex<HashMap<Provider, LimitedState>>,
    listener: Arc<dyn RateLimitListener>,
}

impl RateLimitController {
    pub fn new(config: RateLimitConfig, listener: Arc<dyn RateLimitListener>) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
            listener,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default(), Arc::new(NoopListener))
    }

    /// Whether the given provider is currently gated. Downloads must check
    /// this before issuing a request (spec §4.10).
    pub async fn is_limited(&self, provider: Provider) -> bool {
        let state = self.state.lock().await;
        match state.get(&provider) {
            Some(limited) => Utc::now() < limited.next_retry_at,
            None => false,
        }
    }

    /// Record an HTTP response's status code for `provider`, transitioning
    /// the state machine and firing the appropriate callback.
    pub async fn record_response(&self, provider: Provider, status: u16) {
        let mut state = self.state.lock().await;

        if RATE_LIMIT_STATUSES.contains(&status) {
            let now = Utc::now();
            let retry_attempt = state
                .get(&provider)
                .map(|s| (s.retry_attempt + 1).min(self.config.max_retries))
                .unwrap_or(0);
            let first_seen = state.get(&provider).map(|s| s.first_seen).unwrap_or(now);
            let backoff_minutes = BACKOFF_MINUTES
                .get(retry_attempt as usize)
                .copied()
                .unwrap_or(*BACKOFF_MINUTES.last().unwrap());
            // A bounded jitter keeps many clients backing off on the same
            // schedule from retrying in lockstep, without risking a jump
            // into the next tier: the jitter ceiling (20% of the tier) is
            // well under the 5-minute gap between tiers.
            let base_seconds = backoff_minutes * 60;
            let jitter_ceiling = (base_seconds / 5).max(1) as u64;
            let jitter_seconds = rand::random::<u64>() % jitter_ceiling;
            let next_retry_at =
                now + chrono::Duration::seconds(base_seconds) + chrono::Duration::seconds(jitter_seconds as i64);

            let limited = LimitedState {
                first_seen,
                retry_attempt,
                next_retry_at,
                last_status_code: status,
            };
            state.insert(provider, limited);

            self.listener
                .on_rate_limit(RateLimitEvent {
                    provider,
                    retry_attempt,
                    next_retry_at,
                    status_code: status,
                })
                .await;
            return;
        }

        // Any other non-5xx success clears the gate.
        if (200..300).contains(&status) && state.remove(&provider).is_some() {
            self.listener.on_recovered(provider).await;
        }
    }

    /// Manually clear the gate so the next request proceeds immediately.
    pub async fn manual_retry(&self, provider: Provider) {
        let mut state = self.state.lock().await;
        if let Some(limited) = state.remove(&provider) {
            self.listener
                .on_retry(RateLimitEvent {
                    provider,
                    retry_attempt: limited.retry_attempt,
                    next_retry_at: Utc::now(),
                    status_code: limited.last_status_code,
                })
                .await;
        }
    }

    pub async fn state_of(&self, provider: Provider) -> Option<LimitedState> {
        self.state.lock().await.get(&provider).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingListener {
        rate_limits: AtomicU32,
        recoveries: AtomicU32,
        retries: AtomicU32,
    }

    impl CountingListener {
        fn new() -> Self {
            Self {
                rate_limits: AtomicU32::new(0),
                recoveries: AtomicU32::new(0),
                retries: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RateLimitListener for CountingListener {
        async fn on_rate_limit(&self, _event: RateLimitEvent) {
            self.rate_limits.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_recovered(&self, _provider: Provider) {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_retry(&self, _event: RateLimitEvent) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn healthy_provider_is_not_limited() {
        let controller = RateLimitController::with_defaults();
        assert!(!controller.is_limited(Provider::GoogleEarth).await);
    }

    #[tokio::test]
    async fn rate_limit_response_gates_provider() {
        let controller = RateLimitController::with_defaults();
        controller.record_response(Provider::GoogleEarth, 429).await;
        assert!(controller.is_limited(Provider::GoogleEarth).await);
    }

    #[tokio::test]
    async fn backoff_grows_monotonically_across_failures() {
        // spec §8 scenario 6: two successive 429s produce strictly growing
        // next_retry_at / retry_attempt.
        let controller = RateLimitController::with_defaults();
        controller.record_response(Provider::GoogleEarth, 429).await;
        let first = controller.state_of(Provider::GoogleEarth).await.unwrap();
        assert_eq!(first.retry_attempt, 0);

        controller.record_response(Provider::GoogleEarth, 429).await;
        let second = controller.state_of(Provider::GoogleEarth).await.unwrap();
        assert_eq!(second.retry_attempt, 1);
        assert!(second.next_retry_at > first.next_retry_at);
    }

    #[tokio::test]
    async fn manual_retry_clears_gate_immediately() {
        let listener = Arc::new(CountingListener::new());
        let controller = RateLimitController::new(RateLimitConfig::default(), listener.clone());
        controller.record_response(Provider::GoogleEarth, 429).await;
        assert!(controller.is_limited(Provider::GoogleEarth).await);

        controller.manual_retry(Provider::GoogleEarth).await;
        assert!(!controller.is_limited(Provider::GoogleEarth).await);
        assert_eq!(listener.retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_limited_fires_recovered() {
        let listener = Arc::new(CountingListener::new());
        let controller = RateLimitController::new(RateLimitConfig::default(), listener.clone());
        controller.record_response(Provider::GoogleEarth, 429).await;
        controller.record_response(Provider::GoogleEarth, 200).await;

        assert!(!controller.is_limited(Provider::GoogleEarth).await);
        assert_eq!(listener.recoveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_caps_at_last_value_after_exhausting_schedule() {
        let controller = RateLimitController::new(
            RateLimitConfig { max_retries: 2 },
            Arc::new(NoopListener),
        );
        for _ in 0..10 {
            controller.record_response(Provider::GoogleEarth, 429).await;
        }
        let state = controller.state_of(Provider::GoogleEarth).await.unwrap();
        assert_eq!(state.retry_attempt, 2);
    }
}
