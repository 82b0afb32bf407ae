//! Resilience patterns for provider calls.
//!
//! Provides circuit breaker and retry logic with exponential backoff. The
//! engine wraps every provider call in a [`RetryExecutor`]; one
//! [`CircuitBreaker`] per leaf kind stops hammering an endpoint that keeps
//! failing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::types::LeafKind;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operations flow normally.
    Closed,
    /// Operations are rejected without reaching the provider.
    Open,
    /// A limited number of probe operations are let through.
    HalfOpen,
}

impl CircuitState {
    /// Whether operations are allowed in this state.
    pub fn allows_operations(&self) -> bool {
        !matches!(self, CircuitState::Open)
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit.
    pub failure_threshold: u32,
    /// Duration the circuit stays open before transitioning to half-open.
    pub open_duration: Duration,
    /// Number of successful probes required to close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Circuit breaker protecting calls against one leaf kind's endpoint.
///
/// Prevents cascading failures when a provider endpoint is unavailable.
#[derive(Debug)]
pub struct CircuitBreaker {
    kind: LeafKind,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(kind: LeafKind, config: CircuitBreakerConfig) -> Self {
        Self {
            kind,
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: AtomicU64::new(0),
        }
    }

    /// Create a new circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults(kind: LeafKind) -> Self {
        Self::new(kind, CircuitBreakerConfig::default())
    }

    /// The leaf kind this circuit breaker is protecting.
    pub fn kind(&self) -> LeafKind {
        self.kind
    }

    /// Get the current circuit state.
    pub async fn state(&self) -> CircuitState {
        self.maybe_transition_to_half_open().await;
        *self.state.read().await
    }

    /// Check if operations are currently allowed.
    pub async fn is_allowed(&self) -> bool {
        self.state().await.allows_operations()
    }

    /// Record a successful operation.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;

        match *state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.success_threshold {
                    debug!(
                        kind = %self.kind,
                        successes = count,
                        "Circuit breaker transitioning to CLOSED"
                    );
                    *state = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::SeqCst);
                    self.success_count.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;

        match *state {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    warn!(
                        kind = %self.kind,
                        failures = count,
                        "Circuit breaker transitioning to OPEN"
                    );
                    *state = CircuitState::Open;
                    self.last_failure_time.store(unix_now_secs(), Ordering::SeqCst);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    kind = %self.kind,
                    "Circuit breaker transitioning back to OPEN after probe failure"
                );
                *state = CircuitState::Open;
                self.success_count.store(0, Ordering::SeqCst);
                self.last_failure_time.store(unix_now_secs(), Ordering::SeqCst);
            }
            CircuitState::Open => {
                self.last_failure_time.store(unix_now_secs(), Ordering::SeqCst);
            }
        }
    }

    /// Check if we should transition from Open to `HalfOpen`.
    async fn maybe_transition_to_half_open(&self) {
        let state = *self.state.read().await;
        if state != CircuitState::Open {
            return;
        }

        let last_failure = self.last_failure_time.load(Ordering::SeqCst);
        if unix_now_secs().saturating_sub(last_failure) >= self.config.open_duration.as_secs() {
            let mut state = self.state.write().await;
            if *state == CircuitState::Open {
                debug!(kind = %self.kind, "Circuit breaker transitioning to HALF_OPEN");
                *state = CircuitState::HalfOpen;
                self.success_count.store(0, Ordering::SeqCst);
            }
        }
    }

    /// Execute an operation with circuit breaker protection.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> ProviderResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ProviderResult<T>>,
    {
        if !self.is_allowed().await {
            return Err(ProviderError::CircuitOpen { kind: self.kind });
        }

        match operation().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(e) => {
                if e.is_transient() {
                    self.record_failure().await;
                }
                Err(e)
            }
        }
    }

    /// Reset the circuit breaker to closed state.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
    }
}

/// One circuit breaker per leaf kind.
///
/// Built once by the composition root and shared by every caller that
/// talks to a provider directory, so failures observed by one caller trip
/// the breaker for all of them.
#[derive(Debug)]
pub struct CircuitBreakerSet {
    breakers: BTreeMap<LeafKind, CircuitBreaker>,
}

impl CircuitBreakerSet {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let breakers = LeafKind::ALL
            .into_iter()
            .map(|kind| (kind, CircuitBreaker::new(kind, config.clone())))
            .collect();
        Self { breakers }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// The breaker protecting one leaf kind. Every kind has one.
    pub fn breaker(&self, kind: LeafKind) -> &CircuitBreaker {
        &self.breakers[&kind]
    }
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Retry executor with exponential backoff.
///
/// Only transient errors are retried; permanent errors surface immediately.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create a new retry executor with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Calculate delay for a given attempt (0-indexed).
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        let delay_ms = base_delay.min(self.config.max_delay.as_millis() as f64);

        let final_delay = if self.config.jitter {
            // Add up to 25% jitter
            let jitter_factor = 1.0 + (rand_simple() * 0.25);
            delay_ms * jitter_factor
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Execute an operation with retries.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ProviderResult<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !e.is_transient() || attempt == self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.calculate_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::operation_failed("Max retries exceeded")))
    }

    /// Execute an operation with retries and circuit breaker protection.
    pub async fn execute_with_circuit_breaker<F, Fut, T>(
        &self,
        circuit_breaker: &CircuitBreaker,
        mut operation: F,
    ) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ProviderResult<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match circuit_breaker.execute(&mut operation).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    // Don't retry if circuit is open
                    if matches!(e, ProviderError::CircuitOpen { .. }) {
                        return Err(e);
                    }

                    if !e.is_transient() || attempt == self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.calculate_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::operation_failed("Max retries exceeded")))
    }
}

/// Simple pseudo-random number generator for jitter.
/// Not cryptographically secure, but sufficient for jitter.
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let cb = CircuitBreaker::with_defaults(LeafKind::Cluster);
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.is_allowed().await);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_secs(1),
            success_threshold: 1,
        };
        let cb = CircuitBreaker::new(LeafKind::Service, config);

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test]
    async fn test_circuit_breaker_success_resets_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            open_duration: Duration::from_secs(1),
            success_threshold: 1,
        };
        let cb = CircuitBreaker::new(LeafKind::Service, config);

        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;

        // Success should reset failure count
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_reset() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
            success_threshold: 1,
        };
        let cb = CircuitBreaker::new(LeafKind::LoadBalancer, config);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breaker_set_isolates_kinds() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
            success_threshold: 1,
        };
        let set = CircuitBreakerSet::new(config);

        set.breaker(LeafKind::Cluster).record_failure().await;

        assert_eq!(set.breaker(LeafKind::Cluster).state().await, CircuitState::Open);
        assert_eq!(set.breaker(LeafKind::Service).state().await, CircuitState::Closed);
        assert_eq!(set.breaker(LeafKind::Service).kind(), LeafKind::Service);
    }

    #[tokio::test]
    async fn test_retry_executor_succeeds_first_try() {
        let executor = RetryExecutor::with_defaults();
        let call_count = AtomicUsize::new(0);

        let result = executor
            .execute(|| {
                call_count.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ProviderError>(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_executor_retries_on_transient_error() {
        let config = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let executor = RetryExecutor::new(config);
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let result = executor
            .execute(move || {
                let count = call_count_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err(ProviderError::Throttled {
                            message: "slow down".to_string(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_executor_fails_on_permanent_error() {
        let executor = RetryExecutor::with_defaults();
        let call_count = AtomicUsize::new(0);

        let result: ProviderResult<i32> = executor
            .execute(|| {
                call_count.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::invalid_payload(
                        LeafKind::Listener,
                        "port out of range",
                    ))
                }
            })
            .await;

        assert!(result.is_err());
        // Should not retry permanent errors
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_calculate_delay_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let executor = RetryExecutor::new(config);

        assert_eq!(executor.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(executor.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(executor.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(executor.calculate_delay(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_calculate_delay_respects_max() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let executor = RetryExecutor::new(config);

        // 100 * 2^5 = 3200, should be capped at 500
        assert_eq!(executor.calculate_delay(5), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_circuit_breaker_rejects_when_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
            success_threshold: 1,
        };
        let cb = CircuitBreaker::new(LeafKind::Cluster, config);

        // Open the circuit
        let _ = cb
            .execute(|| async {
                Err::<(), _>(ProviderError::Unavailable {
                    message: "down".to_string(),
                })
            })
            .await;

        // Next call should be rejected
        let result = cb.execute(|| async { Ok::<_, ProviderError>(42) }).await;

        assert!(matches!(result, Err(ProviderError::CircuitOpen { .. })));
    }
}
