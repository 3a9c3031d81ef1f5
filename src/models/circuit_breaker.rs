use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Source of "now" for the breaker. Swappable so recovery windows can be
/// exercised without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed { failures: u32 },
    Open { failures: u32, retry_in: Duration },
}

impl CircuitState {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed { failures } => write!(f, "closed ({} failures)", failures),
            CircuitState::Open { failures, retry_in } => {
                write!(f, "open ({} failures, retry in {}s)", failures, retry_in.as_secs())
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ProviderHealth {
    failures: u32,
    last_failure: Option<Instant>,
}

/// Consecutive-failure breaker keyed by provider name.
///
/// One instance is shared by every provider of a registry. A provider is open
/// while it has at least `failure_threshold` failures and the last one is no
/// older than `reset_timeout`. Recovery happens lazily: the first check after
/// the window elapsed zeroes the count and lets the provider through again.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    health: Mutex<HashMap<String, ProviderHealth>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("tracked_providers", &self.health.lock().len())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            "Creating circuit breaker with threshold {} and reset timeout {:?}",
            config.failure_threshold, config.reset_timeout
        );

        Self {
            config,
            clock,
            health: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn record_success(&self, provider: &str) {
        let mut health = self.health.lock();
        let entry = health.entry(provider.to_string()).or_default();
        let previous = std::mem::replace(&mut entry.failures, 0);

        if previous > 0 {
            debug!("Circuit breaker '{}' reset failure count from {}", provider, previous);
        }
    }

    /// Returns the failure count after this failure.
    pub fn record_failure(&self, provider: &str) -> u32 {
        let now = self.clock.now();
        let mut health = self.health.lock();
        let entry = health.entry(provider.to_string()).or_default();
        entry.failures = entry.failures.saturating_add(1);
        entry.last_failure = Some(now);

        let failures = entry.failures;
        if failures == self.config.failure_threshold {
            warn!("Circuit breaker '{}' opened due to {} consecutive failures", provider, failures);
        } else {
            debug!(
                "Circuit breaker '{}' failure count: {}/{}",
                provider, failures, self.config.failure_threshold
            );
        }
        failures
    }

    /// Check-and-maybe-reset under one lock. Calling this after the reset
    /// window has elapsed is what closes an open circuit.
    pub fn is_open(&self, provider: &str) -> bool {
        self.state(provider).is_open()
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        let now = self.clock.now();
        let mut health = self.health.lock();
        let Some(entry) = health.get_mut(provider) else {
            return CircuitState::Closed { failures: 0 };
        };

        if entry.failures < self.config.failure_threshold {
            return CircuitState::Closed { failures: entry.failures };
        }

        let elapsed = entry
            .last_failure
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);

        if elapsed > self.config.reset_timeout {
            info!(
                "Circuit breaker '{}' reset after {:?} without failures, allowing traffic",
                provider, elapsed
            );
            entry.failures = 0;
            return CircuitState::Closed { failures: 0 };
        }

        CircuitState::Open {
            failures: entry.failures,
            retry_in: self.config.reset_timeout - elapsed,
        }
    }

    /// Raw count, without the implicit reset `is_open` performs.
    pub fn failure_count(&self, provider: &str) -> u32 {
        self.health
            .lock()
            .get(provider)
            .map(|entry| entry.failures)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let now = self.clock.now();
        let health = self.health.lock();

        let mut stats: Vec<_> = health
            .iter()
            .map(|(name, entry)| CircuitBreakerStats {
                name: name.clone(),
                failure_count: entry.failures,
                failure_threshold: self.config.failure_threshold,
                since_last_failure: entry.last_failure.map(|at| now.saturating_duration_since(at)),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub since_last_failure: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker_with_clock(threshold: u32, timeout: Duration) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cb = CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: timeout,
            },
            clock.clone(),
        );
        (cb, clock)
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_provider_is_closed() {
        let (cb, _) = breaker_with_clock(3, Duration::from_secs(30));
        assert!(!cb.is_open("nobody"));
        assert_eq!(cb.failure_count("nobody"), 0);
    }

    #[test]
    fn test_circuit_breaker_closed_to_open() {
        let (cb, _) = breaker_with_clock(3, Duration::from_secs(30));

        for i in 0..3 {
            let count = cb.record_failure("openai");
            assert_eq!(count, i + 1);

            if i < 2 {
                assert!(!cb.is_open("openai"));
            } else {
                assert!(cb.is_open("openai"));
            }
        }

        assert_eq!(cb.failure_count("openai"), 3);
    }

    #[test]
    fn test_circuit_breaker_recovery_after_timeout() {
        let (cb, clock) = breaker_with_clock(3, Duration::from_secs(30));

        for _ in 0..3 {
            cb.record_failure("openai");
        }
        assert!(cb.is_open("openai"));

        // Exactly at the boundary the circuit is still open
        clock.advance(Duration::from_secs(30));
        assert!(cb.is_open("openai"));

        clock.advance(Duration::from_millis(1));
        assert!(!cb.is_open("openai"));
        assert_eq!(cb.failure_count("openai"), 0);
    }

    #[test]
    fn test_single_failure_after_recovery_counts_from_zero() {
        let (cb, clock) = breaker_with_clock(2, Duration::from_secs(10));

        cb.record_failure("anthropic");
        cb.record_failure("anthropic");
        assert!(cb.is_open("anthropic"));

        clock.advance(Duration::from_secs(11));
        assert!(!cb.is_open("anthropic"));

        cb.record_failure("anthropic");
        assert!(!cb.is_open("anthropic"));
        cb.record_failure("anthropic");
        assert!(cb.is_open("anthropic"));
    }

    #[test]
    fn test_recovery_requires_a_check() {
        let (cb, clock) = breaker_with_clock(1, Duration::from_secs(5));

        cb.record_failure("gemini");
        clock.advance(Duration::from_secs(60));

        // No check happened during the window, so nothing was reset yet
        assert_eq!(cb.failure_count("gemini"), 1);
        assert!(!cb.is_open("gemini"));
        assert_eq!(cb.failure_count("gemini"), 0);
    }

    #[test]
    fn test_success_resets_failures() {
        let (cb, _) = breaker_with_clock(3, Duration::from_secs(30));

        for _ in 0..5 {
            cb.record_failure("openai");
        }
        assert!(cb.is_open("openai"));

        cb.record_success("openai");
        assert_eq!(cb.failure_count("openai"), 0);
        assert!(!cb.is_open("openai"));
    }

    #[test]
    fn test_providers_are_tracked_independently() {
        let (cb, _) = breaker_with_clock(2, Duration::from_secs(30));

        cb.record_failure("openai");
        cb.record_failure("openai");
        cb.record_failure("anthropic");

        assert!(cb.is_open("openai"));
        assert!(!cb.is_open("anthropic"));
        assert_eq!(cb.failure_count("anthropic"), 1);
    }

    #[test]
    fn test_state_reports_retry_window() {
        let (cb, clock) = breaker_with_clock(1, Duration::from_secs(30));

        cb.record_failure("openai");
        clock.advance(Duration::from_secs(10));

        match cb.state("openai") {
            CircuitState::Open { failures, retry_in } => {
                assert_eq!(failures, 1);
                assert_eq!(retry_in, Duration::from_secs(20));
            }
            other => panic!("expected open circuit, got {:?}", other),
        }
    }

    #[test]
    fn test_stats_sorted_by_name() {
        let (cb, _) = breaker_with_clock(3, Duration::from_secs(30));

        cb.record_failure("openai");
        cb.record_success("anthropic");

        let stats = cb.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "anthropic");
        assert_eq!(stats[0].failure_count, 0);
        assert!(stats[0].since_last_failure.is_none());
        assert_eq!(stats[1].name, "openai");
        assert_eq!(stats[1].failure_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_failures_are_not_lost() {
        let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1000,
            reset_timeout: Duration::from_secs(30),
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cb = cb.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    cb.record_failure("openai");
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cb.failure_count("openai"), 400);
    }
}
