//! Circuit breaker for backend services

use crate::{config::CircuitBreakerConfig, types::current_timestamp_ms};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half-open",
        })
    }
}

/// Breaker for one service
///
/// After `reset_timeout` in the open state exactly one probe call is let
/// through; every other caller keeps seeing the breaker as open until that
/// probe reports back. A probe that never reports (its caller was dropped)
/// is abandoned after `timeout`, the longest a forwarded call may run, and
/// the next caller becomes the probe.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitBreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<u64>,
    probe_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitBreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_time: None,
            probe_started: None,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitBreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Last failure (ms since epoch)
    pub fn last_failure_time(&self) -> Option<u64> {
        self.last_failure_time
    }

    pub fn is_open(&mut self) -> bool {
        self.is_open_at(Instant::now())
    }

    /// Whether a call at `now` must be rejected. Moves an expired open
    /// breaker to half-open and admits the caller as the probe.
    pub fn is_open_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitBreakerState::Closed => false,
            CircuitBreakerState::HalfOpen => {
                let abandoned = self
                    .probe_started
                    .map(|at| now.saturating_duration_since(at) >= self.config.timeout)
                    .unwrap_or(true);

                if abandoned {
                    self.probe_started = Some(now);
                    false
                } else {
                    true
                }
            }
            CircuitBreakerState::Open => {
                let cooled_down = self
                    .last_failure
                    .map(|at| now.saturating_duration_since(at) >= self.config.reset_timeout)
                    .unwrap_or(true);

                if cooled_down {
                    self.state = CircuitBreakerState::HalfOpen;
                    self.probe_started = Some(now);
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitBreakerState::Closed;
        self.probe_started = None;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure = Some(now);
        self.last_failure_time = Some(current_timestamp_ms());

        if self.state == CircuitBreakerState::HalfOpen
            || self.failure_count >= self.config.failure_threshold
        {
            self.state = CircuitBreakerState::Open;
            self.probe_started = None;
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitBreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<u64>,
}

/// Breakers keyed by service name
///
/// Each operation runs under the service's map entry lock, which serializes
/// state transitions per service without blocking other services.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self, service: &str, config: &CircuitBreakerConfig) -> bool {
        self.is_open_at(service, config, Instant::now())
    }

    pub fn is_open_at(&self, service: &str, config: &CircuitBreakerConfig, now: Instant) -> bool {
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| CircuitBreaker::new(*config));

        let was = breaker.state();
        let open = breaker.is_open_at(now);
        if was == CircuitBreakerState::Open && breaker.state() == CircuitBreakerState::HalfOpen {
            info!("Circuit breaker for {} is half-open, allowing a probe", service);
        } else if was == CircuitBreakerState::HalfOpen && !open {
            warn!("Circuit breaker probe for {} never reported, allowing another", service);
        }
        open
    }

    pub fn record_success(&self, service: &str) {
        if let Some(mut breaker) = self.breakers.get_mut(service) {
            if breaker.state() != CircuitBreakerState::Closed {
                info!("Circuit breaker for {} closed", service);
            }
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, service: &str, config: &CircuitBreakerConfig) {
        self.record_failure_at(service, config, Instant::now())
    }

    pub fn record_failure_at(&self, service: &str, config: &CircuitBreakerConfig, now: Instant) {
        let mut breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| CircuitBreaker::new(*config));

        let was = breaker.state();
        breaker.record_failure_at(now);
        if was != CircuitBreakerState::Open && breaker.state() == CircuitBreakerState::Open {
            warn!(
                "Circuit breaker for {} opened after {} failures",
                service,
                breaker.failure_count()
            );
        }
    }

    pub fn state(&self, service: &str) -> Option<CircuitBreakerState> {
        self.breakers.get(service).map(|b| b.state())
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> = self
            .breakers
            .iter()
            .map(|entry| CircuitBreakerStats {
                name: entry.key().clone(),
                state: entry.state(),
                failure_count: entry.failure_count(),
                last_failure_time: entry.last_failure_time(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        assert!(!breaker.is_open_at(now));

        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitBreakerState::Open);
        assert!(breaker.is_open_at(now + Duration::from_secs(29)));
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(now);
        }

        let later = now + Duration::from_secs(30);
        assert!(!breaker.is_open_at(later));
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        assert!(breaker.is_open_at(later));
        assert!(breaker.is_open_at(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_lost_half_open_call_is_replaced_after_call_timeout() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(now);
        }

        // the trial caller goes away without recording an outcome
        let trial_at = now + Duration::from_secs(30);
        assert!(!breaker.is_open_at(trial_at));
        assert!(breaker.is_open_at(trial_at + Duration::from_secs(4)));

        let retry_at = trial_at + Duration::from_secs(5);
        assert!(!breaker.is_open_at(retry_at));
        assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);
        assert!(breaker.is_open_at(retry_at + Duration::from_secs(1)));

        breaker.record_success();
        assert!(!breaker.is_open_at(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_probe_success_closes() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(now);
        }
        assert!(!breaker.is_open_at(now + Duration::from_secs(31)));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(!breaker.is_open_at(now + Duration::from_secs(31)));
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_timer() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(now);
        }

        let probe_at = now + Duration::from_secs(31);
        assert!(!breaker.is_open_at(probe_at));
        breaker.record_failure_at(probe_at);
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        assert!(breaker.is_open_at(probe_at + Duration::from_secs(29)));
        assert!(!breaker.is_open_at(probe_at + Duration::from_secs(30)));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(config());
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        breaker.record_success();
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }

    #[test]
    fn test_registry_stats() {
        let breakers = CircuitBreakers::new();
        let config = config();
        assert!(!breakers.is_open("ai-service", &config));
        for _ in 0..3 {
            breakers.record_failure("ai-service", &config);
        }

        let stats = breakers.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].state, CircuitBreakerState::Open);
        assert_eq!(stats[0].failure_count, 3);
        assert!(stats[0].last_failure_time.is_some());
        assert!(breakers.is_open("ai-service", &config));
    }
}
