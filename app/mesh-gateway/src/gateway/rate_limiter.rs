//! Fixed-window rate limiting
//!
//! One [`RateLimiter`] exists per route path; inside it every client key gets
//! its own window. The check-and-increment for a key runs under that key's
//! map entry lock, so concurrent requests from one client never undercount.

use crate::{config::RateLimitConfig, types::current_timestamp_ms};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Windows are swept once the map grows past this many clients
const SWEEP_THRESHOLD: usize = 10_000;

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// Window reset time (ms since epoch)
    pub reset: u64,
    /// Seconds until the window resets, set only when rejected
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window limiter for one route
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
    total_requests: AtomicU64,
    rejected_requests: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check_limit(&self, client_id: &str) -> RateLimitDecision {
        self.check_limit_at(client_id, Instant::now())
    }

    /// Count one request from `client_id` at `now`
    pub fn check_limit_at(&self, client_id: &str, now: Instant) -> RateLimitDecision {
        if self.windows.len() > SWEEP_THRESHOLD {
            self.sweep_expired(now);
        }

        let mut window = self
            .windows
            .entry(client_id.to_string())
            .or_insert_with(|| Window {
                count: 0,
                reset_at: now + self.config.window,
            });

        if window.reset_at <= now {
            *window = Window {
                count: 0,
                reset_at: now + self.config.window,
            };
        }

        let until_reset = window.reset_at.saturating_duration_since(now);
        let reset = current_timestamp_ms() + until_reset.as_millis() as u64;

        if window.count >= self.config.requests {
            self.rejected_requests.fetch_add(1, Ordering::Relaxed);
            debug!("Rate limit exceeded for client {}", client_id);

            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset,
                retry_after: Some(ceil_secs(until_reset)),
            };
        }

        window.count += 1;
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        RateLimitDecision {
            allowed: true,
            remaining: self.config.requests - window.count,
            reset,
            retry_after: None,
        }
    }

    /// Requests counted in windows that are still open
    pub fn current_requests(&self) -> u64 {
        self.current_requests_at(Instant::now())
    }

    pub fn current_requests_at(&self, now: Instant) -> u64 {
        self.windows
            .iter()
            .filter(|w| w.reset_at > now)
            .map(|w| w.count as u64)
            .sum()
    }

    /// Allowed requests since creation
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn rejected_requests(&self) -> u64 {
        self.rejected_requests.load(Ordering::Relaxed)
    }

    fn sweep_expired(&self, now: Instant) {
        self.windows.retain(|_, w| w.reset_at > now);
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    millis.div_ceil(1000)
}

/// Limiter statistics for one route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub path: String,
    pub current_requests: u64,
    pub total_requests: u64,
    pub rejected_requests: u64,
}

/// Limiters keyed by route path
#[derive(Debug, Default)]
pub struct RateLimiters {
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter for `path`, created on first use
    pub fn get_or_create(&self, path: &str, config: RateLimitConfig) -> Arc<RateLimiter> {
        self.limiters
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(config)))
            .clone()
    }

    /// Forget the limiter for `path`, used when its route changes
    pub fn remove(&self, path: &str) {
        self.limiters.remove(path);
    }

    pub fn stats(&self) -> Vec<RateLimiterStats> {
        let mut stats: Vec<RateLimiterStats> = self
            .limiters
            .iter()
            .map(|entry| RateLimiterStats {
                path: entry.key().clone(),
                current_requests: entry.value().current_requests(),
                total_requests: entry.value().total_requests(),
                rejected_requests: entry.value().rejected_requests(),
            })
            .collect();
        stats.sort_by(|a, b| a.path.cmp(&b.path));
        stats
    }
}
