//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! API gateway: middleware pipeline, protection primitives and dispatch

pub mod circuit_breaker;
pub mod core;
pub mod middleware;
pub mod rate_limiter;
pub mod state;

// Re-export main types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitBreakers};
pub use core::{ApiGateway, GatewayStats};
pub use middleware::{Middleware, MiddlewarePipeline, Next, RequestContext};
pub use rate_limiter::{RateLimitDecision, RateLimiter, RateLimiters};
pub use state::{GatewayMetrics, GatewayState};
