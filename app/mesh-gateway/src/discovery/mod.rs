//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Service discovery: instance registry and health checking

pub mod health;
pub mod registry;

// Re-export main types
pub use health::{HealthCheck, HealthCheckHandle};
pub use registry::ServiceRegistry;
