//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Routing: route table, path matching and request forwarding

pub mod core;
pub mod matcher;
pub mod proxy;

// Re-export main types
pub use core::RouteTable;
pub use matcher::RouteMatch;
pub use proxy::Forwarder;
