// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh Discovery Server
//!
//! Producers and consumers of named queues register here over a small
//! binary TCP protocol; the server answers with the current set of peers
//! bound to each queue, so peers can route to each other directly without a
//! broker holding the data.
//!
//! - [`server::protocol`]: fixed binary message and length-prefixed framing
//! - [`server::registry`]: queue bindings, port allocation, session cleanup
//! - [`server::graph`]: binding graph, routing digraph and channel view
//! - [`server::DiscoveryServer`]: listener and per-connection sessions

pub mod config;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::{DiscoveryServer, ServerError};
