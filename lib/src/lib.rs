// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! PSK-TLS Admin Server for the GlobalPlatform Amendment B Remote
//! Application Management over HTTP test harness.
//!
//! Wraps `scp81-core`'s protocol engine with the network-facing pieces:
//! the PSK-TLS acceptor, the bounded connection pool, and server
//! configuration. The CLI binary lives under `src/cli` behind the `cli`
//! feature.

pub use scp81_core as core;

pub mod config;
pub mod error;
pub mod server;
pub mod tls;

pub use config::{CipherConfig, ServerConfig};
pub use error::Error;
pub use server::{AdminServer, EngineFactory};
