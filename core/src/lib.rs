// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Protocol core for the GlobalPlatform Amendment B Admin test harness:
//! the PSK key store, the virtual card engine, the session state
//! machine, the Admin HTTP envelope, and the event bus that surfaces
//! session lifecycle to observers.
//!
//! Transport (PSK-TLS, the accept loop) lives in `scp81-server`; this
//! crate only knows about bytes, state, and events.

pub use scp81_apdu as apdu;

pub mod behavior;
pub mod card_engine;
pub mod error;
pub mod event_bus;
pub mod http_envelope;
pub mod keystore;
pub mod session;

pub use error::Error;
