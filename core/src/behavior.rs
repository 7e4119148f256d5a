// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Simulator-side fault injection: a mode gate, then an error-rate
//! roll, then a timeout-probability roll, then a plain response delay
//! — evaluated in that order rather than as three independent toggles.

use std::time::Duration;

use rand::Rng;
use scp81_apdu::StatusWord;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BehaviorMode {
    Normal,
    Error,
    Timeout,
}

/// Behavior configuration (spec §6): the exact recognized keys, unknown
/// keys rejected at validation time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BehaviorConfig {
    #[serde(default = "default_mode")]
    pub mode: BehaviorMode,
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub error_codes: Vec<String>,
    #[serde(default)]
    pub timeout_probability: f64,
    #[serde(default = "default_timeout_delay_min_ms")]
    pub timeout_delay_min_ms: u64,
    #[serde(default = "default_timeout_delay_max_ms")]
    pub timeout_delay_max_ms: u64,
    #[serde(default)]
    pub response_delay_ms: u64,
}

fn default_mode() -> BehaviorMode {
    BehaviorMode::Normal
}

fn default_timeout_delay_min_ms() -> u64 {
    35_000
}

fn default_timeout_delay_max_ms() -> u64 {
    45_000
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            mode: BehaviorMode::Normal,
            error_rate: 0.0,
            error_codes: Vec::new(),
            timeout_probability: 0.0,
            timeout_delay_min_ms: default_timeout_delay_min_ms(),
            timeout_delay_max_ms: default_timeout_delay_max_ms(),
            response_delay_ms: 0,
        }
    }
}

impl BehaviorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.error_rate) {
            return Err(Error::config("error_rate must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.timeout_probability) {
            return Err(Error::config("timeout_probability must be within [0, 1]"));
        }
        if self.timeout_delay_min_ms > self.timeout_delay_max_ms {
            return Err(Error::config("timeout_delay_min_ms must not exceed timeout_delay_max_ms"));
        }
        for code in &self.error_codes {
            if code.len() != 4 || !code.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::config(format!("invalid error code {code:?}, expected 4 hex digits")));
            }
        }
        Ok(())
    }
}

/// Outcome of consulting a [`BehaviorController`] before answering an
/// APDU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// No fault injected; the caller's plain response delay (if any) has
    /// already been applied.
    None,
    /// Simulate a dead connection: sleep past the caller's own read
    /// deadline rather than ever answering.
    Timeout,
    /// Substitute this status word for whatever the card engine would
    /// otherwise have returned.
    InjectError(StatusWord),
}

/// An interface in the client path (spec §9); the default implementation
/// is the PRNG-driven policy below.
pub trait BehaviorController: Send {
    fn maybe_inject(&mut self) -> Outcome;
    fn response_delay(&self) -> Duration;
    fn reset_stats(&mut self);
    fn error_count(&self) -> u64;
    fn timeout_count(&self) -> u64;
}

/// Deterministic given a seeded PRNG, matching `behavior.py`'s use of
/// `random.random()`/`random.uniform()`/`random.choice()`.
pub struct DefaultBehaviorController<R: Rng> {
    config: BehaviorConfig,
    rng: R,
    error_count: u64,
    timeout_count: u64,
}

impl<R: Rng> DefaultBehaviorController<R> {
    pub fn new(config: BehaviorConfig, rng: R) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self { config, rng, error_count: 0, timeout_count: 0 })
    }

    fn should_timeout(&mut self) -> bool {
        if self.config.mode != BehaviorMode::Timeout || self.config.timeout_probability <= 0.0 {
            return false;
        }
        let hit = self.rng.gen::<f64>() < self.config.timeout_probability;
        if hit {
            self.timeout_count += 1;
        }
        hit
    }

    fn should_inject_error(&mut self) -> bool {
        if self.config.mode != BehaviorMode::Error || self.config.error_rate <= 0.0 {
            return false;
        }
        let hit = self.rng.gen::<f64>() < self.config.error_rate;
        if hit {
            self.error_count += 1;
        }
        hit
    }

    fn error_status(&mut self) -> StatusWord {
        if self.config.error_codes.is_empty() {
            return StatusWord::UNKNOWN;
        }
        let idx = self.rng.gen_range(0..self.config.error_codes.len());
        let code = &self.config.error_codes[idx];
        let bytes = hex::decode(code).unwrap_or_default();
        match bytes.as_slice() {
            [sw1, sw2] => StatusWord::from_bytes(*sw1, *sw2),
            _ => StatusWord::UNKNOWN,
        }
    }
}

impl<R: Rng + Send> BehaviorController for DefaultBehaviorController<R> {
    fn maybe_inject(&mut self) -> Outcome {
        if self.should_timeout() {
            return Outcome::Timeout;
        }
        if self.should_inject_error() {
            return Outcome::InjectError(self.error_status());
        }
        Outcome::None
    }

    fn response_delay(&self) -> Duration {
        Duration::from_millis(self.config.response_delay_ms)
    }

    fn reset_stats(&mut self) {
        self.error_count = 0;
        self.timeout_count = 0;
    }

    fn error_count(&self) -> u64 {
        self.error_count
    }

    fn timeout_count(&self) -> u64 {
        self.timeout_count
    }
}
