// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! The Admin simulator (spec §4.9): a PSK-TLS client that plays the
//! part of a UICC driving a Remote Application Management session. It
//! hosts the same [`scp81_core::card_engine::CardEngine`] the server
//! uses for its own test oracle, answering each C-APDU the server sends
//! and reporting a summary `X-Admin-Script-Status` back.
//!
//! Fault injection is delegated to a [`BehaviorController`]: before
//! answering a command the simulator consults it the same way the
//! server's `CardEngine` does, so the same configuration format drives
//! both directions.

use std::time::Duration;

use openssl::ssl::{Ssl, SslConnector, SslMethod, SslVerifyMode};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use rand::SeedableRng;

use scp81_apdu::CommandApdu;
use scp81_core::behavior::{BehaviorConfig, BehaviorController, DefaultBehaviorController, Outcome};
use scp81_core::card_engine::{CardEngine, CardProfile};
use scp81_core::http_envelope::{self, AdminResponse};
use scp81_core::session::ScriptStatus;
use scp81_core::Error;

/// Configuration for one simulated card connecting to an Admin server
/// with PSK identity/key fields and a fault-injection behavior block.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatorConfig {
    pub host: String,
    pub port: u16,
    pub psk_identity: String,
    #[serde(with = "hex_key")]
    pub psk_key: Vec<u8>,
    pub isd_aid: String,
    /// Mirrors `CardProfile::strict_aid_matching` (spec §9 open question):
    /// reject `SELECT` for an AID outside the provisioned profile rather
    /// than accepting it unconditionally.
    #[serde(default)]
    pub strict_aid_matching: bool,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default = "SimulatorConfig::default_read_timeout")]
    pub read_timeout: f64,
    #[serde(default = "SimulatorConfig::default_max_steps")]
    pub max_steps: u32,
}

impl SimulatorConfig {
    fn default_read_timeout() -> f64 {
        30.0
    }
    fn default_max_steps() -> u32 {
        64
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.port == 0 {
            return Err(Error::config("port must be in 1-65535"));
        }
        if ![16, 32].contains(&self.psk_key.len()) {
            return Err(Error::config("psk_key must be 16 or 32 bytes"));
        }
        self.behavior.validate()
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}

/// Outcome of one completed session, returned to the caller for
/// assertions in integration tests (spec §8 scenarios).
#[derive(Debug)]
pub struct SessionOutcome {
    pub steps: u32,
    pub final_status: ScriptStatus,
}

/// Drives one PSK-TLS Admin session end to end.
pub struct AdminSimulator {
    config: SimulatorConfig,
    engine: CardEngine,
    behavior: Box<dyn BehaviorController>,
}

impl AdminSimulator {
    pub fn new(config: SimulatorConfig) -> Result<Self, Error> {
        config.validate()?;
        let mut isd_aid = Vec::new();
        for byte in config.isd_aid.split(':') {
            isd_aid.push(u8::from_str_radix(byte, 16).map_err(|_| Error::config("isd_aid must be colon-separated hex"))?);
        }
        let mut profile = CardProfile::new(isd_aid);
        profile.strict_aid_matching = config.strict_aid_matching;
        let engine = CardEngine::new(profile);
        let rng = rand::rngs::StdRng::from_entropy();
        let behavior = Box::new(DefaultBehaviorController::new(config.behavior.clone(), rng)?);
        Ok(Self { config, engine, behavior })
    }

    pub async fn run(mut self) -> Result<SessionOutcome, Error> {
        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(Error::from)?;

        let mut connector = SslConnector::builder(SslMethod::tls()).map_err(Error::internal)?;
        connector.set_verify(SslVerifyMode::NONE);
        connector.set_cipher_list("PSK-AES128-CBC-SHA256:PSK-AES256-CBC-SHA384").map_err(Error::internal)?;

        let identity = self.config.psk_identity.clone();
        let key = self.config.psk_key.clone();
        connector.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
            let id_bytes = identity.as_bytes();
            identity_out[..id_bytes.len()].copy_from_slice(id_bytes);
            identity_out[id_bytes.len()] = 0;
            psk_out[..key.len()].copy_from_slice(&key);
            Ok(key.len())
        });

        let connector = connector.build();
        let ssl = Ssl::new(connector.context()).map_err(Error::internal)?;
        let mut tls = SslStream::new(ssl, stream).map_err(Error::internal)?;
        std::pin::Pin::new(&mut tls).connect().await.map_err(|e| Error::Handshake(e.to_string()))?;

        log::info!("handshake complete as {}", self.config.psk_identity);

        let mut next_uri = "/".to_string();
        let mut body = Vec::new();
        let mut status = ScriptStatus::Ok;
        let mut steps = 0u32;
        let read_timeout = Duration::from_secs_f64(self.config.read_timeout);

        loop {
            if steps >= self.config.max_steps {
                return Err(Error::Protocol("exceeded max_steps without script completion".into()));
            }

            let request = http_envelope::encode_request(
                &next_uri,
                &self.config.psk_identity,
                if steps == 0 { None } else { Some(status) },
                false,
                &body,
            );
            tls.write_all(&request).await.map_err(Error::from)?;

            let response = read_response(&mut tls, read_timeout).await?;
            if response.status == 204 {
                break;
            }

            let delay = self.behavior.response_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (reply, step_status) = self.answer(&response.body);
            status = step_status;
            body = reply;
            next_uri = response.next_uri.ok_or_else(|| Error::Protocol("200 response missing X-Admin-Next-URI".into()))?;
            steps += 1;

            if !status.is_ok() {
                log::info!("reporting script status {status} on next request; awaiting server close");
            }
        }

        let _ = std::pin::Pin::new(&mut tls).shutdown().await;
        Ok(SessionOutcome { steps, final_status: status })
    }

    /// Answer one command, consulting the behavior controller first
    /// (spec §4.9), returning the encoded R-APDU and the resulting
    /// script status.
    fn answer(&mut self, command_bytes: &[u8]) -> (Vec<u8>, ScriptStatus) {
        let cmd = match CommandApdu::decode(command_bytes) {
            Ok(cmd) => cmd,
            Err(_) => return (Vec::new(), ScriptStatus::SecurityError),
        };

        let resp = match self.behavior.maybe_inject() {
            Outcome::Timeout => {
                log::warn!("behavior controller requested a silent timeout");
                return (Vec::new(), ScriptStatus::Aborted);
            }
            Outcome::InjectError(sw) => scp81_apdu::ResponseApdu::status_only(sw),
            Outcome::None => self.engine.process(&cmd),
        };

        let status = ScriptStatus::from_status_word(resp.status);
        (resp.encode(), status)
    }
}

async fn read_response(tls: &mut SslStream<TcpStream>, timeout: Duration) -> Result<AdminResponse, Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            if let Ok(head) = std::str::from_utf8(&buf[..header_end]) {
                if let Some(len) = head
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                    .and_then(|v| v.parse::<usize>().ok())
                {
                    let total = header_end + 4 + len;
                    if buf.len() >= total {
                        return http_envelope::parse_response(&buf[..total]);
                    }
                }
            }
        }
        let read = tokio::time::timeout(timeout, tls.read(&mut chunk))
            .await
            .map_err(|_| Error::Timeout("waiting for admin response".into()))?
            .map_err(Error::from)?;
        if read == 0 {
            return Err(Error::Interrupted);
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}
