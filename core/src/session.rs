// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! The per-connection Admin session state machine (spec §4.6) and its
//! supporting data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::Error;

/// Direction of a single APDU within a session's exchange log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Command,
    Response,
}

/// One command or response APDU as recorded in a session's log.
#[derive(Clone, Debug, PartialEq)]
pub struct ApduExchange {
    pub direction: Direction,
    pub raw: Vec<u8>,
    pub sw1: Option<u8>,
    pub sw2: Option<u8>,
    pub latency_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ApduExchange {
    pub fn command(raw: Vec<u8>) -> Self {
        Self { direction: Direction::Command, raw, sw1: None, sw2: None, latency_ms: None, timestamp: Utc::now() }
    }

    pub fn response(raw: Vec<u8>, sw1: u8, sw2: u8, latency_ms: f64) -> Self {
        Self {
            direction: Direction::Response,
            raw,
            sw1: Some(sw1),
            sw2: Some(sw2),
            latency_ms: Some(latency_ms),
            timestamp: Utc::now(),
        }
    }
}

/// Script status reported by the client in `X-Admin-Script-Status`
/// (spec §3, §4.5). A closed set: unknown values fail envelope parsing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ScriptStatus {
    Ok,
    UnknownApplication,
    NotASecurityDomain,
    SecurityError,
    MemoryFailure,
    Aborted,
}

impl ScriptStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, ScriptStatus::Ok)
    }

    /// Categorize a card status word into the closed set a client reports
    /// back to the server (spec §3's `X-Admin-Script-Status` values). Grounded
    /// directly in the GlobalPlatform / ISO 7816-4 status word semantics
    /// `scp81_apdu::StatusWord` already names: `6A82` ("file or application
    /// not found") is the standard SW for a `SELECT` that can't resolve its
    /// AID, `6982`/`6985` are access-condition failures, and the remaining
    /// `6Axx`/`67xx`/`6Dxx`/`6Exx` family are treated as a generic security
    /// error since the client has no finer-grained bucket for them.
    pub fn from_status_word(sw: scp81_apdu::StatusWord) -> Self {
        use scp81_apdu::StatusWord;
        match sw {
            s if s.is_success() => ScriptStatus::Ok,
            StatusWord::WARNING_STATE_UNCHANGED => ScriptStatus::Ok,
            StatusWord::FILE_NOT_FOUND => ScriptStatus::UnknownApplication,
            StatusWord::MEMORY_FAILURE => ScriptStatus::MemoryFailure,
            StatusWord::SECURITY_STATUS_NOT_SATISFIED | StatusWord::CONDITIONS_NOT_SATISFIED => {
                ScriptStatus::NotASecurityDomain
            }
            StatusWord::INCORRECT_DATA | StatusWord::INCORRECT_P1P2 | StatusWord::WRONG_LENGTH => {
                ScriptStatus::SecurityError
            }
            _ => ScriptStatus::SecurityError,
        }
    }

    /// Combine the per-APDU outcomes within one envelope into the single
    /// summary status the client reports (spec §4.6 tie-break: "the
    /// summary script status is the strongest applicable non-ok value").
    /// Later non-ok values do not override an earlier one; the first
    /// failure encountered wins, since it already identifies the root
    /// cause of the batch.
    pub fn strongest(statuses: impl IntoIterator<Item = ScriptStatus>) -> ScriptStatus {
        statuses.into_iter().find(|s| !s.is_ok()).unwrap_or(ScriptStatus::Ok)
    }
}

/// Why a session moved to `Closing`/`Closed`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Completed,
    Timeout,
    ScriptAbort,
    Interrupted,
    Shutdown,
    ProtocolError,
    Security,
}

/// The Admin session state machine (spec §4.6).
#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Open,
    AwaitingResponse,
    Closing(CloseReason),
    Closed(CloseReason),
    HandshakeFailed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed(_) | SessionState::HandshakeFailed)
    }
}

/// A live or closed Admin session.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub psk_identity: String,
    pub negotiated_cipher: Option<String>,
    pub tls_version: Option<String>,
    pub peer_addr: Option<std::net::SocketAddr>,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub close_reason: Option<CloseReason>,
    pub script_cursor: u64,
    pub apdu_log: Vec<ApduExchange>,
    pub next_uri: String,
    pub targeted_application: Option<Vec<u8>>,
}

impl Session {
    pub fn new(psk_identity: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Handshaking,
            psk_identity: psk_identity.into(),
            negotiated_cipher: None,
            tls_version: None,
            peer_addr: None,
            opened_at: now,
            last_activity_at: now,
            close_reason: None,
            script_cursor: 0,
            apdu_log: Vec::new(),
            next_uri: "/".to_string(),
            targeted_application: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Advance the next-URI counter monotonically (spec §4.6 rule 1).
    pub fn advance_uri(&mut self) -> String {
        self.script_cursor += 1;
        self.next_uri = format!("/session/1/step/{}", self.script_cursor);
        self.next_uri.clone()
    }

    pub fn record(&mut self, exchange: ApduExchange) {
        self.apdu_log.push(exchange);
        self.touch();
    }

    fn transition(&mut self, next: SessionState) -> Result<(), Error> {
        if self.state.is_terminal() {
            return Err(Error::Protocol(format!(
                "cannot transition a terminal session out of {:?}",
                self.state
            )));
        }
        log::debug!("session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn handshake_completed(&mut self, cipher: String, tls_version: String) -> Result<(), Error> {
        self.negotiated_cipher = Some(cipher);
        self.tls_version = Some(tls_version);
        self.transition(SessionState::Open)
    }

    pub fn handshake_failed(&mut self) -> Result<(), Error> {
        self.transition(SessionState::HandshakeFailed)
    }

    /// Enter `AwaitingResponse` having just emitted one or more C-APDUs.
    pub fn await_response(&mut self) -> Result<(), Error> {
        self.transition(SessionState::AwaitingResponse)
    }

    /// A well-formed R-APDU envelope arrived with `ok` status: go back to
    /// `Open` so the server can decide on the next script step.
    pub fn response_received(&mut self) -> Result<(), Error> {
        self.transition(SessionState::Open)
    }

    /// Script has no more commands, or the client reported a non-ok
    /// status, or a timeout/interrupt/shutdown fired: move to `Closing`.
    pub fn close(&mut self, reason: CloseReason) -> Result<(), Error> {
        self.close_reason = Some(reason);
        self.transition(SessionState::Closing(reason))
    }

    /// TLS close-notify exchanged: the session is now immutable.
    pub fn closed(&mut self) -> Result<(), Error> {
        let reason = self.close_reason.unwrap_or(CloseReason::Completed);
        self.transition(SessionState::Closed(reason))
    }
}
