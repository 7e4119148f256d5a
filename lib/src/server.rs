// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! The Admin Server accept loop (spec §4.8, §5).
//!
//! One task per connection, bounded by a semaphore sized to
//! `max_connections` so the server rejects new connections outright
//! once saturated rather than queuing them indefinitely (spec §5
//! "bounded worker pool, backpressure over unbounded queuing").
//!
//! The server drives the session: it owns an ordered script of C-APDU
//! steps and pushes them to the client one envelope at a time, the
//! client (the simulator's in-process `CardEngine`) executes each
//! against its own virtual card and reports the R-APDU back. The
//! `EngineFactory` the server is given is not used to answer commands
//! here — that happens client-side — it only seeds the default
//! single-`SELECT` script from the engine's provisioned ISD AID, so a
//! caller that only cares about the happy path doesn't have to hand
//! roll one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};

use scp81_apdu::{ApduError, CommandApdu, ResponseApdu};
use scp81_core::card_engine::CardEngine;
use scp81_core::event_bus::{Event, EventBus, EventKind};
use scp81_core::http_envelope::{self, AdminResponse};
use scp81_core::keystore::KeyStore;
use scp81_core::session::{ApduExchange, CloseReason, Session};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::tls::TlsTransport;

const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Builds the `CardEngine` the default script is derived from; kept
/// around for callers that don't supply an explicit script (spec §4.4's
/// "needed by both the server-side test oracle and the virtual-UICC
/// simulator" — here the oracle role is reduced to picking the ISD AID
/// for the single default SELECT).
pub type EngineFactory = Arc<dyn Fn() -> CardEngine + Send + Sync>;

/// The ordered sequence of C-APDU steps a session runs through. Each
/// step is one or more commands sent in the same envelope (spec §4.5
/// "multiple C-APDUs per envelope: execute in order").
pub type Script = Vec<Vec<CommandApdu>>;

pub type ScriptFactory = Arc<dyn Fn() -> Script + Send + Sync>;

pub struct AdminServer {
    config: ServerConfig,
    keystore: Arc<dyn KeyStore>,
    events: EventBus,
    engine_factory: EngineFactory,
    script_factory: Option<ScriptFactory>,
    connection_limit: Arc<Semaphore>,
    active_sessions: Arc<AtomicU64>,
    shutdown: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl AdminServer {
    pub fn new(config: ServerConfig, keystore: Arc<dyn KeyStore>, engine_factory: EngineFactory) -> Result<Self, Error> {
        config.validate().map_err(|e| Error::Config(e.to_string()))?;
        let max_connections = config.max_connections;
        Ok(Self {
            config,
            keystore,
            events: EventBus::new(),
            engine_factory,
            script_factory: None,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            active_sessions: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Override the default single-`SELECT` script, e.g. to reproduce a
    /// multi-step scenario (spec §8 S3's three-command script).
    pub fn with_script(mut self, script_factory: ScriptFactory) -> Self {
        self.script_factory = Some(script_factory);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Idempotent graceful shutdown: wakes the accept loop and every
    /// in-flight connection's read, giving each `shutdown_grace` seconds
    /// to finish its current envelope before the listener is dropped.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
    }

    /// Bind and serve until [`AdminServer::stop`] is called.
    pub async fn run(&self) -> Result<(), Error> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| Error::Config(format!("invalid host/port {}:{}", self.config.host, self.config.port)))?;

        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind { addr, source })?;
        let transport = Arc::new(TlsTransport::new(&self.config.cipher_config, self.keystore.clone())?);
        self.events.emit(Event::new(EventKind::ServerStarted).with_field("addr", addr.to_string()));
        log::info!("listening on {addr}");

        loop {
            let accept = listener.accept();
            tokio::pin!(accept);
            tokio::select! {
                _ = self.shutdown.notified() => break,
                result = &mut accept => {
                    let (stream, peer_addr) = match result {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let script = self.build_script();
                    self.spawn_connection(stream, peer_addr, transport.clone(), script);
                }
            }
        }

        self.drain().await;
        self.events.emit(Event::new(EventKind::ServerStopped));
        log::info!("stopped");
        Ok(())
    }

    /// A script explicitly configured via [`AdminServer::with_script`]
    /// wins; otherwise derive the default one-step `SELECT <isd_aid>`
    /// script from the engine factory's profile.
    fn build_script(&self) -> Script {
        if let Some(factory) = &self.script_factory {
            return factory();
        }
        let engine = (self.engine_factory)();
        let select = CommandApdu::new(0x00, 0xA4, 0x04, 0x00)
            .with_data(engine.profile.isd_aid.clone())
            .unwrap_or_else(|_| CommandApdu::new(0x00, 0xA4, 0x04, 0x00));
        vec![vec![select]]
    }

    async fn drain(&self) {
        let deadline = Duration::from_secs_f64(self.config.shutdown_grace);
        let remaining = self.config.max_connections - self.connection_limit.available_permits();
        if remaining == 0 {
            return;
        }
        log::info!("draining {remaining} active connection(s), grace={deadline:?}");
        let _ = tokio::time::timeout(deadline, async {
            while self.connection_limit.available_permits() < self.config.max_connections {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr, transport: Arc<TlsTransport>, script: Script) {
        let permit = match self.connection_limit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                log::warn!("rejecting connection from {peer_addr}: at max_connections");
                drop(stream);
                return;
            }
        };

        let handshake_timeout = Duration::from_secs_f64(self.config.handshake_timeout);
        let read_timeout = Duration::from_secs_f64(self.config.read_timeout);
        let session_timeout = Duration::from_secs_f64(self.config.session_timeout);
        let events = self.events.clone();
        let active_sessions = self.active_sessions.clone();
        let shutdown = self.shutdown.clone();

        active_sessions.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(
                stream,
                peer_addr,
                transport,
                events,
                script,
                handshake_timeout,
                read_timeout,
                session_timeout,
                shutdown,
            )
            .await;
            active_sessions.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Drive one accepted TCP connection end to end. Only the handshake
/// itself is bounded by `handshake_timeout` (spec §5's three-timeout
/// model); once the session is open, `read_timeout` bounds each
/// in-progress envelope read and `session_timeout` bounds the idle gap
/// between envelopes (see [`read_envelope`]).
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    transport: Arc<TlsTransport>,
    events: EventBus,
    script: Script,
    handshake_timeout: Duration,
    read_timeout: Duration,
    session_timeout: Duration,
    shutdown: Arc<Notify>,
) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let accepted = tokio::time::timeout(handshake_timeout, transport.accept(stream, &events, &session_id)).await;
    let (mut tls, psk_identity) = match accepted {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            log::warn!("handshake with {peer_addr} failed: {e}");
            return;
        }
        Err(_) => {
            log::warn!("connection from {peer_addr} timed out during handshake");
            events.emit(
                Event::new(EventKind::HandshakeFailed)
                    .with_session(session_id)
                    .with_field("reason", "handshake_timeout"),
            );
            return;
        }
    };

    let negotiated_cipher =
        tls.ssl().current_cipher().map(|c| c.name().to_string()).unwrap_or_else(|| "unknown".to_string());
    let tls_version = tls.ssl().version_str().to_string();

    let mut session = Session::new(psk_identity);
    session.peer_addr = Some(peer_addr);
    let _ = session.handshake_completed(negotiated_cipher, tls_version);
    events.emit(Event::new(EventKind::SessionStarted).with_session(session.id.clone()));

    // Index of the step the client is about to report a response for;
    // `cursor == 0` means the inbound envelope is the initial empty POST.
    let mut cursor = 0usize;
    let mut buf = Vec::new();
    let close_reason = loop {
        let read = tokio::select! {
            _ = shutdown.notified() => break CloseReason::Shutdown,
            r = read_envelope(&mut tls, &mut buf, read_timeout, session_timeout) => r,
        };

        let request_bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break CloseReason::Interrupted,
            Err(ReadEnvelopeError::Timeout) => break CloseReason::Timeout,
            Err(ReadEnvelopeError::Io(e)) => {
                log::debug!("session {} read error: {e}", session.id);
                break CloseReason::Interrupted;
            }
        };

        let request = match http_envelope::parse_request(&request_bytes) {
            Ok(r) => r,
            Err(e) => {
                let status = match &e {
                    scp81_core::Error::UnsupportedMediaType(_) => 415,
                    _ => 400,
                };
                log::warn!("session {}: malformed envelope ({status}): {e}", session.id);
                let _ = tls.write_all(&http_envelope::encode_status_only(status)).await;
                break CloseReason::ProtocolError;
            }
        };

        if request.resume {
            log::warn!(
                "session {}: X-Admin-Resume for {:?} but no prior session is tracked for resumption",
                session.id,
                request.path
            );
            let _ = tls.write_all(&http_envelope::encode_status_only(404)).await;
            break CloseReason::ProtocolError;
        }

        if request.path != session.next_uri {
            log::warn!(
                "session {}: request path {:?} does not match the issued next-URI {:?}",
                session.id,
                request.path,
                session.next_uri
            );
            let _ = tls.write_all(&http_envelope::encode_status_only(400)).await;
            break CloseReason::ProtocolError;
        }

        if cursor > 0 {
            let commands = &script[cursor - 1];
            let responses = match decode_step_responses(&request.body, commands) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("session {}: malformed R-APDU batch: {e}", session.id);
                    break CloseReason::ProtocolError;
                }
            };
            for resp in &responses {
                let raw = resp.encode();
                let sw = resp.status.to_bytes();
                session.record(ApduExchange::response(raw, sw[0], sw[1], 0.0));
                events.emit(
                    Event::new(EventKind::ApduResponse)
                        .with_session(session.id.clone())
                        .with_field("sw", format!("{}", resp.status)),
                );
            }

            match request.script_status {
                Some(status) if !status.is_ok() => {
                    log::info!("session {}: client reported script status {status}", session.id);
                    let _ = tls.write_all(&AdminResponse::done().encode()).await;
                    break CloseReason::ScriptAbort;
                }
                Some(_) => {}
                None => {
                    log::warn!("session {}: non-initial envelope missing X-Admin-Script-Status", session.id);
                    break CloseReason::ProtocolError;
                }
            }
        }

        session.touch();

        if cursor == script.len() {
            let _ = tls.write_all(&AdminResponse::done().encode()).await;
            break CloseReason::Completed;
        }

        let commands = &script[cursor];
        let body = match encode_step(commands) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("session {}: failed to encode scripted command: {e}", session.id);
                break CloseReason::ProtocolError;
            }
        };
        for raw in &body {
            session.record(ApduExchange::command(raw.clone()));
            events.emit(Event::new(EventKind::ApduCommand).with_session(session.id.clone()));
        }
        let body: Vec<u8> = body.into_iter().flatten().collect();
        cursor += 1;

        let next_uri = session.advance_uri();
        if let Err(e) = tls.write_all(&AdminResponse::continue_with(next_uri, body).encode()).await {
            log::debug!("session {}: write error: {e}", session.id);
            break CloseReason::Interrupted;
        }
    };

    let _ = session.close(close_reason);
    let _ = session.closed();
    events.emit(
        Event::new(EventKind::SessionEnded)
            .with_session(session.id.clone())
            .with_field("reason", close_reason.to_string()),
    );
    let _ = tls.shutdown().await;
}

/// Encode every command in a step, failing the whole step if any one
/// command doesn't fit the APDU wire format.
fn encode_step(commands: &[CommandApdu]) -> Result<Vec<Vec<u8>>, ApduError> {
    commands.iter().map(CommandApdu::encode).collect()
}

/// Slice a concatenated R-APDU batch back into one response per
/// command, using each command's declared `Le` as the expected data
/// length (R-APDUs carry no self-describing length, unlike C-APDUs).
fn decode_step_responses(body: &[u8], commands: &[CommandApdu]) -> Result<Vec<ResponseApdu>, ApduError> {
    let mut responses = Vec::with_capacity(commands.len());
    let mut offset = 0;
    for cmd in commands {
        let expected_data_len = cmd.le.unwrap_or(0) as usize;
        let end = offset + expected_data_len + 2;
        let slice = body.get(offset..end).ok_or(ApduError::MissingStatus)?;
        responses.push(ResponseApdu::decode(slice)?);
        offset = end;
    }
    Ok(responses)
}

enum ReadEnvelopeError {
    Timeout,
    Io(std::io::Error),
}

/// Read one complete Admin HTTP request (headers + declared
/// Content-Length body) from the TLS stream, or `Ok(None)` on clean EOF.
///
/// `session_timeout` bounds the wait for the first byte of a new
/// envelope (the cross-envelope idle gap spec §5 calls out); once at
/// least one byte of an envelope has arrived, `read_timeout` bounds each
/// subsequent read, matching the "handshake / per-envelope / inactivity"
/// three-timeout model rather than the whole session sharing one clock.
async fn read_envelope(
    tls: &mut tokio_openssl::SslStream<TcpStream>,
    buf: &mut Vec<u8>,
    read_timeout: Duration,
    session_timeout: Duration,
) -> Result<Option<Vec<u8>>, ReadEnvelopeError> {
    buf.clear();
    let mut chunk = [0u8; 4096];
    loop {
        if buf.len() > MAX_ENVELOPE_BYTES {
            return Err(ReadEnvelopeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "envelope exceeds maximum size",
            )));
        }
        if let Some(n) = request_complete(buf) {
            return Ok(Some(buf[..n].to_vec()));
        }
        let timeout = if buf.is_empty() { session_timeout } else { read_timeout };
        let read = tokio::time::timeout(timeout, tls.read(&mut chunk))
            .await
            .map_err(|_| ReadEnvelopeError::Timeout)?
            .map_err(ReadEnvelopeError::Io)?;
        if read == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ReadEnvelopeError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-envelope",
                )))
            };
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

/// Returns the total byte length of the request once headers and the
/// full declared body have arrived, else `None`.
fn request_complete(buf: &[u8]) -> Option<usize> {
    let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&buf[..header_end]).ok()?;
    let content_length: usize = head
        .lines()
        .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .and_then(|v| v.parse().ok())?;
    let total = header_end + 4 + content_length;
    (buf.len() >= total).then_some(total)
}
