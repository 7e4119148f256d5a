// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! PSK-TLS transport (spec §4.7).
//!
//! `rustls` has no PSK cipher suite support, so the acceptor is built on
//! `openssl`/`tokio-openssl` instead, the way the DTLS-PSK handshake in
//! `webrtc-rs`'s `dtls::config::Config` hangs a `psk: Option<PSKCallback>`
//! callback off the connection config: here the callback is installed on
//! the `SslContextBuilder` and does the PSK identity -> key lookup against
//! a [`KeyStore`].

use std::sync::Arc;

use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use scp81_core::event_bus::{Event, EventBus, EventKind};
use scp81_core::keystore::KeyStore;

use crate::config::CipherConfig;
use crate::error::Error;

/// Builds the `SslAcceptor` used for every accepted connection and drives
/// the PSK handshake to completion.
pub struct TlsTransport {
    acceptor: SslAcceptor,
    identity_index: Index<Ssl, String>,
}

impl TlsTransport {
    pub fn new(cipher_config: &CipherConfig, keystore: Arc<dyn KeyStore>) -> Result<Self, Error> {
        cipher_config.validate().map_err(|e| Error::Config(e.to_string()))?;

        let identity_index = Ssl::new_ex_index::<String>()?;

        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_cipher_list(&cipher_config.get_openssl_cipher_string())?;

        if let Some(mfl) = cipher_config.max_fragment_length {
            // openssl-rs has no safe wrapper for the RFC 6066 client-offered
            // extension (`SSL_CTX_set_tlsext_max_fragment_length`); capping
            // our own outgoing record size via `set_max_send_fragment`
            // delivers the same observable contract spec S5 cares about
            // (records this server sends never exceed `mfl` bytes).
            builder.set_max_send_fragment(mfl as usize)?;
            log::debug!("capping outgoing TLS records to {mfl} bytes");
        }

        builder.set_psk_server_callback(move |ssl, identity, secret_out| {
            let identity = match identity {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => return Ok(0),
            };
            match keystore.lookup(&identity) {
                Some(record) if record.is_expired_at(chrono::Utc::now()) => {
                    log::warn!("PSK identity {identity:?} presented an expired key");
                    Ok(0)
                }
                Some(record) if record.key.len() <= secret_out.len() => {
                    secret_out[..record.key.len()].copy_from_slice(&record.key);
                    ssl.set_ex_data(identity_index, identity);
                    Ok(record.key.len())
                }
                _ => Ok(0),
            }
        });

        Ok(Self { acceptor: builder.build(), identity_index })
    }

    /// Drive the handshake for one accepted TCP connection, emitting
    /// `handshake_completed`/`handshake_failed` on `events` (spec §4.6's
    /// `HandshakeState` transitions are observed by the session, not
    /// here; this layer only reports success or failure of the TLS layer
    /// itself). Returns the stream along with the PSK identity the peer
    /// authenticated as, stashed on the `Ssl` by the server callback
    /// since openssl-rs exposes no direct accessor for it.
    pub async fn accept(
        &self,
        stream: TcpStream,
        events: &EventBus,
        session_id: &str,
    ) -> Result<(SslStream<TcpStream>, String), Error> {
        let ssl = Ssl::new(self.acceptor.context())?;
        let mut tls_stream = SslStream::new(ssl, stream)?;

        match std::pin::Pin::new(&mut tls_stream).accept().await {
            Ok(()) => {
                let identity = tls_stream
                    .ssl()
                    .ex_data(self.identity_index)
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string());
                events.emit(
                    Event::new(EventKind::HandshakeCompleted)
                        .with_session(session_id)
                        .with_field("psk_identity", identity.clone()),
                );
                Ok((tls_stream, identity))
            }
            Err(err) => {
                events.emit(
                    Event::new(EventKind::HandshakeFailed)
                        .with_session(session_id)
                        .with_field("reason", err.to_string()),
                );
                Err(Error::Session(scp81_core::Error::Handshake(err.to_string())))
            }
        }
    }
}
