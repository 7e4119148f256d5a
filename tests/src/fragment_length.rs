// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Scenario S5: a server configured with a small `max_fragment_length`
//! must still deliver a C-APDU envelope far larger than that limit
//! intact, broken into TLS records that each stay within the configured
//! bound. Driven with a raw PSK-TLS client wrapped in a
//! [`harness::RecordSniffer`] so the assertion is made against the
//! actual record-layer lengths on the wire, not just the reassembled
//! application-layer body.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use scp81_core::http_envelope::{self, AdminResponse};
use scp81_server::server::AdminServer;

use crate::harness::{self, RecordSniffer};

const MAX_FRAGMENT_LENGTH: u16 = 512;
/// Generous bound above `MAX_FRAGMENT_LENGTH` for CBC-SHA384's explicit
/// IV, HMAC, and block padding overhead on the encrypted record.
const RECORD_OVERHEAD_SLACK: usize = 64;

pub async fn run() -> anyhow::Result<()> {
    let port = harness::pick_port();
    let mut config = harness::server_config(port);
    config.cipher_config.max_fragment_length = Some(MAX_FRAGMENT_LENGTH);
    let server = Arc::new(
        AdminServer::new(config, harness::keystore(), harness::engine_factory())?
            .with_script(Arc::new(harness::oversized_install_script)),
    );

    let handle = harness::spawn_server(server.clone());
    harness::wait_until_listening(port).await;

    let (mut tls, max_record_len) = harness::connect_psk_client_sniffed(port).await?;

    let request = http_envelope::encode_request("/", harness::PSK_IDENTITY, None, false, &[]);
    tls.write_all(&request).await?;

    let response = read_full_response(&mut tls).await?;
    anyhow::ensure!(response.status == 200, "expected a 200 with the oversized step, got {}", response.status);
    anyhow::ensure!(!response.body.is_empty(), "oversized step body was unexpectedly empty");

    let observed_max = max_record_len.load(Ordering::SeqCst);
    anyhow::ensure!(observed_max > 0, "never observed a TLS record on the wire");
    anyhow::ensure!(
        observed_max <= MAX_FRAGMENT_LENGTH as usize + RECORD_OVERHEAD_SLACK,
        "a TLS record of {observed_max} bytes exceeded the {MAX_FRAGMENT_LENGTH}-byte max_fragment_length"
    );
    anyhow::ensure!(
        observed_max < response.body.len(),
        "the {}-byte oversized body fit in a single {observed_max}-byte record; it was never fragmented",
        response.body.len()
    );

    let _ = std::pin::Pin::new(&mut tls).shutdown().await;
    server.stop();
    handle.await?;

    log::info!(
        "S5 fragment length: a {}-byte step was delivered as TLS records no larger than {observed_max} bytes under a {MAX_FRAGMENT_LENGTH}-byte max_fragment_length",
        response.body.len()
    );
    Ok(())
}

async fn read_full_response(
    tls: &mut SslStream<RecordSniffer<TcpStream>>,
) -> anyhow::Result<AdminResponse> {
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
                        return Ok(http_envelope::parse_response(&buf[..total])?);
                    }
                }
            }
        }
        let read = tls.read(&mut chunk).await?;
        anyhow::ensure!(read > 0, "connection closed before a full response arrived");
        buf.extend_from_slice(&chunk[..read]);
    }
}

#[cfg(test)]
mod test {
    #[tokio::test]
    async fn oversized_step_is_fragmented_under_a_small_negotiated_fragment_length() {
        super::run().await.unwrap();
    }
}
