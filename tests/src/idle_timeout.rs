// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Scenario S4: a client that completes the handshake and one exchange
//! then goes quiet. The server's read on the next envelope must time
//! out at `session_timeout` and close the session as idle, rather than
//! waiting forever.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use scp81_core::event_bus::{Event, EventKind};
use scp81_core::http_envelope;
use scp81_server::server::AdminServer;
use scp81_server::ServerConfig;

use crate::harness;

const SESSION_TIMEOUT_SECS: f64 = 1.5;

pub async fn run() -> anyhow::Result<()> {
    let port = harness::pick_port();
    let config = ServerConfig { session_timeout: SESSION_TIMEOUT_SECS, ..harness::server_config(port) };
    let server = Arc::new(AdminServer::new(config, harness::keystore(), harness::engine_factory())?);

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        server.events().subscribe_all(move |event: &Event| {
            events.lock().unwrap().push(event.clone());
        });
    }

    let handle = harness::spawn_server(server.clone());
    harness::wait_until_listening(port).await;

    let mut tls = harness::connect_psk_client(port).await?;

    // The initial empty POST, and its one scripted SELECT step.
    let request = http_envelope::encode_request("/", harness::PSK_IDENTITY, None, false, &[]);
    tls.write_all(&request).await?;

    // Go quiet instead of reporting a response for the step just sent.
    // The server's read on the next envelope must time out.
    tokio::time::sleep(Duration::from_secs_f64(SESSION_TIMEOUT_SECS + 2.0)).await;

    server.stop();
    handle.await?;

    let events = events.lock().unwrap().clone();
    let session_ended =
        events.iter().find(|e| e.kind == EventKind::SessionEnded).expect("server never emitted session_ended");
    let reason = session_ended.payload.get("reason").and_then(|v| v.as_str()).unwrap_or_default();
    anyhow::ensure!(reason == "TIMEOUT", "expected close reason TIMEOUT, got {reason}");

    log::info!("S4 idle timeout: session closed with reason {reason}");
    Ok(())
}

#[cfg(test)]
mod test {
    #[tokio::test]
    async fn quiet_client_is_closed_as_idle_timeout() {
        super::run().await.unwrap();
    }
}
