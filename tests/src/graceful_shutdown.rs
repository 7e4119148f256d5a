// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Scenario S6: five sessions handshaken and mid-flight when
//! `AdminServer::stop` is called. Each must be closed with reason
//! `SHUTDOWN` inside the grace window and `active_sessions` must
//! return to zero once the drain completes.

use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;

use scp81_core::event_bus::{Event, EventKind};
use scp81_core::http_envelope;
use scp81_server::server::AdminServer;
use scp81_server::ServerConfig;

use crate::harness;

const SESSION_COUNT: usize = 5;

pub async fn run() -> anyhow::Result<()> {
    let port = harness::pick_port();
    let config = ServerConfig { shutdown_grace: 3.0, ..harness::server_config(port) };
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

    // Handshake SESSION_COUNT clients and leave each one mid-session,
    // holding the connection open without completing its step.
    let mut clients = Vec::with_capacity(SESSION_COUNT);
    for _ in 0..SESSION_COUNT {
        let mut tls = harness::connect_psk_client(port).await?;
        let request = http_envelope::encode_request("/", harness::PSK_IDENTITY, None, false, &[]);
        tls.write_all(&request).await?;
        clients.push(tls);
    }

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    anyhow::ensure!(
        server.active_sessions() == SESSION_COUNT as u64,
        "expected {SESSION_COUNT} active sessions before shutdown, got {}",
        server.active_sessions()
    );

    server.stop();
    handle.await?;

    anyhow::ensure!(
        server.active_sessions() == 0,
        "expected active_sessions back to 0 after drain, got {}",
        server.active_sessions()
    );

    let events = events.lock().unwrap().clone();
    let shutdown_closes = events
        .iter()
        .filter(|e| {
            e.kind == EventKind::SessionEnded
                && e.payload.get("reason").and_then(|v| v.as_str()) == Some("SHUTDOWN")
        })
        .count();
    anyhow::ensure!(
        shutdown_closes == SESSION_COUNT,
        "expected {SESSION_COUNT} sessions closed with reason SHUTDOWN, got {shutdown_closes}"
    );

    // The clients stay alive until here so their sockets aren't closed
    // out from under the server mid-drain.
    drop(clients);

    log::info!("S6 graceful shutdown: {shutdown_closes} session(s) drained cleanly");
    Ok(())
}

#[cfg(test)]
mod test {
    #[tokio::test]
    async fn in_flight_sessions_drain_cleanly_on_shutdown() {
        super::run().await.unwrap();
    }
}
