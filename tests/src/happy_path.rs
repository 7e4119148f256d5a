// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Scenario S1: a single-`SELECT` script run end to end over a real
//! PSK-TLS loopback connection, asserting both the simulator's outcome
//! and the exact event sequence spec §8 names.

use std::sync::{Arc, Mutex};

use scp81_core::event_bus::EventKind;
use scp81_core::session::ScriptStatus;
use scp81_server::server::AdminServer;
use scp81_simulator::AdminSimulator;

use crate::harness;

pub async fn run() -> anyhow::Result<()> {
    let port = harness::pick_port();
    let server = Arc::new(AdminServer::new(
        harness::server_config(port),
        harness::keystore(),
        harness::engine_factory(),
    )?);

    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let observed = observed.clone();
        server.events().subscribe_all(move |event| {
            observed.lock().unwrap().push(event.kind);
        });
    }

    let handle = harness::spawn_server(server.clone());
    harness::wait_until_listening(port).await;

    let sim = AdminSimulator::new(harness::simulator_config(port))?;
    let outcome = sim.run().await?;

    anyhow::ensure!(outcome.steps == 1, "expected exactly one script step, got {}", outcome.steps);
    anyhow::ensure!(outcome.final_status == ScriptStatus::Ok, "expected Ok, got {:?}", outcome.final_status);

    server.stop();
    handle.await?;

    let events = observed.lock().unwrap().clone();
    let expected = [
        EventKind::ServerStarted,
        EventKind::HandshakeCompleted,
        EventKind::SessionStarted,
        EventKind::ApduCommand,
        EventKind::ApduResponse,
        EventKind::SessionEnded,
    ];
    anyhow::ensure!(
        events == expected,
        "unexpected event sequence: {events:?} (wanted {expected:?})"
    );

    log::info!("S1 happy path: {} step(s), final status {:?}", outcome.steps, outcome.final_status);
    Ok(())
}

#[cfg(test)]
mod test {
    #[tokio::test]
    async fn happy_path_completes_with_ok_status() {
        super::run().await.unwrap();
    }
}
