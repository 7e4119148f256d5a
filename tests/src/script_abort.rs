// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Scenario S3: a three-step script whose second `SELECT` targets an
//! AID the card doesn't know. Under strict AID matching the simulator
//! reports a non-ok script status after that step, the server aborts
//! the script immediately, and the third command is never sent.

use std::sync::{Arc, Mutex};

use scp81_core::event_bus::{Event, EventKind};
use scp81_core::session::ScriptStatus;
use scp81_server::server::AdminServer;
use scp81_simulator::AdminSimulator;

use crate::harness;

pub async fn run() -> anyhow::Result<()> {
    let port = harness::pick_port();
    let server = Arc::new(
        AdminServer::new(harness::server_config(port), harness::keystore(), harness::engine_factory())?
            .with_script(Arc::new(harness::script_abort_script)),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let events = events.clone();
        server.events().subscribe_all(move |event: &Event| {
            events.lock().unwrap().push(event.clone());
        });
    }

    let handle = harness::spawn_server(server.clone());
    harness::wait_until_listening(port).await;

    let mut config = harness::simulator_config(port);
    config.strict_aid_matching = true;
    let sim = AdminSimulator::new(config)?;
    let outcome = sim.run().await?;

    anyhow::ensure!(outcome.steps == 2, "expected exactly 2 steps before abort, got {}", outcome.steps);
    anyhow::ensure!(
        outcome.final_status == ScriptStatus::UnknownApplication,
        "expected UnknownApplication, got {:?}",
        outcome.final_status
    );

    server.stop();
    handle.await?;

    let events = events.lock().unwrap().clone();
    let command_count = events.iter().filter(|e| e.kind == EventKind::ApduCommand).count();
    let response_count = events.iter().filter(|e| e.kind == EventKind::ApduResponse).count();
    anyhow::ensure!(command_count == 2, "expected 2 commands sent before abort, got {command_count}");
    anyhow::ensure!(response_count == 2, "expected 2 responses logged before abort, got {response_count}");

    let session_ended =
        events.iter().find(|e| e.kind == EventKind::SessionEnded).expect("server never emitted session_ended");
    let reason = session_ended.payload.get("reason").and_then(|v| v.as_str()).unwrap_or_default();
    anyhow::ensure!(reason == "SCRIPT_ABORT", "expected close reason SCRIPT_ABORT, got {reason}");

    log::info!("S3 script abort: {command_count} command(s)/{response_count} response(s) logged before abort");
    Ok(())
}

#[cfg(test)]
mod test {
    #[tokio::test]
    async fn unknown_aid_under_strict_matching_aborts_the_script() {
        super::run().await.unwrap();
    }
}
