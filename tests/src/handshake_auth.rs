// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Scenario S2: a client presenting an identity absent from the key
//! store never completes the PSK-TLS handshake and never gets a
//! session.

use std::sync::{Arc, Mutex};

use scp81_core::event_bus::EventKind;
use scp81_core::keystore::{KeyStore, MemoryKeyStore, PskRecord};
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

    let saw_handshake_failed = Arc::new(Mutex::new(false));
    let saw_session_started = Arc::new(Mutex::new(false));
    {
        let saw_handshake_failed = saw_handshake_failed.clone();
        let saw_session_started = saw_session_started.clone();
        server.events().subscribe_all(move |event| match event.kind {
            EventKind::HandshakeFailed => *saw_handshake_failed.lock().unwrap() = true,
            EventKind::SessionStarted => *saw_session_started.lock().unwrap() = true,
            _ => {}
        });
    }

    let handle = harness::spawn_server(server.clone());
    harness::wait_until_listening(port).await;

    let mut config = harness::simulator_config(port);
    config.psk_identity = "ghost".into();
    let sim = AdminSimulator::new(config)?;
    let result = sim.run().await;

    anyhow::ensure!(result.is_err(), "simulator with an unknown PSK identity should fail the handshake");

    server.stop();
    handle.await?;

    anyhow::ensure!(*saw_handshake_failed.lock().unwrap(), "server never emitted handshake_failed");
    anyhow::ensure!(!*saw_session_started.lock().unwrap(), "a session should never start for an unknown identity");

    log::info!("S2 unknown PSK identity: handshake rejected, no session created");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unknown_psk_identity_never_opens_a_session() {
        super::run().await.unwrap();
    }

    #[tokio::test]
    async fn expired_psk_identity_fails_the_handshake() {
        let port = harness::pick_port();

        let store = MemoryKeyStore::new();
        store
            .add(PskRecord {
                identity: harness::PSK_IDENTITY.to_string(),
                key: harness::PSK_KEY.to_vec(),
                description: None,
                created_at: chrono::Utc::now() - chrono::Duration::days(2),
                expires_at: Some(chrono::Utc::now() - chrono::Duration::days(1)),
            })
            .unwrap();
        let keystore: Arc<dyn KeyStore> = Arc::new(store);

        let server =
            Arc::new(AdminServer::new(harness::server_config(port), keystore, harness::engine_factory()).unwrap());

        let saw_handshake_failed = Arc::new(Mutex::new(false));
        {
            let saw_handshake_failed = saw_handshake_failed.clone();
            server.events().subscribe_all(move |event| {
                if event.kind == EventKind::HandshakeFailed {
                    *saw_handshake_failed.lock().unwrap() = true;
                }
            });
        }

        let handle = harness::spawn_server(server.clone());
        harness::wait_until_listening(port).await;

        let sim = AdminSimulator::new(harness::simulator_config(port)).unwrap();
        let result = sim.run().await;
        assert!(result.is_err(), "an expired PSK identity must not complete the handshake");

        server.stop();
        handle.await.unwrap();

        assert!(*saw_handshake_failed.lock().unwrap(), "server never emitted handshake_failed");
    }
}
