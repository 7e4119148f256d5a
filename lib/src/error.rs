// Copyright (c) 2024 The SCP81 Admin Harness Authors

/// Transport/server-level errors that sit above [`scp81_core::Error`]:
/// failures in standing up the listener or the TLS acceptor itself,
/// rather than failures within an already-running session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: std::net::SocketAddr, #[source] source: std::io::Error },

    #[error("TLS acceptor configuration failed: {0}")]
    TlsSetup(#[from] openssl::error::ErrorStack),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] scp81_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
