// Copyright (c) 2024 The SCP81 Admin Harness Authors

/// Error taxonomy for the Admin session lifecycle.
///
/// A flat `thiserror` enum, one variant per failure kind: messages
/// never embed PSK key material, and `#[from]` conversions sit at
/// crate boundaries (I/O, TOML parsing) rather than hand-rolled `From`
/// impls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid listen port, missing required key, unparseable key store.
    /// Fatal at start; never raised at runtime.
    #[error("configuration error: {0}")]
    Config(String),

    /// PSK identity not present in the key store during handshake.
    #[error("unknown PSK identity {identity:?}")]
    KeyNotFound { identity: String },

    /// Any TLS failure before the session reaches `Open`.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// HTTP parse failure, malformed `X-Admin-*` header, or any other
    /// envelope defect that maps to a `400` (spec §4.5/§4.6).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request `Content-Type` didn't match the expected Admin media
    /// type; maps to a `415` rather than a generic `400`.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Handshake, per-envelope read, or session-inactivity timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Client reported a non-`ok` `X-Admin-Script-Status`.
    #[error("script aborted with status {0:?}")]
    ScriptAbort(crate::session::ScriptStatus),

    /// Unexpected peer close mid-envelope.
    #[error("peer interrupted the session")]
    Interrupted,

    /// Anything unexpected; never leaked to the peer.
    #[error("internal error: {source}")]
    Internal {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    pub fn internal<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal { source: Box::new(source) }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::internal(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
