// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! Server configuration: `CipherConfig`/`ServerConfig`, the same field
//! names, defaults, and validation rules a production deployment would
//! expect, as `serde`-deserializable structs.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Cipher suite grouping and TLS fragment-size policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CipherConfig {
    #[serde(default = "CipherConfig::default_production_ciphers")]
    pub production_ciphers: Vec<String>,
    #[serde(default = "CipherConfig::default_legacy_ciphers")]
    pub legacy_ciphers: Vec<String>,
    #[serde(default = "CipherConfig::default_null_ciphers")]
    pub null_ciphers: Vec<String>,
    #[serde(default = "CipherConfig::default_tls13_ciphers")]
    pub tls13_ciphers: Vec<String>,
    #[serde(default)]
    pub enable_legacy: bool,
    #[serde(default)]
    pub enable_null_ciphers: bool,
    #[serde(default)]
    pub enable_tls13: bool,
    /// RFC 6066 max-fragment-length, one of 512/1024/2048/4096, or
    /// `None` to not advertise support.
    #[serde(default)]
    pub max_fragment_length: Option<u16>,
}

impl CipherConfig {
    fn default_production_ciphers() -> Vec<String> {
        vec!["PSK-AES128-CBC-SHA256".into(), "PSK-AES256-CBC-SHA384".into()]
    }

    fn default_legacy_ciphers() -> Vec<String> {
        vec!["PSK-AES128-CBC-SHA".into(), "PSK-AES256-CBC-SHA".into()]
    }

    fn default_null_ciphers() -> Vec<String> {
        vec!["PSK-NULL-SHA256".into(), "PSK-NULL-SHA".into()]
    }

    fn default_tls13_ciphers() -> Vec<String> {
        vec!["TLS_AES_128_CCM_SHA256".into(), "TLS_AES_128_GCM_SHA256".into()]
    }

    /// The cipher suites actually offered, given the enable flags.
    pub fn get_enabled_ciphers(&self) -> Vec<String> {
        let mut ciphers = self.production_ciphers.clone();
        if self.enable_legacy {
            ciphers.extend(self.legacy_ciphers.clone());
        }
        if self.enable_null_ciphers {
            log::warn!("PSK-NULL ciphers enabled: this connection offers no confidentiality");
            ciphers.extend(self.null_ciphers.clone());
        }
        if self.enable_tls13 {
            ciphers.extend(self.tls13_ciphers.clone());
        }
        ciphers
    }

    /// Render the enabled set as an OpenSSL cipher-list string, for
    /// `SslAcceptorBuilder::set_cipher_list`.
    pub fn get_openssl_cipher_string(&self) -> String {
        self.get_enabled_ciphers().join(":")
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.production_ciphers.is_empty() {
            return Err(Error::Config("production_ciphers must not be empty".into()));
        }
        if let Some(mfl) = self.max_fragment_length {
            if ![512, 1024, 2048, 4096].contains(&mfl) {
                return Err(Error::Config(format!(
                    "max_fragment_length must be one of 512, 1024, 2048, 4096 (got {mfl})"
                )));
            }
        }
        Ok(())
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            production_ciphers: Self::default_production_ciphers(),
            legacy_ciphers: Self::default_legacy_ciphers(),
            null_ciphers: Self::default_null_ciphers(),
            tls13_ciphers: Self::default_tls13_ciphers(),
            enable_legacy: false,
            enable_null_ciphers: false,
            enable_tls13: false,
            max_fragment_length: None,
        }
    }
}

/// Top-level server configuration, `serde`-deserializable from TOML for
/// non-interactive launches and also reachable via the CLI flags in
/// `scp81-server`'s binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "ServerConfig::default_host")]
    pub host: String,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "ServerConfig::default_session_timeout")]
    pub session_timeout: f64,
    #[serde(default = "ServerConfig::default_handshake_timeout")]
    pub handshake_timeout: f64,
    #[serde(default = "ServerConfig::default_read_timeout")]
    pub read_timeout: f64,
    #[serde(default = "ServerConfig::default_backlog")]
    pub backlog: u32,
    #[serde(default = "ServerConfig::default_thread_pool_size")]
    pub thread_pool_size: usize,
    #[serde(default)]
    pub cipher_config: CipherConfig,
    #[serde(default)]
    pub key_store_path: Option<String>,
    #[serde(default = "ServerConfig::default_log_level")]
    pub log_level: String,
    /// Graceful-shutdown grace period (spec §4.8); not present in the
    /// original `ServerConfig` but required by the shutdown contract.
    #[serde(default = "ServerConfig::default_shutdown_grace")]
    pub shutdown_grace: f64,
}

impl ServerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }
    fn default_port() -> u16 {
        8443
    }
    fn default_max_connections() -> usize {
        100
    }
    fn default_session_timeout() -> f64 {
        300.0
    }
    fn default_handshake_timeout() -> f64 {
        30.0
    }
    fn default_read_timeout() -> f64 {
        30.0
    }
    fn default_backlog() -> u32 {
        5
    }
    fn default_thread_pool_size() -> usize {
        10
    }
    fn default_log_level() -> String {
        "INFO".to_string()
    }
    fn default_shutdown_grace() -> f64 {
        5.0
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.port == 0 {
            return Err(Error::Config("port must be in 1-65535".into()));
        }
        if self.max_connections < 1 {
            return Err(Error::Config("max_connections must be >= 1".into()));
        }
        for (name, value) in [
            ("session_timeout", self.session_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if value <= 0.0 {
                return Err(Error::Config(format!("{name} must be > 0")));
            }
        }
        if self.thread_pool_size < 1 {
            return Err(Error::Config("thread_pool_size must be >= 1".into()));
        }
        self.cipher_config.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            max_connections: Self::default_max_connections(),
            session_timeout: Self::default_session_timeout(),
            handshake_timeout: Self::default_handshake_timeout(),
            read_timeout: Self::default_read_timeout(),
            backlog: Self::default_backlog(),
            thread_pool_size: Self::default_thread_pool_size(),
            cipher_config: CipherConfig::default(),
            key_store_path: None,
            log_level: Self::default_log_level(),
            shutdown_grace: Self::default_shutdown_grace(),
        }
    }
}
