// Copyright (c) 2024 The SCP81 Admin Harness Authors

//! PSK key store: maps a PSK identity to key material and metadata.
//!
//! Three backends share one contract: an authoritative in-memory map,
//! a file-backed store reloadable on explicit command, and a
//! repository-backed store that delegates to an external persistence
//! layer the TLS layer never needs to know about.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A single PSK record.
///
/// Invariant: `identity` is ASCII, 1-128 bytes; `key` is 16 or 32 raw
/// bytes. Key material is never included in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskRecord {
    pub identity: String,
    #[serde(with = "hex_key")]
    pub key: Vec<u8>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for PskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PskRecord")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .field("description", &self.description)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl PskRecord {
    pub fn validate(&self) -> Result<(), Error> {
        if self.identity.is_empty() || self.identity.len() > 128 || !self.identity.is_ascii() {
            return Err(Error::config(format!(
                "PSK identity {:?} must be 1-128 ASCII bytes",
                self.identity
            )));
        }
        match self.key.len() {
            16 | 32 => Ok(()),
            n => Err(Error::config(format!(
                "PSK key for {:?} must be 16 or 32 bytes, got {n}",
                self.identity
            ))),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}

/// Document format for the file-backed key store (spec §6): a list of
/// `[[records]]` tables, TOML-encoded.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct KeyStoreDocument {
    #[serde(default)]
    pub records: Vec<PskRecord>,
}

/// Shared contract across all key store backends. The TLS layer only
/// ever sees this trait, never the concrete backend.
pub trait KeyStore: Send + Sync {
    fn lookup(&self, identity: &str) -> Option<PskRecord>;
    fn add(&self, record: PskRecord) -> Result<(), Error>;
    fn remove(&self, identity: &str) -> Result<(), Error>;
    fn list(&self) -> Vec<PskRecord>;
}

/// Authoritative in-memory backend. Lookups never block on I/O.
pub struct MemoryKeyStore {
    records: RwLock<HashMap<String, PskRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self { records: RwLock::new(HashMap::new()) }
    }

    pub fn from_records(records: Vec<PskRecord>) -> Result<Self, Error> {
        let store = Self::new();
        for record in records {
            store.add(record)?;
        }
        Ok(store)
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn lookup(&self, identity: &str) -> Option<PskRecord> {
        self.records.read().unwrap().get(identity).cloned()
    }

    fn add(&self, record: PskRecord) -> Result<(), Error> {
        record.validate()?;
        let mut guard = self.records.write().unwrap();
        if guard.contains_key(&record.identity) {
            return Err(Error::config(format!("duplicate PSK identity {:?}", record.identity)));
        }
        guard.insert(record.identity.clone(), record);
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), Error> {
        self.records.write().unwrap().remove(identity);
        Ok(())
    }

    fn list(&self) -> Vec<PskRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }
}

/// File-backed key store. Caches the document in memory; `reload()` is
/// the only way the on-disk file is re-read, matching the "explicit
/// command" policy spec §9 requires (the source's file-change-signal
/// variant is allowed but not mandated, and is not implemented here).
pub struct FileKeyStore {
    path: PathBuf,
    inner: MemoryKeyStore,
}

impl FileKeyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let store = Self { path, inner: MemoryKeyStore::new() };
        store.reload()?;
        Ok(store)
    }

    /// Re-read the backing file, replacing the in-memory snapshot.
    ///
    /// On I/O failure the previous snapshot is retained and the error is
    /// logged, per spec §4.1 ("failure... logs and retains the previous
    /// snapshot"); on parse failure (duplicate identity, bad hex) the
    /// error propagates since that indicates an operator mistake in the
    /// document, not a transient I/O hiccup.
    pub fn reload(&self) -> Result<(), Error> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!(
                    "key store reload failed for {}: {e}; retaining previous snapshot",
                    self.path.display()
                );
                return Ok(());
            }
        };

        let doc: KeyStoreDocument = toml::from_str(&contents)?;
        let mut seen = HashMap::new();
        for record in &doc.records {
            record.validate()?;
            if seen.insert(record.identity.clone(), ()).is_some() {
                return Err(Error::config(format!("duplicate PSK identity {:?}", record.identity)));
            }
        }

        let fresh: HashMap<_, _> =
            doc.records.into_iter().map(|r| (r.identity.clone(), r)).collect();
        *self.inner.records.write().unwrap() = fresh;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn lookup(&self, identity: &str) -> Option<PskRecord> {
        self.inner.lookup(identity)
    }

    fn add(&self, record: PskRecord) -> Result<(), Error> {
        self.inner.add(record)
    }

    fn remove(&self, identity: &str) -> Result<(), Error> {
        self.inner.remove(identity)
    }

    fn list(&self) -> Vec<PskRecord> {
        self.inner.list()
    }
}

/// Delegates to an external persistence layer (out of scope per spec
/// §1); the trait object is whatever the host application's repository
/// exposes, kept narrow on purpose.
pub trait KeyRepository: Send + Sync {
    fn fetch(&self, identity: &str) -> Option<PskRecord>;
    fn upsert(&self, record: PskRecord) -> Result<(), Error>;
    fn delete(&self, identity: &str) -> Result<(), Error>;
    fn fetch_all(&self) -> Vec<PskRecord>;
}

pub struct RepositoryKeyStore {
    repo: Box<dyn KeyRepository>,
}

impl RepositoryKeyStore {
    pub fn new(repo: Box<dyn KeyRepository>) -> Self {
        Self { repo }
    }
}

impl KeyStore for RepositoryKeyStore {
    fn lookup(&self, identity: &str) -> Option<PskRecord> {
        self.repo.fetch(identity)
    }

    fn add(&self, record: PskRecord) -> Result<(), Error> {
        record.validate()?;
        self.repo.upsert(record)
    }

    fn remove(&self, identity: &str) -> Result<(), Error> {
        self.repo.delete(identity)
    }

    fn list(&self) -> Vec<PskRecord> {
        self.repo.fetch_all()
    }
}
