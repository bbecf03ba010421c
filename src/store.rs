//! Cursor, credential and document persistence contracts
//!
//! The distribution client itself never persists anything. Callers plug a
//! [`CursorStore`] (cursor and credential per identity) and a
//! [`DocumentSink`] (deduplicated document storage) into
//! [`SyncService`](crate::sync::SyncService).
//!
//! [`MemoryStore`] implements both for tests and embedding; the SQLite
//! implementations live in [`crate::db`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};
use crate::types::{AccessKey, Credential, DocumentKind, FiscalDocument, Identity, Nsu};

/// Per-identity cursor and credential storage
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Last persisted cursor; [`Nsu::ZERO`] for identities never synchronized
    async fn load_cursor(&self, identity: &Identity) -> Result<Nsu>;

    /// Persist the cursor (and the last reported max NSU, when known)
    async fn save_cursor(&self, identity: &Identity, cursor: Nsu, max_nsu: Option<Nsu>)
    -> Result<()>;

    /// Certificate and decrypted passphrase for the identity
    ///
    /// Fails with [`Error::UnknownIdentity`] when no credential is registered.
    async fn load_credential(&self, identity: &Identity) -> Result<Credential>;
}

/// Result of offering a document to a [`DocumentSink`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First time this access key was seen
    Inserted,
    /// A summary already stored under this key was replaced by the full document
    Upgraded,
    /// Already stored; nothing changed
    Duplicate,
}

/// Deduplicating document storage, keyed by access key
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Store a document unless one with the same access key already exists
    ///
    /// A full document replaces a stored summary; anything else is a duplicate.
    async fn store_document(&self, identity: &Identity, document: &FiscalDocument)
    -> Result<StoreOutcome>;
}

/// Rate-limit cool-down bookkeeping for an identity
#[async_trait]
pub trait CooldownStore: Send + Sync {
    /// Instant until which the identity must not contact the service, if any
    async fn cooldown_until(&self, identity: &Identity) -> Result<Option<DateTime<Utc>>>;

    /// Record a cool-down, or clear it with `None`
    async fn set_cooldown(&self, identity: &Identity, until: Option<DateTime<Utc>>) -> Result<()>;
}

/// Everything [`SyncService`](crate::sync::SyncService) persists
pub trait SyncStore: CursorStore + DocumentSink + CooldownStore {}

impl<T: CursorStore + DocumentSink + CooldownStore> SyncStore for T {}

#[derive(Default)]
struct MemoryIdentity {
    cursor: Nsu,
    max_nsu: Option<Nsu>,
    certificate: Option<Vec<u8>>,
    passphrase: Option<String>,
    cooldown_until: Option<DateTime<Utc>>,
}

/// In-process store for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    identities: Mutex<HashMap<Identity, MemoryIdentity>>,
    documents: Mutex<HashMap<AccessKey, FiscalDocument>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the credential of an identity
    pub fn register(&self, identity: &Identity, certificate: Vec<u8>, passphrase: &SecretString) {
        let mut identities = self.lock_identities();
        let entry = identities.entry(identity.clone()).or_default();
        entry.certificate = Some(certificate);
        entry.passphrase = Some(passphrase.expose_secret().to_string());
    }

    /// Last reported max NSU of an identity
    pub fn max_nsu(&self, identity: &Identity) -> Option<Nsu> {
        self.lock_identities().get(identity).and_then(|e| e.max_nsu)
    }

    /// Stored document by access key
    pub fn document(&self, key: &AccessKey) -> Option<FiscalDocument> {
        self.lock_documents().get(key).cloned()
    }

    /// Number of stored documents
    pub fn document_count(&self) -> usize {
        self.lock_documents().len()
    }

    fn lock_identities(&self) -> std::sync::MutexGuard<'_, HashMap<Identity, MemoryIdentity>> {
        self.identities
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_documents(&self) -> std::sync::MutexGuard<'_, HashMap<AccessKey, FiscalDocument>> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self, identity: &Identity) -> Result<Nsu> {
        Ok(self
            .lock_identities()
            .get(identity)
            .map(|e| e.cursor)
            .unwrap_or(Nsu::ZERO))
    }

    async fn save_cursor(
        &self,
        identity: &Identity,
        cursor: Nsu,
        max_nsu: Option<Nsu>,
    ) -> Result<()> {
        let mut identities = self.lock_identities();
        let entry = identities.entry(identity.clone()).or_default();
        entry.cursor = cursor;
        if max_nsu.is_some() {
            entry.max_nsu = max_nsu;
        }
        Ok(())
    }

    async fn load_credential(&self, identity: &Identity) -> Result<Credential> {
        let identities = self.lock_identities();
        let entry = identities
            .get(identity)
            .ok_or_else(|| Error::UnknownIdentity(identity.to_string()))?;
        match (&entry.certificate, &entry.passphrase) {
            (Some(certificate), Some(passphrase)) => Ok(Credential::new(
                certificate.clone(),
                SecretString::from(passphrase.clone()),
            )),
            _ => Err(Error::UnknownIdentity(identity.to_string())),
        }
    }
}

#[async_trait]
impl DocumentSink for MemoryStore {
    async fn store_document(
        &self,
        _identity: &Identity,
        document: &FiscalDocument,
    ) -> Result<StoreOutcome> {
        let mut documents = self.lock_documents();
        let outcome = match documents.get(&document.access_key) {
            None => StoreOutcome::Inserted,
            Some(existing)
                if existing.kind == DocumentKind::Summary && document.kind == DocumentKind::Full =>
            {
                StoreOutcome::Upgraded
            }
            Some(_) => return Ok(StoreOutcome::Duplicate),
        };
        documents.insert(document.access_key.clone(), document.clone());
        Ok(outcome)
    }
}

#[async_trait]
impl CooldownStore for MemoryStore {
    async fn cooldown_until(&self, identity: &Identity) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .lock_identities()
            .get(identity)
            .and_then(|e| e.cooldown_until))
    }

    async fn set_cooldown(&self, identity: &Identity, until: Option<DateTime<Utc>>) -> Result<()> {
        self.lock_identities()
            .entry(identity.clone())
            .or_default()
            .cooldown_until = until;
        Ok(())
    }
}
