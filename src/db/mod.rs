//! Database layer for sefaz-dfe
//!
//! SQLite persistence for identities (cursor, credential, cool-down) and
//! imported documents.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`identities`]: Cursor, credential and cool-down rows per identity
//! - [`documents`]: Imported documents, deduplicated by access key
//!
//! [`SqliteStore`] adapts a [`Database`] to the store traits, sealing and
//! opening certificate passphrases with a [`PassphraseCipher`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use secrecy::SecretString;
use sqlx::{FromRow, sqlite::SqlitePool};

use crate::crypto::{NONCE_LEN, PassphraseCipher, SealedPassphrase};
use crate::error::{DatabaseError, Error, Result};
use crate::store::{CooldownStore, CursorStore, DocumentSink, StoreOutcome};
use crate::types::{
    AccessKey, Amount, AuthorityCode, Credential, DocumentKind, FiscalDocument, Identity, Nsu,
    TaxId,
};

mod documents;
mod identities;
mod migrations;

/// Identity record from database
#[derive(Debug, Clone, FromRow)]
pub struct IdentityRow {
    /// CNPJ/CPF digits
    pub tax_id: String,
    /// IBGE state code of the request author
    pub authority: i64,
    /// Last persisted cursor (15-digit NSU)
    pub last_nsu: String,
    /// Last highest-available NSU reported by the service
    pub max_nsu: Option<String>,
    /// PKCS#12 bundle
    pub certificate: Option<Vec<u8>>,
    /// Sealed passphrase (ciphertext + tag)
    pub passphrase_ciphertext: Option<Vec<u8>>,
    /// Nonce of the sealed passphrase
    pub passphrase_nonce: Option<Vec<u8>>,
    /// Unix timestamp until which the identity is cooling down
    pub rate_limited_until: Option<i64>,
    /// Unix timestamp when the identity was first stored
    pub created_at: i64,
    /// Unix timestamp of the last change
    pub updated_at: i64,
}

impl IdentityRow {
    /// Parse the identity columns back into an [`Identity`]
    pub fn identity(&self) -> Result<Identity> {
        let authority = u8::try_from(self.authority)
            .map_err(|_| corrupt(format!("authority {} out of range", self.authority)))
            .and_then(|code| AuthorityCode::new(code).map_err(|e| corrupt(e.to_string())))?;
        let tax_id = TaxId::parse(&self.tax_id).map_err(|e| corrupt(e.to_string()))?;
        Ok(Identity::new(tax_id, authority))
    }

    /// Sealed passphrase, when one is stored
    pub fn sealed_passphrase(&self) -> Result<Option<SealedPassphrase>> {
        match (&self.passphrase_ciphertext, &self.passphrase_nonce) {
            (Some(ciphertext), Some(nonce)) => {
                let nonce: [u8; NONCE_LEN] = nonce
                    .as_slice()
                    .try_into()
                    .map_err(|_| corrupt(format!("nonce has {} bytes", nonce.len())))?;
                Ok(Some(SealedPassphrase {
                    ciphertext: ciphertext.clone(),
                    nonce,
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Document record from database
#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    /// 44-digit access key
    pub access_key: String,
    /// Tax-id of the identity that imported the document
    pub tax_id: String,
    /// Authority code of the identity that imported the document
    pub authority: i64,
    /// "summary" or "full"
    pub kind: String,
    /// Issuer CNPJ/CPF
    pub issuer_tax_id: String,
    /// Issuer legal name
    pub issuer_name: String,
    /// Document number
    pub number: String,
    /// Document series
    pub series: String,
    /// RFC 3339 issue timestamp
    pub issued_at: Option<String>,
    /// Issue date (`YYYY-MM-DD`, issuer's local date) for period filters
    pub issued_date: Option<String>,
    /// Gross amount in centavos
    pub gross_cents: i64,
    /// Discount amount in centavos
    pub discount_cents: i64,
    /// Net amount in centavos
    pub net_cents: i64,
    /// NSU at which the document was retrieved
    pub nsu: Option<String>,
    /// Feed schema name
    pub schema_name: Option<String>,
    /// Decompressed XML
    pub xml: Vec<u8>,
    /// Unix timestamp of the first import
    pub imported_at: i64,
    /// Unix timestamp of the last summary upgrade
    pub updated_at: i64,
}

impl TryFrom<DocumentRow> for FiscalDocument {
    type Error = Error;

    fn try_from(row: DocumentRow) -> Result<Self> {
        let issued_at = row
            .issued_at
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(|e| corrupt(format!("issued_at: {e}")))?;
        let nsu = row
            .nsu
            .as_deref()
            .map(str::parse::<Nsu>)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(FiscalDocument {
            access_key: AccessKey::parse(&row.access_key).map_err(|e| corrupt(e.to_string()))?,
            kind: row.kind.parse::<DocumentKind>().map_err(|e| corrupt(e.to_string()))?,
            issuer_tax_id: row.issuer_tax_id,
            issuer_name: row.issuer_name,
            number: row.number,
            series: row.series,
            issued_at,
            gross_amount: Amount::from_cents(row.gross_cents),
            discount_amount: Amount::from_cents(row.discount_cents),
            net_amount: Amount::from_cents(row.net_cents),
            nsu,
            schema: row.schema_name,
            raw_xml: row.xml,
        })
    }
}

/// Database handle for sefaz-dfe
pub struct Database {
    pool: SqlitePool,
}

pub(crate) fn corrupt(message: String) -> Error {
    Error::Database(DatabaseError::CorruptRow(message))
}

pub(crate) fn query_failed(context: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{context}: {e}")))
}

/// [`CursorStore`], [`DocumentSink`] and [`CooldownStore`] over SQLite
///
/// Passphrases are sealed on [`register`](Self::register) and only opened
/// inside [`load_credential`](CursorStore::load_credential).
pub struct SqliteStore {
    db: Arc<Database>,
    cipher: PassphraseCipher,
}

impl SqliteStore {
    /// Wrap a database; `cipher` seals and opens stored passphrases
    pub fn new(db: Arc<Database>, cipher: PassphraseCipher) -> Self {
        Self { db, cipher }
    }

    /// Underlying database
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Register an identity with its certificate, or replace its credential
    ///
    /// The stored cursor of an existing identity is kept.
    pub async fn register(
        &self,
        identity: &Identity,
        certificate: &[u8],
        passphrase: &SecretString,
    ) -> Result<()> {
        let sealed = self.cipher.seal(passphrase)?;
        self.db
            .upsert_credential(identity, certificate, &sealed)
            .await
    }

    /// Documents of an identity issued within `[from, to]`
    pub async fn documents_issued_between(
        &self,
        identity: &Identity,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<FiscalDocument>> {
        self.db
            .list_documents_issued_between(Some(identity), from, to)
            .await?
            .into_iter()
            .map(FiscalDocument::try_from)
            .collect()
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn load_cursor(&self, identity: &Identity) -> Result<Nsu> {
        Ok(self.db.get_cursor(identity).await?.unwrap_or(Nsu::ZERO))
    }

    async fn save_cursor(
        &self,
        identity: &Identity,
        cursor: Nsu,
        max_nsu: Option<Nsu>,
    ) -> Result<()> {
        self.db.set_cursor(identity, cursor, max_nsu).await
    }

    async fn load_credential(&self, identity: &Identity) -> Result<Credential> {
        let row = self
            .db
            .get_identity(identity)
            .await?
            .ok_or_else(|| Error::UnknownIdentity(identity.to_string()))?;
        let (Some(certificate), Some(sealed)) = (row.certificate.clone(), row.sealed_passphrase()?)
        else {
            return Err(Error::UnknownIdentity(identity.to_string()));
        };
        let passphrase = self.cipher.open(&sealed)?;
        Ok(Credential::new(certificate, passphrase))
    }
}

#[async_trait]
impl DocumentSink for SqliteStore {
    async fn store_document(
        &self,
        identity: &Identity,
        document: &FiscalDocument,
    ) -> Result<StoreOutcome> {
        self.db.insert_document(identity, document).await
    }
}

#[async_trait]
impl CooldownStore for SqliteStore {
    async fn cooldown_until(&self, identity: &Identity) -> Result<Option<DateTime<Utc>>> {
        let until = self.db.get_rate_limited_until(identity).await?;
        Ok(until.and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
    }

    async fn set_cooldown(&self, identity: &Identity, until: Option<DateTime<Utc>>) -> Result<()> {
        self.db
            .set_rate_limited_until(identity, until.map(|t| t.timestamp()))
            .await
    }
}
