//! Identity rows: cursor, credential and rate-limit cool-down.

use crate::Result;
use crate::crypto::SealedPassphrase;
use crate::types::{Identity, Nsu};

use super::{Database, IdentityRow, corrupt, query_failed};

impl Database {
    /// Make sure a row exists for the identity (cursor at zero, no credential)
    pub(crate) async fn ensure_identity(&self, identity: &Identity) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO identities (tax_id, authority, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(tax_id, authority) DO NOTHING
            "#,
        )
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to create identity", e))?;

        Ok(())
    }

    /// Store (or replace) the certificate and sealed passphrase of an identity
    ///
    /// The cursor of an existing identity is left untouched.
    pub async fn upsert_credential(
        &self,
        identity: &Identity,
        certificate: &[u8],
        sealed: &SealedPassphrase,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO identities (
                tax_id, authority, certificate, passphrase_ciphertext, passphrase_nonce,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tax_id, authority) DO UPDATE SET
                certificate = excluded.certificate,
                passphrase_ciphertext = excluded.passphrase_ciphertext,
                passphrase_nonce = excluded.passphrase_nonce,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .bind(certificate)
        .bind(&sealed.ciphertext)
        .bind(&sealed.nonce[..])
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to store credential", e))?;

        tracing::info!(identity = %identity, "identity credential stored");
        Ok(())
    }

    /// Get the full row of an identity
    pub async fn get_identity(&self, identity: &Identity) -> Result<Option<IdentityRow>> {
        sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT tax_id, authority, last_nsu, max_nsu, certificate, passphrase_ciphertext,
                   passphrase_nonce, rate_limited_until, created_at, updated_at
            FROM identities
            WHERE tax_id = ? AND authority = ?
            "#,
        )
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to get identity", e))
    }

    /// List every stored identity, ordered by tax-id
    pub async fn list_identities(&self) -> Result<Vec<Identity>> {
        let rows = sqlx::query_as::<_, IdentityRow>(
            r#"
            SELECT tax_id, authority, last_nsu, max_nsu, certificate, passphrase_ciphertext,
                   passphrase_nonce, rate_limited_until, created_at, updated_at
            FROM identities
            ORDER BY tax_id, authority
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to list identities", e))?;

        rows.iter().map(IdentityRow::identity).collect()
    }

    /// Get the stored cursor of an identity
    ///
    /// Returns None if the identity has never been stored.
    pub async fn get_cursor(&self, identity: &Identity) -> Result<Option<Nsu>> {
        let cursor: Option<String> = sqlx::query_scalar(
            "SELECT last_nsu FROM identities WHERE tax_id = ? AND authority = ?",
        )
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to get cursor", e))?;

        cursor
            .map(|c| c.parse::<Nsu>().map_err(|e| corrupt(e.to_string())))
            .transpose()
    }

    /// Persist the cursor of an identity, creating the row if needed
    ///
    /// A `None` max NSU keeps the previously stored value.
    pub async fn set_cursor(
        &self,
        identity: &Identity,
        cursor: Nsu,
        max_nsu: Option<Nsu>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO identities (tax_id, authority, last_nsu, max_nsu, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(tax_id, authority) DO UPDATE SET
                last_nsu = excluded.last_nsu,
                max_nsu = COALESCE(excluded.max_nsu, identities.max_nsu),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .bind(cursor.to_string())
        .bind(max_nsu.map(|n| n.to_string()))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to set cursor", e))?;

        tracing::debug!(identity = %identity, nsu = %cursor, "cursor persisted");
        Ok(())
    }

    /// Unix timestamp until which the identity is cooling down
    pub async fn get_rate_limited_until(&self, identity: &Identity) -> Result<Option<i64>> {
        let until: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT rate_limited_until FROM identities WHERE tax_id = ? AND authority = ?",
        )
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to get cool-down", e))?;

        Ok(until.flatten())
    }

    /// Set or clear the cool-down of an identity
    pub async fn set_rate_limited_until(&self, identity: &Identity, until: Option<i64>) -> Result<()> {
        self.ensure_identity(identity).await?;
        sqlx::query(
            r#"
            UPDATE identities SET rate_limited_until = ?, updated_at = ?
            WHERE tax_id = ? AND authority = ?
            "#,
        )
        .bind(until)
        .bind(chrono::Utc::now().timestamp())
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to set cool-down", e))?;

        Ok(())
    }
}
