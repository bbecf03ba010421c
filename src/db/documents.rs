//! Imported documents, deduplicated by access key.

use chrono::NaiveDate;

use crate::Result;
use crate::store::StoreOutcome;
use crate::types::{AccessKey, DocumentKind, FiscalDocument, Identity};

use super::{Database, DocumentRow, query_failed};

const DOCUMENT_COLUMNS: &str = r#"
    access_key, tax_id, authority, kind, issuer_tax_id, issuer_name, number, series,
    issued_at, issued_date, gross_cents, discount_cents, net_cents, nsu, schema_name, xml,
    imported_at, updated_at
"#;

impl Database {
    /// Insert a document unless its access key is already stored
    ///
    /// A full document replaces a stored summary of the same key.
    pub async fn insert_document(
        &self,
        identity: &Identity,
        document: &FiscalDocument,
    ) -> Result<StoreOutcome> {
        self.ensure_identity(identity).await?;

        let now = chrono::Utc::now().timestamp();
        let issued_at = document.issued_at.map(|at| at.to_rfc3339());
        let issued_date = document
            .issued_at
            .map(|at| at.date_naive().format("%Y-%m-%d").to_string());

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (
                access_key, tax_id, authority, kind, issuer_tax_id, issuer_name, number, series,
                issued_at, issued_date, gross_cents, discount_cents, net_cents, nsu, schema_name,
                xml, imported_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(access_key) DO NOTHING
            "#,
        )
        .bind(document.access_key.as_str())
        .bind(identity.tax_id.as_str())
        .bind(i64::from(identity.authority.get()))
        .bind(document.kind.as_str())
        .bind(&document.issuer_tax_id)
        .bind(&document.issuer_name)
        .bind(&document.number)
        .bind(&document.series)
        .bind(&issued_at)
        .bind(&issued_date)
        .bind(document.gross_amount.cents())
        .bind(document.discount_amount.cents())
        .bind(document.net_amount.cents())
        .bind(document.nsu.map(|n| n.to_string()))
        .bind(&document.schema)
        .bind(&document.raw_xml)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to insert document", e))?
        .rows_affected();

        if inserted == 1 {
            return Ok(StoreOutcome::Inserted);
        }
        if document.kind != DocumentKind::Full {
            return Ok(StoreOutcome::Duplicate);
        }

        // Only a stored summary may be replaced; the NSU of the feed entry is kept
        let upgraded = sqlx::query(
            r#"
            UPDATE documents SET
                kind = ?, issuer_tax_id = ?, issuer_name = ?, number = ?, series = ?,
                issued_at = COALESCE(?, issued_at), issued_date = COALESCE(?, issued_date),
                gross_cents = ?, discount_cents = ?, net_cents = ?,
                schema_name = COALESCE(?, schema_name), xml = ?, updated_at = ?
            WHERE access_key = ? AND kind = 'summary'
            "#,
        )
        .bind(document.kind.as_str())
        .bind(&document.issuer_tax_id)
        .bind(&document.issuer_name)
        .bind(&document.number)
        .bind(&document.series)
        .bind(&issued_at)
        .bind(&issued_date)
        .bind(document.gross_amount.cents())
        .bind(document.discount_amount.cents())
        .bind(document.net_amount.cents())
        .bind(&document.schema)
        .bind(&document.raw_xml)
        .bind(now)
        .bind(document.access_key.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to upgrade document", e))?
        .rows_affected();

        Ok(if upgraded == 1 {
            StoreOutcome::Upgraded
        } else {
            StoreOutcome::Duplicate
        })
    }

    /// Get a stored document by access key
    pub async fn get_document(&self, access_key: &AccessKey) -> Result<Option<DocumentRow>> {
        sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE access_key = ?"
        ))
        .bind(access_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to get document", e))
    }

    /// Documents issued within `[from, to]` (inclusive), oldest first
    ///
    /// Documents without an issue date are never returned. `identity` limits
    /// the result to documents imported by that identity.
    pub async fn list_documents_issued_between(
        &self,
        identity: Option<&Identity>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DocumentRow>> {
        let from = from.format("%Y-%m-%d").to_string();
        let to = to.format("%Y-%m-%d").to_string();

        let rows = match identity {
            Some(identity) => {
                sqlx::query_as::<_, DocumentRow>(&format!(
                    r#"
                    SELECT {DOCUMENT_COLUMNS} FROM documents
                    WHERE tax_id = ? AND authority = ? AND issued_date BETWEEN ? AND ?
                    ORDER BY issued_at ASC, access_key ASC
                    "#
                ))
                .bind(identity.tax_id.as_str())
                .bind(i64::from(identity.authority.get()))
                .bind(&from)
                .bind(&to)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, DocumentRow>(&format!(
                    r#"
                    SELECT {DOCUMENT_COLUMNS} FROM documents
                    WHERE issued_date BETWEEN ? AND ?
                    ORDER BY issued_at ASC, access_key ASC
                    "#
                ))
                .bind(&from)
                .bind(&to)
                .fetch_all(&self.pool)
                .await
            }
        };

        rows.map_err(|e| query_failed("Failed to list documents", e))
    }

    /// Number of stored documents
    pub async fn count_documents(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to count documents", e))
    }
}
