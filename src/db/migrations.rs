//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&mut conn).await?;
        }
        if current_version < 2 {
            Self::migrate_v2(&mut conn).await?;
        }

        Ok(())
    }

    /// Migration v1: identities and documents
    async fn migrate_v1(conn: &mut SqliteConnection) -> Result<()> {
        Self::begin_migration(conn, 1).await?;

        let result = async {
            Self::create_identities_table(conn).await?;
            Self::create_documents_schema(conn).await?;
            Self::record_migration(conn, 1).await?;
            Ok::<(), Error>(())
        }
        .await;

        Self::finish_migration(conn, 1, result).await
    }

    /// Migration v2: rate-limit cool-down per identity
    async fn migrate_v2(conn: &mut SqliteConnection) -> Result<()> {
        Self::begin_migration(conn, 2).await?;

        let result = async {
            execute_ddl(
                conn,
                "ALTER TABLE identities ADD COLUMN rate_limited_until INTEGER",
                "Failed to add rate_limited_until column",
            )
            .await?;
            Self::record_migration(conn, 2).await?;
            Ok::<(), Error>(())
        }
        .await;

        Self::finish_migration(conn, 2, result).await
    }

    // Migrations run inside a transaction so partial failures don't leave the DB in a broken state
    async fn begin_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        tracing::info!("Applying database migration v{}", version);

        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        Ok(())
    }

    async fn finish_migration(
        conn: &mut SqliteConnection,
        version: i32,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{}: {}",
                            version, e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!("Database migration v{} complete", version);
        Ok(())
    }

    /// Create identities table
    async fn create_identities_table(conn: &mut SqliteConnection) -> Result<()> {
        execute_ddl(
            conn,
            r#"
            CREATE TABLE identities (
                tax_id TEXT NOT NULL,
                authority INTEGER NOT NULL,
                last_nsu TEXT NOT NULL DEFAULT '000000000000000',
                max_nsu TEXT,
                certificate BLOB,
                passphrase_ciphertext BLOB,
                passphrase_nonce BLOB,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tax_id, authority)
            )
            "#,
            "Failed to create identities table",
        )
        .await
    }

    /// Create documents table and its indexes
    async fn create_documents_schema(conn: &mut SqliteConnection) -> Result<()> {
        execute_ddl(
            conn,
            r#"
            CREATE TABLE documents (
                access_key TEXT PRIMARY KEY,
                tax_id TEXT NOT NULL,
                authority INTEGER NOT NULL,
                kind TEXT NOT NULL,
                issuer_tax_id TEXT NOT NULL,
                issuer_name TEXT NOT NULL,
                number TEXT NOT NULL,
                series TEXT NOT NULL,
                issued_at TEXT,
                issued_date TEXT,
                gross_cents INTEGER NOT NULL,
                discount_cents INTEGER NOT NULL,
                net_cents INTEGER NOT NULL,
                nsu TEXT,
                schema_name TEXT,
                xml BLOB NOT NULL,
                imported_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (tax_id, authority) REFERENCES identities(tax_id, authority)
            )
            "#,
            "Failed to create documents table",
        )
        .await?;

        execute_ddl(
            conn,
            "CREATE INDEX idx_documents_identity_date ON documents(tax_id, authority, issued_date)",
            "Failed to create index",
        )
        .await?;

        execute_ddl(
            conn,
            "CREATE INDEX idx_documents_issuer ON documents(issuer_tax_id)",
            "Failed to create index",
        )
        .await
    }

    async fn record_migration(conn: &mut SqliteConnection, version: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn execute_ddl(conn: &mut SqliteConnection, sql: &str, context: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!("{}: {}", context, e)))
        })?;
    Ok(())
}
