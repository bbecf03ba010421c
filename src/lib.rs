//! # sefaz-dfe
//!
//! Client for the SEFAZ NF-e distribution service (`NFeDistribuicaoDFe`).
//!
//! The service hands out fiscal documents addressed to a company (CNPJ) or
//! person (CPF) through a cursor-paginated SOAP feed. Each identity has its
//! own cursor (NSU), authenticates with a PKCS#12 client certificate, and
//! gets rate limited when it polls too eagerly.
//!
//! ## Layers
//!
//! - [`DistributionClient`] - one identity, one cursor: builds envelopes,
//!   sends them over a [`Transport`](transport::Transport), interprets the
//!   response and follows the cursor until caught up
//! - [`SyncService`] - loads cursor and credential from a store, runs the
//!   client under a per-identity lock, stores documents deduplicated by
//!   access key, persists the cursor and honours rate-limit cool-downs
//! - [`SqliteStore`] / [`MemoryStore`](store::MemoryStore) - stores
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sefaz_dfe::crypto::PassphraseCipher;
//! use sefaz_dfe::{Config, Database, DistributionClient, Identity, SqliteStore, SyncMode, SyncService};
//! use secrecy::SecretString;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let db = Arc::new(Database::new(&config.persistence.database_path).await?);
//!     let cipher = PassphraseCipher::from_secret(&SecretString::from("app secret".to_string()))?;
//!     let store = Arc::new(SqliteStore::new(db, cipher));
//!
//!     let client = DistributionClient::with_http(&config.service, config.pagination.clone());
//!     let service = SyncService::new(Arc::new(client), store, config.sync.clone());
//!
//!     let identity = Identity::parse("49.091.246/0001-05", "42")?;
//!     let report = service.sync_identity(&identity, SyncMode::Incremental).await?;
//!     println!("{} new documents, cursor at {}", report.imported, report.final_cursor);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Pagination controller
pub mod client;
/// Document codec (Base64, gzip, XML)
pub mod codec;
/// Configuration types
pub mod config;
/// Passphrase encryption at rest
pub mod crypto;
/// Database persistence layer
pub mod db;
/// SOAP request envelopes
pub mod envelope;
/// Error types
pub mod error;
/// Response interpretation
pub mod interpreter;
/// Retry logic with exponential backoff
pub mod retry;
/// Store contracts and the in-memory store
pub mod store;
/// Per-identity synchronization
pub mod sync;
/// Authenticated HTTPS transport
pub mod transport;
/// Core types
pub mod types;
/// Minimal namespace-aware XML tree
pub mod xml;

// Re-export commonly used types
pub use client::{
    CursorProbe, DistributionClient, DocumentLookup, FetchFailure, FetchReport, Termination,
};
pub use config::{Config, Environment};
pub use db::{Database, SqliteStore};
pub use error::{DatabaseError, DecodeError, Error, Result, TransportError};
pub use interpreter::{QueryFailure, QueryOutcome};
pub use store::{CooldownStore, CursorStore, DocumentSink, StoreOutcome, SyncStore};
pub use sync::{SyncMode, SyncReport, SyncService};
pub use types::{
    AccessKey, Amount, AuthorityCode, Credential, DocumentKind, FiscalDocument, Identity, Nsu,
    TaxId,
};

/// Wait for a termination signal, then stop the service's running fetches.
///
/// Fetches stop at their next iteration boundary and persist the cursor
/// they reached.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn shutdown_on_signal(service: std::sync::Arc<SyncService>) {
    wait_for_signal().await;
    service.shutdown();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
