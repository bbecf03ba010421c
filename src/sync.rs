//! Per-identity synchronization
//!
//! [`SyncService`] is what a scheduler calls. For one identity it:
//!
//! 1. serializes runs behind a per-identity lock (one request in flight per identity)
//! 2. refuses to contact the service while a rate-limit cool-down is active
//! 3. loads cursor and credential from the store and runs the paginated fetch
//! 4. optionally replaces summaries with the full document fetched by key
//! 5. stores documents (deduplicated by access key), then persists the cursor
//!
//! Different identities run in parallel, bounded by
//! [`SyncConfig::max_concurrent_identities`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::{CursorProbe, DistributionClient, DocumentLookup, FetchReport, Termination};
use crate::config::{RetryConfig, SyncConfig};
use crate::envelope::QueryMode;
use crate::error::{Error, Result};
use crate::interpreter::QueryOutcome;
use crate::retry::with_retry;
use crate::store::{StoreOutcome, SyncStore};
use crate::types::{AccessKey, Credential, DocumentKind, FiscalDocument, Identity, Nsu};

/// Where a sync starts reading the feed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Resume from the stored cursor
    Incremental,
    /// Start over from the zero cursor; already stored documents count as duplicates
    FullResync,
}

/// Outcome of one [`SyncService::sync_identity`] run
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncReport {
    /// Identity that was synchronized
    pub identity: Identity,
    /// Requested mode
    pub mode: SyncMode,
    /// Cursor the fetch started from
    pub start_cursor: Nsu,
    /// Cursor persisted at the end of the run
    pub final_cursor: Nsu,
    /// Last highest-available NSU reported by the service
    pub max_nsu: Option<Nsu>,
    /// Feed requests issued (summary upgrades not included)
    pub requests: u32,
    /// Documents stored for the first time
    pub imported: usize,
    /// Stored summaries replaced by a full document
    pub upgraded: usize,
    /// Documents already stored
    pub duplicates: usize,
    /// Feed entries that could not be decoded
    pub rejected: usize,
    /// Summaries swapped for the full document fetched by access key
    pub fetched_full: usize,
    /// Why the fetch stopped
    pub termination: Termination,
    /// Summary upgrades were cut short by rate limiting
    pub upgrades_rate_limited: bool,
}

impl SyncReport {
    /// Whether the service asked to back off, during the feed or the summary upgrades
    pub fn is_rate_limited(&self) -> bool {
        self.upgrades_rate_limited || matches!(self.termination, Termination::RateLimited { .. })
    }
}

#[derive(Default)]
struct Tally {
    imported: usize,
    upgraded: usize,
    duplicates: usize,
}

impl Tally {
    fn count(&mut self, outcome: StoreOutcome) {
        match outcome {
            StoreOutcome::Inserted => self.imported += 1,
            StoreOutcome::Upgraded => self.upgraded += 1,
            StoreOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

type IdentityLocks = Mutex<HashMap<Identity, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one identity; the map entry goes away with the last holder
struct IdentityLease<'a> {
    locks: &'a IdentityLocks,
    identity: Identity,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for IdentityLease<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Held only by the map and this guard: nobody is waiting
        if locks
            .get(&self.identity)
            .is_some_and(|lock| Arc::strong_count(lock) == 2)
        {
            locks.remove(&self.identity);
        }
    }
}

/// Drives [`DistributionClient`] fetches against a [`SyncStore`]
pub struct SyncService {
    client: Arc<DistributionClient>,
    store: Arc<dyn SyncStore>,
    config: SyncConfig,
    locks: IdentityLocks,
    cancel: CancellationToken,
}

impl SyncService {
    /// Create a service over a client and a store
    pub fn new(client: Arc<DistributionClient>, store: Arc<dyn SyncStore>, config: SyncConfig) -> Self {
        Self {
            client,
            store,
            config,
            locks: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Underlying distribution client
    pub fn client(&self) -> &DistributionClient {
        &self.client
    }

    /// Stop running fetches at their next iteration boundary
    ///
    /// Cursors reached so far are still persisted. Later runs stop before
    /// their first request.
    pub fn shutdown(&self) {
        info!("sync service shutting down");
        self.cancel.cancel();
    }

    /// Synchronize one identity
    ///
    /// Fails with [`Error::CoolingDown`] without contacting the service when
    /// the identity was rate limited less than `rate_limit_cooldown` ago. On a
    /// mid-fetch failure the documents and cursor reached so far are persisted
    /// before the error is returned.
    pub async fn sync_identity(&self, identity: &Identity, mode: SyncMode) -> Result<SyncReport> {
        let _lease = self.lease(identity).await;

        self.ensure_not_cooling_down(identity).await?;
        let credential = self.store.load_credential(identity).await?;
        let start_cursor = match mode {
            SyncMode::Incremental => self.store.load_cursor(identity).await?,
            SyncMode::FullResync => Nsu::ZERO,
        };
        info!(identity = %identity, nsu = %start_cursor, mode = ?mode, "sync started");

        let max_iterations = self.client.pagination().max_iterations;
        let fetched = self
            .client
            .fetch_since_with_cancel(identity, &credential, start_cursor, max_iterations, &self.cancel)
            .await;

        let mut fetch = match fetched {
            Ok(report) => report,
            Err(failure) => {
                let mut tally = Tally::default();
                self.store_documents(identity, &failure.partial, &mut tally).await?;
                self.store
                    .save_cursor(identity, failure.partial.final_cursor, failure.partial.max_nsu)
                    .await?;
                error!(
                    identity = %identity,
                    nsu = %failure.partial.final_cursor,
                    imported = tally.imported,
                    error = %failure.error,
                    "sync failed, partial progress saved"
                );
                return Err(failure.error);
            }
        };

        let mut fetched_full = 0;
        let mut upgrades_rate_limited = false;
        if self.config.upgrade_summaries && !fetch.is_rate_limited() {
            let (count, limited) = self.upgrade_summaries(identity, &credential, &mut fetch.documents).await;
            fetched_full = count;
            upgrades_rate_limited = limited;
        }
        let rate_limited = upgrades_rate_limited || fetch.is_rate_limited();

        let mut tally = Tally::default();
        self.store_documents(identity, &fetch, &mut tally).await?;
        self.store
            .save_cursor(identity, fetch.final_cursor, fetch.max_nsu)
            .await?;

        if rate_limited {
            self.start_cooldown(identity).await?;
        } else if self.store.cooldown_until(identity).await?.is_some() {
            self.store.set_cooldown(identity, None).await?;
        }

        let report = SyncReport {
            identity: identity.clone(),
            mode,
            start_cursor,
            final_cursor: fetch.final_cursor,
            max_nsu: fetch.max_nsu,
            requests: fetch.requests,
            imported: tally.imported,
            upgraded: tally.upgraded,
            duplicates: tally.duplicates,
            rejected: fetch.rejected.len(),
            fetched_full,
            termination: fetch.termination,
            upgrades_rate_limited,
        };

        info!(
            identity = %identity,
            nsu = %report.final_cursor,
            requests = report.requests,
            imported = report.imported,
            upgraded = report.upgraded,
            duplicates = report.duplicates,
            rejected = report.rejected,
            termination = ?report.termination,
            rate_limited,
            "sync finished"
        );
        Ok(report)
    }

    /// [`sync_identity`](Self::sync_identity) under a retry policy
    ///
    /// Only transient transport failures are retried. Retries always resume
    /// from the stored cursor, so a failed full resync does not start over.
    pub async fn sync_identity_with_retry(
        &self,
        identity: &Identity,
        mode: SyncMode,
        retry: &RetryConfig,
    ) -> Result<SyncReport> {
        let mut next_mode = mode;
        let mut report = with_retry(retry, || {
            let attempt_mode = next_mode;
            next_mode = SyncMode::Incremental;
            self.sync_identity(identity, attempt_mode)
        })
        .await?;
        report.mode = mode;
        Ok(report)
    }

    /// Synchronize several identities concurrently
    ///
    /// Results are returned in completion order.
    pub async fn sync_many(
        &self,
        identities: Vec<Identity>,
        mode: SyncMode,
    ) -> Vec<(Identity, Result<SyncReport>)> {
        let concurrency = self.config.max_concurrent_identities.max(1);
        stream::iter(identities)
            .map(|identity| async move {
                let result = self.sync_identity(&identity, mode).await;
                (identity, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    /// Move the stored cursor of an identity back to zero
    pub async fn reset_cursor(&self, identity: &Identity) -> Result<()> {
        let _lease = self.lease(identity).await;

        self.store.save_cursor(identity, Nsu::ZERO, None).await?;
        info!(identity = %identity, "cursor reset");
        Ok(())
    }

    /// Ask the service for its current cursor and store it
    ///
    /// Skips the backlog: the next incremental sync starts from the reported
    /// `ultNSU`. Nothing is stored when the service reports no cursor. A
    /// rate-limited probe starts the cool-down.
    pub async fn probe_and_store_cursor(&self, identity: &Identity) -> Result<CursorProbe> {
        let _lease = self.lease(identity).await;

        self.ensure_not_cooling_down(identity).await?;
        let credential = self.store.load_credential(identity).await?;
        let probe = self.client.probe_cursor(identity, &credential).await?;

        if !probe.last_nsu.is_zero() {
            let max_nsu = (!probe.max_nsu.is_zero()).then_some(probe.max_nsu);
            self.store.save_cursor(identity, probe.last_nsu, max_nsu).await?;
        }
        if probe.rate_limited {
            self.start_cooldown(identity).await?;
        }

        info!(
            identity = %identity,
            nsu = %probe.last_nsu,
            max_nsu = %probe.max_nsu,
            rate_limited = probe.rate_limited,
            "cursor probed"
        );
        Ok(probe)
    }

    /// Fetch one document by access key and store it
    ///
    /// Returns `None` when the service has nothing for the key. A rate-limited
    /// lookup starts the cool-down and fails with [`Error::CoolingDown`].
    pub async fn fetch_document(
        &self,
        identity: &Identity,
        access_key: &AccessKey,
    ) -> Result<Option<(FiscalDocument, StoreOutcome)>> {
        let _lease = self.lease(identity).await;

        self.ensure_not_cooling_down(identity).await?;
        let credential = self.store.load_credential(identity).await?;
        let document = match self
            .client
            .fetch_full_document(identity, &credential, access_key)
            .await?
        {
            DocumentLookup::Found(document) => document,
            DocumentLookup::NotFound => {
                info!(identity = %identity, access_key = %access_key, "document not available");
                return Ok(None);
            }
            DocumentLookup::RateLimited { .. } => {
                let until = self.start_cooldown(identity).await?;
                return Err(Error::CoolingDown {
                    identity: identity.to_string(),
                    until,
                });
            }
        };

        let outcome = self.store.store_document(identity, &document).await?;
        info!(identity = %identity, access_key = %access_key, outcome = ?outcome, "document fetched");
        Ok(Some((document, outcome)))
    }

    async fn lease(&self, identity: &Identity) -> IdentityLease<'_> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(identity.clone()).or_default().clone()
        };
        IdentityLease {
            locks: &self.locks,
            identity: identity.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    async fn ensure_not_cooling_down(&self, identity: &Identity) -> Result<()> {
        match self.store.cooldown_until(identity).await? {
            Some(until) if until > Utc::now() => {
                warn!(identity = %identity, until = %until, "identity is cooling down, skipping");
                Err(Error::CoolingDown {
                    identity: identity.to_string(),
                    until,
                })
            }
            _ => Ok(()),
        }
    }

    async fn start_cooldown(&self, identity: &Identity) -> Result<DateTime<Utc>> {
        let cooldown = chrono::Duration::from_std(self.config.rate_limit_cooldown).map_err(|e| {
            Error::Config {
                message: format!("rate limit cool-down out of range: {e}"),
                key: Some("sync.rate_limit_cooldown".to_string()),
            }
        })?;
        let until = Utc::now() + cooldown;
        warn!(identity = %identity, until = %until, "rate limited, cooling down");
        self.store.set_cooldown(identity, Some(until)).await?;
        Ok(until)
    }

    /// Swap summaries for full documents, in place
    ///
    /// Returns how many were swapped and whether the service rate limited a
    /// lookup. A failed or empty lookup keeps the summary.
    async fn upgrade_summaries(
        &self,
        identity: &Identity,
        credential: &Credential,
        documents: &mut [FiscalDocument],
    ) -> (usize, bool) {
        let mut swapped = 0;
        for document in documents.iter_mut().filter(|d| d.kind == DocumentKind::Summary) {
            let mode = QueryMode::ByAccessKey(document.access_key.clone());
            let outcome = match self.client.query(identity, credential, &mode).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(identity = %identity, access_key = %document.access_key, error = %e, "summary upgrade failed, keeping summary");
                    continue;
                }
            };

            match outcome {
                QueryOutcome::RateLimited { message, .. } => {
                    warn!(identity = %identity, %message, "summary upgrades stopped by rate limiting");
                    return (swapped, true);
                }
                QueryOutcome::Failure(failure) => {
                    warn!(identity = %identity, access_key = %document.access_key, error = %Error::from(failure), "summary upgrade rejected, keeping summary");
                }
                outcome => {
                    let full = outcome
                        .documents()
                        .find(|d| d.access_key == document.access_key && d.kind == DocumentKind::Full)
                        .cloned();
                    if let Some(mut full) = full {
                        full.nsu = document.nsu;
                        *document = full;
                        swapped += 1;
                    }
                }
            }
        }
        (swapped, false)
    }

    async fn store_documents(
        &self,
        identity: &Identity,
        fetch: &FetchReport,
        tally: &mut Tally,
    ) -> Result<()> {
        for rejected in &fetch.rejected {
            warn!(identity = %identity, error = %rejected, "feed entry skipped");
        }
        for document in &fetch.documents {
            tally.count(self.store.store_document(identity, document).await?);
        }
        Ok(())
    }
}
