//! Pagination controller for the distribution feed
//!
//! [`DistributionClient`] drives the Envelope Builder, the [`Transport`] and
//! the response interpreter in a loop, advancing an identity's cursor until
//! the service reports it is caught up, has nothing to return, rate limits
//! the caller, fails, or the iteration cap is reached.
//!
//! One request is outstanding at a time. Callers must not run two fetches
//! for the same identity concurrently (see [`crate::sync::SyncService`]).

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Environment, PaginationConfig, ServiceConfig};
use crate::envelope::{self, QueryMode};
use crate::error::{DecodeError, Error, Result};
use crate::interpreter::{self, QueryOutcome};
use crate::transport::{HttpTransport, Transport};
use crate::types::{AccessKey, Credential, FiscalDocument, Identity, Nsu};

/// Why a fetch stopped
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// The cursor reached (or passed) the highest available NSU
    CaughtUp,
    /// The service answered 656 without rate-limit wording
    NoDocuments,
    /// A successful response carried zero entries
    EmptyBatch,
    /// The service asked the caller to back off
    RateLimited {
        /// Raw status message
        message: String,
    },
    /// `max_iterations` requests were issued without catching up
    IterationCap,
    /// The cancellation token fired between iterations
    Cancelled,
    /// The fetch failed; only seen on [`FetchFailure::partial`]
    Aborted,
}

/// Everything a fetch accumulated
#[derive(Clone, Debug, PartialEq)]
pub struct FetchReport {
    /// Decoded documents, in feed order across all batches
    pub documents: Vec<FiscalDocument>,
    /// Entries that could not be decoded
    pub rejected: Vec<DecodeError>,
    /// Cursor to resume from; callers must persist it
    pub final_cursor: Nsu,
    /// Last highest-available NSU reported by the service
    pub max_nsu: Option<Nsu>,
    /// Number of requests issued
    pub requests: u32,
    /// Why the fetch stopped
    pub termination: Termination,
}

impl FetchReport {
    fn start(cursor: Nsu) -> Self {
        Self {
            documents: Vec::new(),
            rejected: Vec::new(),
            final_cursor: cursor,
            max_nsu: None,
            requests: 0,
            termination: Termination::IterationCap,
        }
    }

    fn adopt(&mut self, last_nsu: Option<Nsu>, max_nsu: Option<Nsu>) {
        if let Some(last) = last_nsu {
            self.final_cursor = last;
        }
        if max_nsu.is_some() {
            self.max_nsu = max_nsu;
        }
    }

    /// Whether the service asked the caller to back off
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.termination, Termination::RateLimited { .. })
    }
}

/// A fetch that stopped on an error, with the progress made before it
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FetchFailure {
    /// What went wrong
    #[source]
    pub error: Error,
    /// Documents and cursor accumulated before the failure
    pub partial: FetchReport,
}

impl From<FetchFailure> for Error {
    fn from(failure: FetchFailure) -> Self {
        failure.error
    }
}

/// Cursor values reported by a zero-cursor probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorProbe {
    /// Reported resume cursor (zero when absent)
    pub last_nsu: Nsu,
    /// Reported highest cursor (zero when absent)
    pub max_nsu: Nsu,
    /// Whether the probe itself was rate limited
    pub rate_limited: bool,
    /// Status message, when the service sent one worth surfacing
    pub message: Option<String>,
}

/// Result of a by-key document lookup
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentLookup {
    /// First document the service returned for the key
    Found(FiscalDocument),
    /// The service has nothing for the key
    NotFound,
    /// The service asked the caller to back off
    RateLimited {
        /// Raw status message
        message: String,
    },
}

/// Client for the distribution service
pub struct DistributionClient {
    transport: Arc<dyn Transport>,
    environment: Environment,
    endpoint: String,
    pagination: PaginationConfig,
}

impl DistributionClient {
    /// Create a client over an arbitrary transport
    pub fn new(
        service: &ServiceConfig,
        pagination: PaginationConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            transport,
            environment: service.environment,
            endpoint: service.endpoint().to_string(),
            pagination,
        }
    }

    /// Create a client over [`HttpTransport`] using the configured timeout
    pub fn with_http(service: &ServiceConfig, pagination: PaginationConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(service.request_timeout));
        Self::new(service, pagination, transport)
    }

    /// Endpoint URL requests are sent to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Pagination limits in effect
    pub fn pagination(&self) -> &PaginationConfig {
        &self.pagination
    }

    /// One round trip: build, send, interpret
    ///
    /// Transport failures are errors; remote rejections are returned as
    /// [`QueryOutcome::Failure`].
    pub async fn query(
        &self,
        identity: &Identity,
        credential: &Credential,
        mode: &QueryMode,
    ) -> Result<QueryOutcome> {
        let body = envelope::build_request(self.environment, identity, mode);
        debug!(identity = %identity, mode = ?mode, "querying distribution service");
        let raw = self.transport.send(&self.endpoint, body, credential).await?;
        Ok(interpreter::interpret(&raw))
    }

    /// Fetch every document after `start_cursor`
    pub async fn fetch_since(
        &self,
        identity: &Identity,
        credential: &Credential,
        start_cursor: Nsu,
        max_iterations: u32,
    ) -> std::result::Result<FetchReport, FetchFailure> {
        self.fetch_since_with_cancel(
            identity,
            credential,
            start_cursor,
            max_iterations,
            &CancellationToken::new(),
        )
        .await
    }

    /// [`fetch_since`](Self::fetch_since), stopping between iterations once
    /// `cancel` fires
    ///
    /// A request in flight is never interrupted; the configured
    /// `iteration_delay` pause is.
    pub async fn fetch_since_with_cancel(
        &self,
        identity: &Identity,
        credential: &Credential,
        start_cursor: Nsu,
        max_iterations: u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchReport, FetchFailure> {
        let mut report = FetchReport::start(start_cursor);

        for iteration in 0..max_iterations {
            if iteration > 0 && !self.pagination.iteration_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.pagination.iteration_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                report.termination = Termination::Cancelled;
                break;
            }

            report.requests += 1;
            let mode = QueryMode::ByCursor(report.final_cursor);
            let outcome = match self.query(identity, credential, &mode).await {
                Ok(outcome) => outcome,
                Err(error) => return Err(abort(report, error)),
            };

            match outcome {
                QueryOutcome::Success {
                    entries,
                    last_nsu,
                    max_nsu,
                } => {
                    let batch = entries.len();
                    for entry in entries {
                        match entry {
                            Ok(document) => report.documents.push(document),
                            Err(e) => report.rejected.push(e),
                        }
                    }
                    report.final_cursor = last_nsu;
                    report.max_nsu = Some(max_nsu);
                    debug!(
                        identity = %identity,
                        nsu = %last_nsu,
                        max_nsu = %max_nsu,
                        documents = batch,
                        "batch received"
                    );

                    if last_nsu >= max_nsu {
                        report.termination = Termination::CaughtUp;
                        break;
                    }
                    if batch == 0 {
                        report.termination = Termination::EmptyBatch;
                        break;
                    }
                }
                QueryOutcome::Empty {
                    last_nsu, max_nsu, ..
                } => {
                    report.adopt(last_nsu, max_nsu);
                    report.termination = Termination::NoDocuments;
                    break;
                }
                QueryOutcome::RateLimited {
                    last_nsu,
                    max_nsu,
                    message,
                } => {
                    report.adopt(last_nsu, max_nsu);
                    warn!(identity = %identity, nsu = %report.final_cursor, "fetch stopped by rate limiting");
                    report.termination = Termination::RateLimited { message };
                    break;
                }
                QueryOutcome::Failure(failure) => return Err(abort(report, failure.into())),
            }
        }

        info!(
            identity = %identity,
            requests = report.requests,
            documents = report.documents.len(),
            rejected = report.rejected.len(),
            nsu = %report.final_cursor,
            termination = ?report.termination,
            "fetch finished"
        );
        Ok(report)
    }

    /// Full resync from the zero cursor
    pub async fn fetch_all(
        &self,
        identity: &Identity,
        credential: &Credential,
        max_iterations: u32,
    ) -> std::result::Result<FetchReport, FetchFailure> {
        self.fetch_since(identity, credential, Nsu::ZERO, max_iterations)
            .await
    }

    /// Fetch one document by access key, typically to upgrade a summary
    pub async fn fetch_full_document(
        &self,
        identity: &Identity,
        credential: &Credential,
        access_key: &AccessKey,
    ) -> Result<DocumentLookup> {
        let mode = QueryMode::ByAccessKey(access_key.clone());
        match self.query(identity, credential, &mode).await? {
            outcome @ QueryOutcome::Success { .. } => Ok(outcome
                .documents()
                .next()
                .cloned()
                .map_or(DocumentLookup::NotFound, DocumentLookup::Found)),
            QueryOutcome::Empty { .. } => Ok(DocumentLookup::NotFound),
            QueryOutcome::RateLimited { message, .. } => {
                warn!(identity = %identity, access_key = %access_key, %message, "document lookup rate limited");
                Ok(DocumentLookup::RateLimited { message })
            }
            QueryOutcome::Failure(failure) => Err(failure.into()),
        }
    }

    /// Ask the service for its current cursor values without keeping documents
    pub async fn probe_cursor(
        &self,
        identity: &Identity,
        credential: &Credential,
    ) -> Result<CursorProbe> {
        let outcome = self
            .query(identity, credential, &QueryMode::ByCursor(Nsu::ZERO))
            .await?;
        let (last_nsu, max_nsu) = outcome.cursors();
        let (rate_limited, message) = match outcome {
            QueryOutcome::Success { .. } => (false, None),
            QueryOutcome::Empty { message, .. } => (false, Some(message)),
            QueryOutcome::RateLimited { message, .. } => (true, Some(message)),
            QueryOutcome::Failure(failure) => return Err(failure.into()),
        };
        Ok(CursorProbe {
            last_nsu: last_nsu.unwrap_or(Nsu::ZERO),
            max_nsu: max_nsu.unwrap_or(Nsu::ZERO),
            rate_limited,
            message,
        })
    }
}

fn abort(mut partial: FetchReport, error: Error) -> FetchFailure {
    partial.termination = Termination::Aborted;
    warn!(
        requests = partial.requests,
        documents = partial.documents.len(),
        nsu = %partial.final_cursor,
        error = %error,
        "fetch aborted"
    );
    FetchFailure { error, partial }
}
