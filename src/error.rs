//! Error types for sefaz-dfe
//!
//! This module provides the error taxonomy for the distribution client:
//! - [`Error`] - fatal errors of a call (transport, envelope, remote status, store)
//! - [`TransportError`] - network, TLS/certificate and HTTP status failures
//! - [`DecodeError`] - per-document failures, never fatal for a batch
//! - [`DatabaseError`] - SQLite store failures
//!
//! Rate limiting is deliberately absent: it is a distinguished
//! [`QueryOutcome`](crate::interpreter::QueryOutcome), not an error.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for sefaz-dfe operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sefaz-dfe
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "pagination.max_iterations")
        key: Option<String>,
    },

    /// A caller-supplied value failed validation (tax-id, NSU, access key, ...)
    #[error("invalid {field}: {reason}")]
    InvalidInput {
        /// Name of the offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// The HTTPS call to the distribution service failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The response body was not a recognizable distribution envelope
    #[error("malformed response envelope: {0}")]
    EnvelopeParse(String),

    /// The service answered with a status code other than success/656
    #[error("SEFAZ rejected the request with status {code}: {message}")]
    RemoteStatus {
        /// Status code (`cStat`) as returned by the service
        code: String,
        /// Status message (`xMotivo`), verbatim
        message: String,
    },

    /// No credential or cursor row exists for the identity
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    /// The identity was rate limited recently and is still cooling down
    #[error("identity {identity} is cooling down after rate limiting until {until}")]
    CoolingDown {
        /// Identity that is cooling down
        identity: String,
        /// Earliest instant at which the service may be contacted again
        until: DateTime<Utc>,
    },

    /// Passphrase sealing/opening failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidInput`]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidInput {
            field,
            reason: reason.into(),
        }
    }

    /// Machine-readable error code, suitable for operator dashboards and alerts
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::InvalidInput { .. } => "invalid_input",
            Error::Transport(e) => match e {
                TransportError::Certificate(_) => "certificate_error",
                TransportError::Connect(_) => "connect_error",
                TransportError::Timeout(_) => "timeout",
                TransportError::Status { .. } => "http_status",
                TransportError::Request(_) => "transport_error",
            },
            Error::EnvelopeParse(_) => "envelope_parse_error",
            Error::RemoteStatus { .. } => "remote_status",
            Error::UnknownIdentity(_) => "unknown_identity",
            Error::CoolingDown { .. } => "cooling_down",
            Error::Crypto(_) => "crypto_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }
}

/// Failures of a single authenticated HTTPS round trip
#[derive(Debug, Error)]
pub enum TransportError {
    /// The PKCS#12 bundle could not be loaded (corrupt bundle or wrong passphrase)
    #[error("client certificate rejected: {0}")]
    Certificate(String),

    /// The connection or TLS handshake could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request did not complete within the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The server answered with a non-2xx status
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, truncated for diagnostics
        body: String,
    },

    /// Any other request failure (body read, invalid URL, ...)
    #[error("request failed: {0}")]
    Request(String),
}

/// Per-entry document decoding failures
///
/// These never abort a batch; the interpreter keeps them next to the
/// successfully decoded documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The `docZip` element had no content
    #[error("document entry is empty")]
    EmptyEntry,

    /// The entry was not valid Base64
    #[error("invalid base64 payload: {0}")]
    Base64(String),

    /// The (decompressed) payload was not well-formed XML
    #[error("invalid document XML: {0}")]
    Xml(String),

    /// No 44-digit access key could be located in the document
    #[error("document has no access key")]
    MissingAccessKey,

    /// Gross minus discount does not fit in the amount range
    #[error("document net amount is out of range")]
    AmountOutOfRange,
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A stored value could not be converted back into its domain type
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}
