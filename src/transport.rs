//! Authenticated HTTPS transport for distribution requests
//!
//! A [`Transport`] performs exactly one POST per call and never retries;
//! retry policy belongs to the caller (see [`crate::retry`]).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::error::TransportError;
use crate::types::Credential;

/// Content type of SOAP 1.2 requests
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// Maximum number of characters of an error body kept for diagnostics
pub const ERROR_BODY_LIMIT: usize = 500;

/// One authenticated request/response round trip
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` to `url` using the credential's client certificate and
    /// return the raw response bytes
    async fn send(
        &self,
        url: &str,
        body: String,
        credential: &Credential,
    ) -> Result<Vec<u8>, TransportError>;
}

/// reqwest-backed transport presenting a PKCS#12 client identity over native TLS
#[derive(Clone, Debug)]
pub struct HttpTransport {
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with the given per-request timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build an HTTP client that presents the credential's certificate
    ///
    /// The passphrase is only exposed for the duration of this call.
    fn client_for(&self, credential: &Credential) -> Result<reqwest::Client, TransportError> {
        let identity = reqwest::Identity::from_pkcs12_der(
            credential.certificate(),
            credential.passphrase().expose_secret(),
        )
        .map_err(|e| TransportError::Certificate(e.to_string()))?;

        reqwest::Client::builder()
            .use_native_tls()
            .identity(identity)
            .timeout(self.timeout)
            .user_agent(concat!("sefaz-dfe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Certificate(e.to_string()))
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        body: String,
        credential: &Credential,
    ) -> Result<Vec<u8>, TransportError> {
        let client = self.client_for(credential)?;
        debug!(
            url,
            certificate = %credential.fingerprint(),
            "sending distribution request"
        );
        post_envelope(&client, url, body, self.timeout).await
    }
}

/// POST a SOAP envelope with an already-configured client
///
/// `timeout` is only used to describe a timed-out request; the client
/// enforces it.
pub(crate) async fn post_envelope(
    client: &reqwest::Client,
    url: &str,
    body: String,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
        .body(body)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: text.chars().take(ERROR_BODY_LIMIT).collect(),
        });
    }

    let bytes = response.bytes().await.map_err(|e| classify(e, timeout))?;
    debug!(status = status.as_u16(), bytes = bytes.len(), "received response");
    Ok(bytes.to_vec())
}

fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Request(error.to_string())
    }
}
