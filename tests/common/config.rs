//! Live-test configuration loaded from .env

use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;
use sefaz_dfe::config::{Environment, ServiceConfig};
use sefaz_dfe::crypto::PassphraseCipher;
use sefaz_dfe::{Database, Identity, SqliteStore};
use tempfile::TempDir;

/// Error type for test configuration
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Everything a live test needs to reach the homologation endpoint
pub struct LiveSettings {
    /// Identity registered for the certificate
    pub identity: Identity,
    /// PKCS#12 bundle path
    pub certificate: PathBuf,
    /// Bundle passphrase
    pub passphrase: SecretString,
    /// Target environment (homologation unless `SEFAZ_ENVIRONMENT=production`)
    pub service: ServiceConfig,
}

/// Load live-test settings from environment variables
///
/// Required environment variables:
/// - `SEFAZ_TAX_ID` - CNPJ or CPF of the certificate holder
/// - `SEFAZ_AUTHORITY` - IBGE state code (e.g. 35)
/// - `SEFAZ_CERT_PATH` - PKCS#12 bundle
/// - `SEFAZ_CERT_PASSPHRASE` - bundle passphrase
///
/// Optional:
/// - `SEFAZ_ENVIRONMENT` - `production` or `homologation` (default)
pub fn load_live_settings() -> Result<LiveSettings, ConfigError> {
    dotenvy::dotenv().ok();

    let var = |name: &str| {
        std::env::var(name).map_err(|_| ConfigError(format!("{name} not set in environment")))
    };

    let identity = Identity::parse(&var("SEFAZ_TAX_ID")?, &var("SEFAZ_AUTHORITY")?)
        .map_err(|e| ConfigError(e.to_string()))?;
    let environment = match std::env::var("SEFAZ_ENVIRONMENT").as_deref() {
        Ok("production") => Environment::Production,
        _ => Environment::Homologation,
    };

    Ok(LiveSettings {
        identity,
        certificate: PathBuf::from(var("SEFAZ_CERT_PATH")?),
        passphrase: SecretString::from(var("SEFAZ_CERT_PASSPHRASE")?),
        service: ServiceConfig {
            environment,
            ..ServiceConfig::default()
        },
    })
}

/// Whether live credentials are available
pub fn has_live_credentials() -> bool {
    load_live_settings().is_ok()
}

/// SQLite store in a temporary directory (keep the directory alive for the test)
pub async fn temp_store(
    app_secret: &str,
) -> Result<(Arc<SqliteStore>, TempDir), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let db = Database::new(&dir.path().join("sefaz-dfe.db")).await?;
    let cipher = PassphraseCipher::from_secret(&SecretString::from(app_secret.to_string()))?;
    Ok((Arc::new(SqliteStore::new(Arc::new(db), cipher)), dir))
}
