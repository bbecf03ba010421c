//! sefaz-dfe operator CLI
//!
//! Usage:
//!   sefaz-dfe register      - Store an identity and its client certificate
//!   sefaz-dfe sync          - Fetch new documents (one identity, or all of them)
//!   sefaz-dfe resync        - Fetch everything again from the zero cursor
//!   sefaz-dfe reset-cursor  - Move an identity's cursor back to zero
//!   sefaz-dfe probe-cursor  - Store the service's current cursor, skipping the backlog
//!   sefaz-dfe fetch-key     - Fetch and store one document by access key
//!   sefaz-dfe export        - Write stored XMLs issued within a period to a directory

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use sefaz_dfe::crypto::PassphraseCipher;
use sefaz_dfe::{
    AccessKey, Config, Database, DistributionClient, Error, Identity, Result, SqliteStore,
    SyncMode, SyncService,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sefaz-dfe", version, about = "SEFAZ NF-e distribution client")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the configuration file)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Secret used to encrypt stored certificate passphrases
    #[arg(long, env = "SEFAZ_DFE_SECRET", hide_env_values = true)]
    app_secret: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct IdentityArgs {
    /// CNPJ or CPF (punctuation allowed)
    #[arg(long)]
    tax_id: String,

    /// IBGE state code of the request author (cUFAutor)
    #[arg(long)]
    authority: String,
}

impl IdentityArgs {
    fn identity(&self) -> Result<Identity> {
        Identity::parse(&self.tax_id, &self.authority)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Store an identity and its client certificate
    Register {
        #[command(flatten)]
        identity: IdentityArgs,

        /// PKCS#12 bundle (.pfx / .p12)
        #[arg(long)]
        certificate: PathBuf,

        /// Passphrase of the bundle
        #[arg(long, env = "SEFAZ_DFE_CERT_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },
    /// Fetch new documents; every stored identity when none is given
    Sync {
        /// CNPJ or CPF
        #[arg(long, requires = "authority")]
        tax_id: Option<String>,

        /// IBGE state code
        #[arg(long, requires = "tax_id")]
        authority: Option<String>,
    },
    /// Fetch everything again from the zero cursor
    Resync {
        #[command(flatten)]
        identity: IdentityArgs,
    },
    /// Move the cursor back to zero
    ResetCursor {
        #[command(flatten)]
        identity: IdentityArgs,
    },
    /// Store the service's current cursor without downloading the backlog
    ProbeCursor {
        #[command(flatten)]
        identity: IdentityArgs,
    },
    /// Fetch and store one document by its 44-digit access key
    FetchKey {
        #[command(flatten)]
        identity: IdentityArgs,

        /// Access key
        access_key: String,
    },
    /// Write stored XMLs issued within [from, to] as nfe_<key>.xml
    Export {
        /// First issue date (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,

        /// Last issue date (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,

        /// Output directory
        #[arg(long)]
        dir: PathBuf,

        /// Only documents of this CNPJ/CPF
        #[arg(long, requires = "authority")]
        tax_id: Option<String>,

        /// IBGE state code
        #[arg(long, requires = "tax_id")]
        authority: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(code = e.code(), error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sefaz_dfe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(path) = cli.database {
        config.persistence.database_path = path;
    }
    config.validate()?;

    let db = Arc::new(Database::new(&config.persistence.database_path).await?);
    let cipher = PassphraseCipher::from_secret(&SecretString::from(cli.app_secret))?;
    let store = Arc::new(SqliteStore::new(db.clone(), cipher));
    let client = DistributionClient::with_http(&config.service, config.pagination.clone());
    let service = Arc::new(SyncService::new(
        Arc::new(client),
        store.clone(),
        config.sync.clone(),
    ));
    tokio::spawn(sefaz_dfe::shutdown_on_signal(service.clone()));

    match cli.command {
        Command::Register {
            identity,
            certificate,
            passphrase,
        } => {
            let identity = identity.identity()?;
            let bundle = tokio::fs::read(&certificate).await?;
            store
                .register(&identity, &bundle, &SecretString::from(passphrase))
                .await?;
            println!("registered {identity}");
        }
        Command::Sync { tax_id, authority } => {
            let identities = match (tax_id, authority) {
                (Some(tax_id), Some(authority)) => vec![Identity::parse(&tax_id, &authority)?],
                _ => db.list_identities().await?,
            };
            if let [identity] = identities.as_slice() {
                let report = service
                    .sync_identity_with_retry(identity, SyncMode::Incremental, &config.retry)
                    .await?;
                print_json(&report)?;
            } else {
                let mut failed = 0;
                for (identity, result) in service.sync_many(identities, SyncMode::Incremental).await {
                    match result {
                        Ok(report) => print_json(&report)?,
                        Err(e) => {
                            failed += 1;
                            eprintln!("{identity}: {e}");
                        }
                    }
                }
                if failed > 0 {
                    return Err(Error::Other(format!("{failed} identities failed to sync")));
                }
            }
        }
        Command::Resync { identity } => {
            let report = service
                .sync_identity_with_retry(&identity.identity()?, SyncMode::FullResync, &config.retry)
                .await?;
            print_json(&report)?;
        }
        Command::ResetCursor { identity } => {
            let identity = identity.identity()?;
            service.reset_cursor(&identity).await?;
            println!("cursor of {identity} reset to zero");
        }
        Command::ProbeCursor { identity } => {
            let probe = service.probe_and_store_cursor(&identity.identity()?).await?;
            println!(
                "ultNSU {} maxNSU {}{}",
                probe.last_nsu,
                probe.max_nsu,
                if probe.rate_limited { " (rate limited)" } else { "" }
            );
        }
        Command::FetchKey {
            identity,
            access_key,
        } => {
            let access_key = AccessKey::parse(&access_key)?;
            match service.fetch_document(&identity.identity()?, &access_key).await? {
                Some((document, outcome)) => {
                    println!("{} {:?} ({:?})", document.access_key, document.kind, outcome)
                }
                None => println!("{access_key} not available"),
            }
        }
        Command::Export {
            from,
            to,
            dir,
            tax_id,
            authority,
        } => {
            let identity = match (tax_id, authority) {
                (Some(tax_id), Some(authority)) => Some(Identity::parse(&tax_id, &authority)?),
                _ => None,
            };
            let written = export(&db, identity.as_ref(), from, to, &dir).await?;
            println!("{written} documents written to {}", dir.display());
        }
    }

    Ok(())
}

async fn export(
    db: &Database,
    identity: Option<&Identity>,
    from: NaiveDate,
    to: NaiveDate,
    dir: &Path,
) -> Result<usize> {
    if from > to {
        return Err(Error::invalid("from", format!("{from} is after {to}")));
    }
    tokio::fs::create_dir_all(dir).await?;

    let rows = db.list_documents_issued_between(identity, from, to).await?;
    for row in &rows {
        let path = dir.join(format!("nfe_{}.xml", row.access_key));
        tokio::fs::write(&path, &row.xml).await?;
    }
    tracing::info!(documents = rows.len(), dir = %dir.display(), "documents exported");
    Ok(rows.len())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
