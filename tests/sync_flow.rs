//! Offline end-to-end synchronization against a SQLite store
//!
//! The distribution service is replaced by a transport replaying canned
//! SOAP responses; everything else (client, sync service, store, crypto)
//! is the real thing.

mod common;

use std::sync::Arc;

use chrono::NaiveDate;
use common::{
    ReplayTransport, batch, doc_zip, full_xml, identity, key, response, summary_xml, temp_store,
};
use secrecy::SecretString;
use sefaz_dfe::config::{PaginationConfig, ServiceConfig, SyncConfig};
use sefaz_dfe::{
    AccessKey, CooldownStore, CursorStore, DistributionClient, DocumentKind, Error, Nsu,
    SqliteStore, SyncMode, SyncService, Termination,
};

fn service(transport: Arc<ReplayTransport>, store: Arc<SqliteStore>, upgrade: bool) -> SyncService {
    let client = DistributionClient::new(
        &ServiceConfig::default(),
        PaginationConfig::default(),
        transport,
    );
    let config = SyncConfig {
        upgrade_summaries: upgrade,
        ..SyncConfig::default()
    };
    SyncService::new(Arc::new(client), store, config)
}

fn nsu(n: u64) -> Nsu {
    Nsu::new(n).unwrap()
}

async fn register(store: &SqliteStore) {
    store
        .register(&identity(), b"pkcs12", &SecretString::from("senha".to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_incremental_sync_persists_documents_and_cursor() {
    let (store, _dir) = temp_store("app-secret").await.unwrap();
    register(&store).await;
    let transport = ReplayTransport::new([batch(1, 10, 25), batch(11, 25, 25), batch(26, 26, 26)]);
    let service = service(transport.clone(), store.clone(), false);

    let report = service
        .sync_identity(&identity(), SyncMode::Incremental)
        .await
        .unwrap();

    assert_eq!(report.requests, 2);
    assert_eq!(report.imported, 25);
    assert_eq!(report.termination, Termination::CaughtUp);
    assert_eq!(store.load_cursor(&identity()).await.unwrap(), nsu(25));
    assert_eq!(store.database().count_documents().await.unwrap(), 25);

    let issued = store
        .documents_issued_between(
            &identity(),
            NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(issued.len(), 25);

    let next = service
        .sync_identity(&identity(), SyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(next.start_cursor, nsu(25));
    assert_eq!(next.imported, 1);
    assert!(transport.requests()[2].contains("<ultNSU>000000000000025</ultNSU>"));
}

#[tokio::test]
async fn test_full_resync_deduplicates_by_access_key() {
    let (store, _dir) = temp_store("app-secret").await.unwrap();
    register(&store).await;
    let transport = ReplayTransport::new([batch(1, 5, 5), batch(1, 5, 5)]);
    let service = service(transport, store.clone(), false);

    service
        .sync_identity(&identity(), SyncMode::Incremental)
        .await
        .unwrap();
    let resync = service
        .sync_identity(&identity(), SyncMode::FullResync)
        .await
        .unwrap();

    assert_eq!(resync.start_cursor, Nsu::ZERO);
    assert_eq!(resync.duplicates, 5);
    assert_eq!(resync.imported, 0);
    assert_eq!(store.database().count_documents().await.unwrap(), 5);
}

#[tokio::test]
async fn test_cooldown_survives_reopening_the_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("dfe.db");
    let open = |path: std::path::PathBuf| async move {
        let db = sefaz_dfe::Database::new(&path).await.unwrap();
        let cipher = sefaz_dfe::crypto::PassphraseCipher::from_secret(&SecretString::from(
            "app-secret".to_string(),
        ))
        .unwrap();
        Arc::new(SqliteStore::new(Arc::new(db), cipher))
    };

    {
        let store = open(path.clone()).await;
        register(&store).await;
        let transport = ReplayTransport::new([response(
            "656",
            "Rejeicao: Consumo Indevido (Deve ser aguardado 1 hora)",
            Some((0, 120)),
            "",
        )]);
        let report = service(transport, store.clone(), false)
            .sync_identity(&identity(), SyncMode::Incremental)
            .await
            .unwrap();
        assert!(report.is_rate_limited());
        assert!(store.cooldown_until(&identity()).await.unwrap().is_some());
    }

    let store = open(path).await;
    let transport = ReplayTransport::new([batch(1, 1, 1)]);
    let err = service(transport.clone(), store, false)
        .sync_identity(&identity(), SyncMode::Incremental)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CoolingDown { .. }));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn test_summary_upgrade_is_stored_as_full_document() {
    let (store, _dir) = temp_store("app-secret").await.unwrap();
    register(&store).await;
    let transport = ReplayTransport::new([
        response("138", "ok", Some((3, 3)), &doc_zip(3, &summary_xml(&key(3)))),
        response("138", "ok", Some((0, 0)), &doc_zip(0, &full_xml(&key(3)))),
    ]);
    let service = service(transport.clone(), store.clone(), true);

    let report = service
        .sync_identity(&identity(), SyncMode::Incremental)
        .await
        .unwrap();
    assert_eq!(report.fetched_full, 1);

    let row = store
        .database()
        .get_document(&AccessKey::parse(&key(3)).unwrap())
        .await
        .unwrap()
        .unwrap();
    let document = sefaz_dfe::FiscalDocument::try_from(row).unwrap();
    assert_eq!(document.kind, DocumentKind::Full);
    assert_eq!(document.number, "77");
    assert_eq!(document.net_amount.to_string(), "100.00");
    assert_eq!(document.nsu, Some(nsu(3)));
    assert!(transport.requests()[1].contains(&format!("<chNFe>{}</chNFe>", key(3))));
}

#[tokio::test]
async fn test_wrong_app_secret_never_reaches_the_service() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("dfe.db");
    {
        let db = sefaz_dfe::Database::new(&path).await.unwrap();
        let cipher = sefaz_dfe::crypto::PassphraseCipher::from_secret(&SecretString::from(
            "app-secret".to_string(),
        ))
        .unwrap();
        register(&SqliteStore::new(Arc::new(db), cipher)).await;
    }

    let db = sefaz_dfe::Database::new(&path).await.unwrap();
    let cipher = sefaz_dfe::crypto::PassphraseCipher::from_secret(&SecretString::from(
        "other-secret".to_string(),
    ))
    .unwrap();
    let store = Arc::new(SqliteStore::new(Arc::new(db), cipher));
    let transport = ReplayTransport::new([batch(1, 1, 1)]);

    let err = service(transport.clone(), store, false)
        .sync_identity(&identity(), SyncMode::Incremental)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "crypto_error");
    assert!(transport.requests().is_empty());
}
