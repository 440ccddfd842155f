use std::path::Path;
use std::time::Duration;

use bsync_storage::{BackoffPolicy, SnapshotStore};
use bsync_sync::{MemorySyncStore, PersistenceError, SyncConfig, SyncPipeline};
use serde_json::{json, Value};

const ALFA: &str = "Extracao_Alfa_Corretora_2025-01-10_08-00-00_backup.json";
const BETA: &str = "Extracao_Beta_Seguros_2025-01-10_09-30-00_backup.json";

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        downloads_dir: root.to_path_buf(),
        backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..SyncConfig::default()
    }
}

fn store() -> MemorySyncStore {
    MemorySyncStore::with_brokers([(1, "ALFA CORRETORA DE SEGUROS LTDA"), (2, "BETA SEGUROS EIRELI")])
}

fn pipeline(root: &Path, store: &MemorySyncStore) -> SyncPipeline {
    SyncPipeline::new(config(root), Box::new(store.clone()))
}

fn bundle(document: &str, proposal: &str) -> Vec<u8> {
    let value: Value = json!([
        {"name": "Clientes", "data": [
            {"id_cliente": "c1", "documento": document, "nome": "Ana Souza", "data_nascimento": "02/03/1980"},
            {"id_cliente": "c2", "documento": "987.654.321-00", "nome": "Bruno Lima", "email": "-"}
        ]},
        {"name": "Status Propostas", "data": [
            {"proposta": proposal, "id_cliente": "c1", "vencimento": "10/01/2025", "valor": "1.234,56"}
        ]},
        {"name": "Parcelas Pendentes", "data": [
            {"cpf_cliente": document, "numero_proposta": proposal, "competencia": "12/2024",
             "vencimento_original": "01/12/2024", "contribuicao": 99.9}
        ]},
        {"name": "Produtos Vida", "data": [
            {"id_cliente": "c2", "numero_proposta": proposal, "numero_certificado": "C-1",
             "nome_cobertura": "Morte", "capital_segurado": 50000, "situacao_produto": "ATIVO"},
            {"id_cliente": "c2", "numero_proposta": "P-OLD", "situacao_produto": "Cancelado"}
        ]}
    ]);
    serde_json::to_vec(&value).unwrap()
}

async fn deliver(root: &Path, file_name: &str, bytes: &[u8]) {
    SnapshotStore::new(root, "processados")
        .deliver(file_name, bytes)
        .await
        .unwrap();
}

fn names(files: Vec<bsync_storage::BundleFile>) -> Vec<String> {
    files.into_iter().map(|f| f.file_name).collect()
}

#[tokio::test]
async fn ingests_every_table_and_archives_the_bundle() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    let store = store();
    let pipeline = pipeline(dir.path(), &store);

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!((summary.discovered, summary.processed, summary.skipped), (1, 1, 0));
    assert_eq!(summary.tables.clients.inserted, 2);
    assert_eq!(summary.tables.proposals.inserted, 1);
    assert_eq!(summary.tables.defaulters.inserted, 1);
    assert_eq!(summary.tables.products.inserted, 1);
    assert_eq!(summary.filtered_records, 1);

    let tables = store.snapshot().await;
    let ana = tables.client(20, "12345678900").unwrap();
    assert_eq!(ana.broker_id, 1);
    assert_eq!(tables.row_count(), 5);

    assert!(names(pipeline.snapshots().list_unprocessed().await.unwrap()).is_empty());
    assert_eq!(names(pipeline.snapshots().list_processed().await.unwrap()), vec![ALFA.to_string()]);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    deliver(dir.path(), BETA, &bundle("111.222.333-44", "P-2")).await;
    let store = store();
    let pipeline = pipeline(dir.path(), &store);

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.processed, 2);
    let after_first = store.snapshot().await;

    let second = pipeline.run_once().await.unwrap();
    assert_eq!((second.discovered, second.processed), (0, 0));
    assert_eq!(store.snapshot().await, after_first);
}

#[tokio::test]
async fn redelivered_bundle_leaves_rows_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let bytes = bundle("123.456.789-00", "P-1");
    deliver(dir.path(), ALFA, &bytes).await;
    let store = store();
    let pipeline = pipeline(dir.path(), &store);
    pipeline.run_once().await.unwrap();
    let before = store.snapshot().await;

    deliver(dir.path(), ALFA, &bytes).await;
    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.tables.written(), 0);
    assert_eq!(summary.tables.clients.unchanged, 2);
    assert_eq!(store.snapshot().await, before);
    assert_eq!(names(pipeline.snapshots().list_processed().await.unwrap()), vec![ALFA.to_string()]);
}

#[tokio::test]
async fn formatted_and_bare_cpf_land_on_one_row() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    deliver(dir.path(), BETA, &bundle("12345678900", "P-2")).await;
    let store = store();

    pipeline(dir.path(), &store).run_once().await.unwrap();
    let tables = store.snapshot().await;
    let ana_rows = tables
        .clients
        .keys()
        .filter(|(_, digits)| digits == "12345678900")
        .count();
    assert_eq!(ana_rows, 1);
    // Last writer owns the client row.
    assert_eq!(tables.client(20, "12345678900").unwrap().broker_id, 2);
}

#[tokio::test]
async fn malformed_record_is_rejected_alone() {
    let dir = tempfile::tempdir().unwrap();
    let value = json!([
        {"name": "Clientes", "data": [
            {"id_cliente": "c1", "documento": "123", "nome": "Broken"},
            {"id_cliente": "c2", "documento": "987.654.321-00", "nome": "Bruno Lima"}
        ]}
    ]);
    deliver(dir.path(), ALFA, &serde_json::to_vec(&value).unwrap()).await;
    let store = store();

    let summary = pipeline(dir.path(), &store).run_once().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.rejected_records, 1);
    let tables = store.snapshot().await;
    assert_eq!(tables.clients.len(), 1);
    assert!(tables.client(20, "98765432100").is_some());
}

#[tokio::test]
async fn broken_bundle_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, b"{ not json").await;
    deliver(dir.path(), BETA, &bundle("111.222.333-44", "P-2")).await;
    let store = store();
    let pipeline = pipeline(dir.path(), &store);

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!((summary.processed, summary.skipped), (1, 1));
    assert_eq!(summary.failures[0].file_name, ALFA);
    assert_eq!(summary.failures[0].kind, "parse");
    assert_eq!(names(pipeline.snapshots().list_unprocessed().await.unwrap()), vec![ALFA.to_string()]);
}

#[tokio::test]
async fn unknown_broker_keeps_the_bundle_for_later() {
    let dir = tempfile::tempdir().unwrap();
    let file = "Extracao_Gama_Corretora_2025-01-10_08-00-00_backup.json";
    deliver(dir.path(), file, &bundle("123.456.789-00", "P-1")).await;
    let store = store();
    let pipeline = pipeline(dir.path(), &store);

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.failures[0].kind, "unknown_broker");
    assert_eq!(store.apply_calls().await, 0);
    assert_eq!(names(pipeline.snapshots().list_unprocessed().await.unwrap()), vec![file.to_string()]);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    let store = store();
    store
        .inject_failures([PersistenceError::Transient("connection reset".into())])
        .await;

    let summary = pipeline(dir.path(), &store).run_once().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(store.apply_calls().await, 2);
}

#[tokio::test]
async fn exhausted_retries_skip_the_bundle() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    let store = store();
    store
        .inject_failures(std::iter::repeat(PersistenceError::Transient("down".into())).take(3))
        .await;
    let pipeline = pipeline(dir.path(), &store);

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.failures[0].kind, "persistence");
    assert_eq!(store.apply_calls().await, 3);
    assert_eq!(pipeline.snapshots().list_unprocessed().await.unwrap().len(), 1);
}

#[tokio::test]
async fn data_error_rolls_back_the_whole_bundle() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    deliver(dir.path(), BETA, &bundle("111.222.333-44", "P-BAD")).await;
    let store = store();
    store.fail_on_proposal("P-BAD").await;
    let pipeline = pipeline(dir.path(), &store);

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!((summary.processed, summary.skipped), (1, 1));
    assert_eq!(store.apply_calls().await, 2);
    let tables = store.snapshot().await;
    assert!(tables.client(20, "11122233344").is_none());
    assert!(tables.client(20, "12345678900").is_some());
    assert_eq!(names(pipeline.snapshots().list_unprocessed().await.unwrap()), vec![BETA.to_string()]);
}

#[tokio::test]
async fn conflicting_archive_copy_keeps_the_bundle_unprocessed() {
    let dir = tempfile::tempdir().unwrap();
    let snapshots = SnapshotStore::new(dir.path(), "processados");
    snapshots.ensure_layout().await.unwrap();
    tokio::fs::write(snapshots.processed_dir().join(ALFA), b"older content").await.unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    let store = store();

    let summary = pipeline(dir.path(), &store).run_once().await.unwrap();
    assert_eq!(summary.failures[0].kind, "relocation");
    assert_eq!(snapshots.list_unprocessed().await.unwrap().len(), 1);
}

#[tokio::test]
async fn dry_run_never_moves_files() {
    let dir = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    let store = MemorySyncStore::permissive();
    let config = SyncConfig {
        dry_run: true,
        ..config(dir.path())
    };
    let pipeline = SyncPipeline::new(config, Box::new(store.clone()));

    let summary = pipeline.run_once().await.unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.processed, 1);
    assert!(summary.bundles[0].archived_to.is_none());
    assert_eq!(pipeline.snapshots().list_unprocessed().await.unwrap().len(), 1);
    assert!(!pipeline.snapshots().processed_dir().exists());
    assert_eq!(store.snapshot().await.clients.len(), 2);
}

#[tokio::test]
async fn summary_is_written_under_the_run_id() {
    let dir = tempfile::tempdir().unwrap();
    let reports = tempfile::tempdir().unwrap();
    deliver(dir.path(), ALFA, &bundle("123.456.789-00", "P-1")).await;
    let store = store();
    let config = SyncConfig {
        reports_dir: Some(reports.path().to_path_buf()),
        ..config(dir.path())
    };

    let summary = SyncPipeline::new(config, Box::new(store)).run_once().await.unwrap();
    let path = summary.report_path.clone().unwrap();
    assert_eq!(
        path,
        reports.path().join(summary.run_id.to_string()).join("sync_summary.json")
    );
    let written: Value = serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
    assert_eq!(written["processed"], 1);
    assert_eq!(written["bundles"][0]["unit_name"], "Alfa Corretora");
}
