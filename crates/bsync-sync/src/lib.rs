//! Synchronizer: drains unprocessed snapshot bundles into the relational store.
//!
//! Each bundle is parsed, normalized, written in one transaction and only then
//! moved into the processed archive. A bundle that fails at any step stays
//! where it is and is picked up again by the next run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bsync_adapters::{bundle_id, normalize_bundle, parse_bundle_file_name, parse_raw_bundle, BundleParseError};
use bsync_core::NormalizedBundle;
use bsync_storage::{
    retry_with_backoff, sha256_hex, write_atomic, BackoffPolicy, BundleFile, RelocationError,
    RetryDisposition, SnapshotStore,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod memory;
mod pg;

pub use memory::{MemorySyncStore, MemoryTables, StoredRow};
pub use pg::{classify_sqlx_error, migrate, PgSyncStore, MIGRATOR};

pub const CRATE_NAME: &str = "bsync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub downloads_dir: PathBuf,
    pub processed_subdir: String,
    pub tenant_id: i64,
    pub insurance_company_id: i64,
    pub reports_dir: Option<PathBuf>,
    pub backoff: BackoffPolicy,
    pub max_connections: u32,
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            downloads_dir: PathBuf::from("downloads"),
            processed_subdir: "processados".to_string(),
            tenant_id: 20,
            insurance_company_id: 44,
            reports_dir: None,
            backoff: BackoffPolicy::default(),
            max_connections: 2,
            dry_run: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .or_else(|_| std::env::var("DB_URL"))
                .ok()
                .filter(|url| !url.trim().is_empty()),
            downloads_dir: std::env::var("BSYNC_DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.downloads_dir),
            processed_subdir: std::env::var("BSYNC_PROCESSED_SUBDIR")
                .unwrap_or(defaults.processed_subdir),
            tenant_id: env_number("BSYNC_TENANT_ID").unwrap_or(defaults.tenant_id),
            insurance_company_id: env_number("BSYNC_INSURANCE_COMPANY_ID")
                .unwrap_or(defaults.insurance_company_id),
            reports_dir: std::env::var("BSYNC_REPORTS_DIR").ok().map(PathBuf::from),
            backoff: BackoffPolicy {
                max_retries: env_number("BSYNC_DB_MAX_RETRIES").unwrap_or(defaults.backoff.max_retries),
                ..defaults.backoff
            },
            max_connections: env_number("BSYNC_DB_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            dry_run: false,
        }
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.downloads_dir, &self.processed_subdir)
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric setting");
            None
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("transient database failure: {0}")]
    Transient(String),
    #[error("database rejected the write: {0}")]
    Data(String),
}

impl PersistenceError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            PersistenceError::Transient(_) => RetryDisposition::Retryable,
            PersistenceError::Data(_) => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("reading bundle: {0}")]
    Read(#[source] std::io::Error),
    #[error(transparent)]
    Parse(#[from] BundleParseError),
    #[error("no broker matches unit `{unit}`")]
    UnknownBroker { unit: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Relocation(#[from] RelocationError),
}

impl BundleError {
    pub fn kind(&self) -> &'static str {
        match self {
            BundleError::Read(_) => "read",
            BundleError::Parse(_) => "parse",
            BundleError::UnknownBroker { .. } => "unknown_broker",
            BundleError::Persistence(_) => "persistence",
            BundleError::Relocation(_) => "relocation",
        }
    }
}

/// Scope every row of one bundle is written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleContext {
    pub tenant_id: i64,
    pub insurance_company_id: i64,
    pub broker_id: i64,
    pub broker_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// The row's parent client does not exist, so nothing was written.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounters {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl TableCounters {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
            UpsertOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn absorb(&mut self, other: &TableCounters) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
    }

    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BundleWriteStats {
    pub clients: TableCounters,
    pub proposals: TableCounters,
    pub defaulters: TableCounters,
    pub products: TableCounters,
}

impl BundleWriteStats {
    pub fn absorb(&mut self, other: &BundleWriteStats) {
        self.clients.absorb(&other.clients);
        self.proposals.absorb(&other.proposals);
        self.defaulters.absorb(&other.defaulters);
        self.products.absorb(&other.products);
    }

    pub fn written(&self) -> usize {
        self.clients.written()
            + self.proposals.written()
            + self.defaulters.written()
            + self.products.written()
    }
}

/// Persistence seam of the synchronizer.
///
/// `apply_bundle` is all-or-nothing: on `Err` none of the bundle's rows are
/// visible. Re-applying an identical bundle must report every row unchanged.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn resolve_broker(&self, unit_name: &str) -> Result<Option<i64>, PersistenceError>;

    async fn apply_bundle(
        &self,
        ctx: &BundleContext,
        bundle: &NormalizedBundle,
    ) -> Result<BundleWriteStats, PersistenceError>;

    /// Release connections. Called once at the end of a run.
    async fn close(&self);
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleReport {
    pub file_name: String,
    pub bundle_id: Uuid,
    pub content_hash: String,
    pub unit_name: String,
    pub broker_id: i64,
    pub stats: BundleWriteStats,
    pub rejected_records: usize,
    pub filtered_records: usize,
    pub archived_to: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleSkip {
    pub file_name: String,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub tables: BundleWriteStats,
    pub rejected_records: usize,
    pub filtered_records: usize,
    pub bundles: Vec<BundleReport>,
    pub failures: Vec<BundleSkip>,
    pub report_path: Option<PathBuf>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    snapshots: SnapshotStore,
    store: Box<dyn SyncStore>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Box<dyn SyncStore>) -> Self {
        let snapshots = config.snapshot_store();
        Self {
            config,
            snapshots,
            store,
        }
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub async fn close(&self) {
        self.store.close().await;
    }

    /// Attempt every eligible bundle once. Individual bundle failures are
    /// reported in the summary; only directory-level problems return `Err`.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, dry_run = self.config.dry_run);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        if !self.config.dry_run {
            self.snapshots.ensure_layout().await?;
        }
        let pending = self
            .snapshots
            .list_unprocessed()
            .await
            .context("discovering unprocessed bundles")?;
        info!(discovered = pending.len(), root = %self.snapshots.root().display(), "sync run started");

        let today = started_at.date_naive();
        let mut bundles = Vec::new();
        let mut failures = Vec::new();
        for bundle in &pending {
            let span = info_span!("bundle", file = %bundle.file_name);
            match self.process_bundle(bundle, today).instrument(span).await {
                Ok(report) => bundles.push(report),
                Err(err) => {
                    error!(file = %bundle.file_name, kind = err.kind(), error = %err, "bundle skipped; left for the next run");
                    failures.push(BundleSkip {
                        file_name: bundle.file_name.clone(),
                        kind: err.kind(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let mut tables = BundleWriteStats::default();
        for report in &bundles {
            tables.absorb(&report.stats);
        }
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            discovered: pending.len(),
            processed: bundles.len(),
            skipped: failures.len(),
            tables,
            rejected_records: bundles.iter().map(|b| b.rejected_records).sum(),
            filtered_records: bundles.iter().map(|b| b.filtered_records).sum(),
            bundles,
            failures,
            report_path: None,
        };

        if let Some(reports_dir) = &self.config.reports_dir {
            summary.report_path = Some(write_summary(reports_dir, &summary).await?);
        }

        info!(
            discovered = summary.discovered,
            processed = summary.processed,
            skipped = summary.skipped,
            rows_written = summary.tables.written(),
            rejected = summary.rejected_records,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn process_bundle(&self, bundle: &BundleFile, today: NaiveDate) -> Result<BundleReport, BundleError> {
        let bytes = self.snapshots.read(bundle).await.map_err(BundleError::Read)?;
        let content_hash = sha256_hex(&bytes);
        let raw = parse_raw_bundle(&bytes)?;
        let name = parse_bundle_file_name(&bundle.file_name);
        let normalized = normalize_bundle(&raw, &name, today);
        for rejected in &normalized.rejected {
            warn!(
                table = rejected.category.table(),
                section = %rejected.section,
                index = rejected.index,
                reason = %rejected.reason,
                "record rejected"
            );
        }

        let unit_name = normalized.unit_name.clone().unwrap_or_default();
        if unit_name.is_empty() {
            return Err(BundleError::UnknownBroker { unit: unit_name });
        }
        let policy = &self.config.backoff;
        let broker_id = retry_with_backoff(policy, PersistenceError::disposition, || {
            self.store.resolve_broker(&unit_name)
        })
        .await?
        .ok_or_else(|| BundleError::UnknownBroker {
            unit: unit_name.clone(),
        })?;

        let ctx = BundleContext {
            tenant_id: self.config.tenant_id,
            insurance_company_id: self.config.insurance_company_id,
            broker_id,
            broker_name: unit_name.clone(),
        };
        let stats = retry_with_backoff(policy, PersistenceError::disposition, || {
            self.store.apply_bundle(&ctx, &normalized)
        })
        .await?;

        let archived_to = if self.config.dry_run {
            None
        } else {
            let relocation = self.snapshots.mark_processed(bundle).await?;
            if relocation.replaced_identical {
                info!("archive already held identical content");
            }
            Some(relocation.to)
        };

        info!(
            broker_id,
            rows_written = stats.written(),
            rejected = normalized.rejected.len(),
            "bundle ingested"
        );
        Ok(BundleReport {
            file_name: bundle.file_name.clone(),
            bundle_id: bundle_id(&content_hash),
            content_hash,
            unit_name,
            broker_id,
            stats,
            rejected_records: normalized.rejected.len(),
            filtered_records: normalized.filtered.len(),
            archived_to,
        })
    }
}

async fn write_summary(reports_dir: &std::path::Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let path = reports_dir
        .join(summary.run_id.to_string())
        .join("sync_summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    write_atomic(&path, &bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// One complete run: pick the store, drain the snapshot directory, release the store.
pub async fn run_sync(config: SyncConfig) -> Result<SyncRunSummary> {
    let store: Box<dyn SyncStore> = if config.dry_run {
        info!("dry run: writes go to an in-memory store and bundles stay in place");
        Box::new(MemorySyncStore::permissive())
    } else {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL (or DB_URL) is not set")?;
        Box::new(PgSyncStore::connect(url, config.max_connections, &config.backoff).await?)
    };
    let pipeline = SyncPipeline::new(config, store);
    let result = pipeline.run_once().await;
    pipeline.close().await;
    result
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync(SyncConfig::from_env()).await
}
