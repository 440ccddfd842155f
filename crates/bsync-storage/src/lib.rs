//! Snapshot directory bookkeeping, atomic file writes and retry utilities.
//!
//! The snapshot directory is a two-state machine: a bundle file is either in
//! the unprocessed root or in the processed archive. Moving it is a single
//! `rename`, so a bundle is never visible in both places or in neither.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bsync-storage";

/// Suffix the extractor gives every finished snapshot bundle.
pub const BUNDLE_SUFFIX: &str = "_backup.json";

/// Eligible bundles end in [`BUNDLE_SUFFIX`]; dot-files are in-flight temp files.
pub fn is_bundle_file_name(name: &str) -> bool {
    !name.starts_with('.') && name.len() > BUNDLE_SUFFIX.len() && name.ends_with(BUNDLE_SUFFIX)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a temp file in the same directory and a rename.
///
/// Readers either see the previous content or the complete new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub from: PathBuf,
    pub to: PathBuf,
    /// An archived copy with the same name and identical content was replaced.
    pub replaced_identical: bool,
}

#[derive(Debug, Error)]
pub enum RelocationError {
    #[error("{file_name} is already archived with different content")]
    AlreadyArchived { file_name: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    processed: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, processed_subdir: impl AsRef<Path>) -> Self {
        let root = root.into();
        let processed = root.join(processed_subdir);
        Self { root, processed }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed
    }

    pub async fn ensure_layout(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.processed)
            .await
            .with_context(|| format!("creating {}", self.processed.display()))
    }

    /// Bundles waiting for ingestion, sorted by file name.
    pub async fn list_unprocessed(&self) -> anyhow::Result<Vec<BundleFile>> {
        list_bundles(&self.root).await
    }

    pub async fn list_processed(&self) -> anyhow::Result<Vec<BundleFile>> {
        list_bundles(&self.processed).await
    }

    pub async fn read(&self, bundle: &BundleFile) -> std::io::Result<Vec<u8>> {
        fs::read(&bundle.path).await
    }

    /// Producer side of the directory contract: the bundle only becomes
    /// visible under its final name once fully written.
    pub async fn deliver(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<BundleFile> {
        let path = self.root.join(file_name);
        write_atomic(&path, bytes).await?;
        Ok(BundleFile {
            file_name: file_name.to_string(),
            path,
        })
    }

    /// Move a bundle into the processed archive, keeping its file name.
    pub async fn mark_processed(&self, bundle: &BundleFile) -> Result<Relocation, RelocationError> {
        fs::create_dir_all(&self.processed).await?;
        let target = self.processed.join(&bundle.file_name);

        let replaced_identical = if fs::try_exists(&target).await? {
            let archived = fs::read(&target).await?;
            let incoming = fs::read(&bundle.path).await?;
            if sha256_hex(&archived) != sha256_hex(&incoming) {
                return Err(RelocationError::AlreadyArchived {
                    file_name: bundle.file_name.clone(),
                });
            }
            true
        } else {
            false
        };

        match fs::rename(&bundle.path, &target).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists && replaced_identical => {
                // Platforms without replace-on-rename; the archive already holds these bytes.
                fs::remove_file(&bundle.path).await?;
            }
            Err(err) => return Err(err.into()),
        }

        debug!(from = %bundle.path.display(), to = %target.display(), "bundle archived");
        Ok(Relocation {
            from: bundle.path.clone(),
            to: target,
            replaced_identical,
        })
    }
}

async fn list_bundles(dir: &Path) -> anyhow::Result<Vec<BundleFile>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };

    let mut bundles = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("inspecting {}", entry.path().display()))?;
        if !file_type.is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if is_bundle_file_name(&file_name) {
            bundles.push(BundleFile {
                file_name,
                path: entry.path(),
            });
        }
    }
    bundles.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(bundles)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retry budget is spent.
pub async fn retry_with_backoff<T, E, Op, Fut>(
    policy: &BackoffPolicy,
    classify: impl Fn(&E) -> RetryDisposition,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == RetryDisposition::Retryable && attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const NAME: &str = "Extracao_Alfa_Corretora_2025-01-10_08-00-00_backup.json";

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn bundle_names_follow_the_backup_convention() {
        assert!(is_bundle_file_name(NAME));
        assert!(!is_bundle_file_name("Extracao_Alfa_2025-01-10_08-00-00.xlsx"));
        assert!(!is_bundle_file_name(".0c1d.42.tmp"));
        assert!(!is_bundle_file_name("._backup.json"));
        assert!(!is_bundle_file_name("_backup.json"));
    }

    #[tokio::test]
    async fn listing_skips_temp_files_foreign_files_and_the_archive() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "processados");
        store.ensure_layout().await.expect("layout");

        store.deliver(NAME, b"[]").await.expect("deliver");
        std::fs::write(dir.path().join("Extracao_Alfa.xlsx"), b"xlsx").expect("xlsx");
        std::fs::write(dir.path().join(".abc.2.tmp"), b"[]").expect("tmp");
        std::fs::write(store.processed_dir().join("Old_backup.json"), b"[]").expect("old");

        let pending = store.list_unprocessed().await.expect("list");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].file_name, NAME);

        let archived = store.list_processed().await.expect("list processed");
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn missing_root_lists_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("absent"), "processados");
        assert!(store.list_unprocessed().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn relocation_moves_the_file_and_keeps_its_name() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "processados");
        let bundle = store.deliver(NAME, b"[1]").await.expect("deliver");

        let moved = store.mark_processed(&bundle).await.expect("relocate");

        assert!(!moved.replaced_identical);
        assert!(!bundle.path.exists());
        assert_eq!(moved.to, store.processed_dir().join(NAME));
        assert_eq!(std::fs::read(&moved.to).expect("read"), b"[1]");
        assert!(store.list_unprocessed().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn identical_redelivery_replaces_the_archived_copy() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "processados");
        let first = store.deliver(NAME, b"[1]").await.expect("deliver");
        store.mark_processed(&first).await.expect("first move");

        let again = store.deliver(NAME, b"[1]").await.expect("redeliver");
        let moved = store.mark_processed(&again).await.expect("second move");

        assert!(moved.replaced_identical);
        assert!(!again.path.exists());
    }

    #[tokio::test]
    async fn conflicting_archive_copy_blocks_relocation() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "processados");
        let first = store.deliver(NAME, b"[1]").await.expect("deliver");
        store.mark_processed(&first).await.expect("first move");

        let changed = store.deliver(NAME, b"[2]").await.expect("redeliver");
        let err = store.mark_processed(&changed).await.unwrap_err();

        assert!(matches!(err, RelocationError::AlreadyArchived { .. }));
        assert!(changed.path.exists());
        assert_eq!(
            std::fs::read(store.processed_dir().join(NAME)).expect("read"),
            b"[1]"
        );
    }

    #[tokio::test]
    async fn atomic_write_overwrites_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.csv");
        write_atomic(&path, b"first").await.expect("first");
        write_atomic(&path, b"second").await.expect("second");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    fn instant_policy(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<&str, String> = retry_with_backoff(
            &instant_policy(3),
            |_| RetryDisposition::Retryable,
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection reset".to_string())
                } else {
                    Ok("done")
                }
            },
        )
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), String> = retry_with_backoff(
            &instant_policy(2),
            |_| RetryDisposition::Retryable,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn data_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), String> = retry_with_backoff(
            &instant_policy(5),
            |_| RetryDisposition::NonRetryable,
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("unique violation".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
