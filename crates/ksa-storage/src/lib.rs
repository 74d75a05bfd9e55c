//! Snapshot persistence: a Postgres primary, a JSON file fallback, and the
//! resilient dual-write policy composing them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ksa_core::{cutoff_ymd, Announcement, StoreStats, StoredAnnouncement};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ksa-storage";

/// Primary writes replace the table in batches of this size.
pub const SAVE_BATCH_SIZE: usize = 1000;
// bounds database load during large replacements
const BATCH_DELAY: Duration = Duration::from_millis(100);

/// A single backend failed; the dual-write policy decides whether that is
/// fatal.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot file is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Every snapshot backend rejected the write; durability is lost for this
/// run.
#[derive(Debug, Error)]
#[error("all snapshot backends failed (primary: {primary}; fallback: {fallback})")]
pub struct PersistenceError {
    pub primary: String,
    pub fallback: String,
}

/// One durable home for the snapshot.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn load(&self) -> Result<Vec<StoredAnnouncement>, BackendError>;

    /// Replaces the whole snapshot.
    async fn save(&self, rows: &[StoredAnnouncement]) -> Result<(), BackendError>;

    /// Deletes rows whose receipt window closed before `cutoff` (`YYYYMMDD`).
    async fn delete_expired(&self, cutoff: &str) -> Result<u64, BackendError>;
}

/// Store contract the pipeline consumes. Loading never fails: a missing or
/// unreachable store degrades to an empty snapshot, which is a valid
/// initial state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Vec<StoredAnnouncement>;

    /// Projects and persists the full replacement snapshot. An empty input
    /// keeps the existing snapshot.
    async fn save(&self, announcements: &[Announcement]) -> Result<(), PersistenceError>;

    /// Best-effort removal of records older than `max_age_days`; returns the
    /// re-loaded snapshot whether or not deletion succeeded.
    async fn prune(&self, max_age_days: u64) -> Vec<StoredAnnouncement>;

    async fn stats(&self) -> StoreStats {
        let rows = self.load().await;
        let mut stamps: Vec<_> = rows.iter().map(|row| row.stored_at).collect();
        stamps.sort();
        StoreStats {
            total_count: rows.len(),
            oldest_stored_at: stamps.first().copied(),
            newest_stored_at: stamps.last().copied(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    /// The pool is lazy: connection failures surface on first use, where
    /// the hybrid policy treats them as a primary outage.
    pub fn connect_lazy(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[async_trait]
impl SnapshotBackend for PgBackend {
    async fn load(&self) -> Result<Vec<StoredAnnouncement>, BackendError> {
        let rows = sqlx::query(
            r#"
            SELECT serial_no, title, receipt_begin, receipt_end, stored_at
              FROM announcements
             ORDER BY stored_at DESC, serial_no
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredAnnouncement {
                serial_no: row.try_get("serial_no")?,
                title: row.try_get("title")?,
                receipt_begin: row.try_get("receipt_begin")?,
                receipt_end: row.try_get("receipt_end")?,
                stored_at: row.try_get("stored_at")?,
            });
        }
        Ok(out)
    }

    async fn save(&self, rows: &[StoredAnnouncement]) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM announcements")
            .execute(&self.pool)
            .await?;

        for (index, chunk) in rows.chunks(SAVE_BATCH_SIZE).enumerate() {
            if index > 0 {
                tokio::time::sleep(BATCH_DELAY).await;
            }
            let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO announcements (serial_no, title, receipt_begin, receipt_end, stored_at) ",
            );
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.serial_no)
                    .push_bind(row.title.as_str())
                    .push_bind(row.receipt_begin.as_str())
                    .push_bind(row.receipt_end.as_str())
                    .push_bind(row.stored_at);
            });
            builder.build().execute(&self.pool).await?;
            debug!(batch = index + 1, rows = chunk.len(), "snapshot batch inserted");
        }
        Ok(())
    }

    async fn delete_expired(&self, cutoff: &str) -> Result<u64, BackendError> {
        let result = sqlx::query("DELETE FROM announcements WHERE receipt_end < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Local JSON file, the fallback home for the snapshot.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes through a temp file and renames so readers never observe a
    /// partial snapshot.
    async fn write_atomic(&self, bytes: &[u8]) -> Result<(), BackendError> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).await?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for FileBackend {
    async fn load(&self) -> Result<Vec<StoredAnnouncement>, BackendError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            // a store that has never been written is empty, not broken
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    async fn save(&self, rows: &[StoredAnnouncement]) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec_pretty(rows)?;
        self.write_atomic(&bytes).await
    }

    async fn delete_expired(&self, cutoff: &str) -> Result<u64, BackendError> {
        let rows = self.load().await?;
        let before = rows.len();
        let kept: Vec<StoredAnnouncement> = rows
            .into_iter()
            .filter(|row| row.receipt_end.as_str() >= cutoff)
            .collect();
        let removed = (before - kept.len()) as u64;
        if removed > 0 {
            self.save(&kept).await?;
        }
        Ok(removed)
    }
}

/// Primary and fallback composed behind one resilient policy: reads prefer
/// the primary, writes go to both independently, and only a write rejected
/// by both is fatal.
pub struct HybridStore {
    primary: Box<dyn SnapshotBackend>,
    fallback: Box<dyn SnapshotBackend>,
}

impl HybridStore {
    pub fn new(primary: Box<dyn SnapshotBackend>, fallback: Box<dyn SnapshotBackend>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl SnapshotStore for HybridStore {
    async fn load(&self) -> Vec<StoredAnnouncement> {
        match self.primary.load().await {
            Ok(rows) => {
                debug!(count = rows.len(), "snapshot loaded from primary");
                rows
            }
            Err(err) => {
                warn!(error = %err, "primary snapshot load failed, falling back");
                match self.fallback.load().await {
                    Ok(rows) => {
                        debug!(count = rows.len(), "snapshot loaded from fallback");
                        rows
                    }
                    Err(err) => {
                        warn!(error = %err, "fallback snapshot load failed, treating store as empty");
                        Vec::new()
                    }
                }
            }
        }
    }

    async fn save(&self, announcements: &[Announcement]) -> Result<(), PersistenceError> {
        if announcements.is_empty() {
            debug!("nothing to save, keeping the existing snapshot");
            return Ok(());
        }

        let stored_at = Utc::now();
        let rows: Vec<StoredAnnouncement> = announcements
            .iter()
            .map(|a| StoredAnnouncement::project(a, stored_at))
            .collect();

        let primary = self.primary.save(&rows).await;
        let fallback = self.fallback.save(&rows).await;
        match (primary, fallback) {
            (Ok(()), Ok(())) => {
                debug!(count = rows.len(), "snapshot written to both backends");
                Ok(())
            }
            (Err(err), Ok(())) => {
                warn!(error = %err, "primary snapshot write failed, fallback holds the snapshot");
                Ok(())
            }
            (Ok(()), Err(err)) => {
                warn!(error = %err, "fallback snapshot write failed, primary holds the snapshot");
                Ok(())
            }
            (Err(primary), Err(fallback)) => Err(PersistenceError {
                primary: primary.to_string(),
                fallback: fallback.to_string(),
            }),
        }
    }

    async fn prune(&self, max_age_days: u64) -> Vec<StoredAnnouncement> {
        let cutoff = cutoff_ymd(max_age_days);
        match self.primary.delete_expired(&cutoff).await {
            Ok(removed) if removed > 0 => {
                debug!(removed, %cutoff, "expired rows pruned from primary")
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "primary prune failed"),
        }
        match self.fallback.delete_expired(&cutoff).await {
            Ok(removed) if removed > 0 => {
                debug!(removed, %cutoff, "expired rows pruned from fallback")
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "fallback prune failed"),
        }
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn announcement(serial_no: i64, receipt_end: &str) -> Announcement {
        Announcement {
            serial_no,
            title: format!("Program {serial_no}"),
            organizer: "KISED".into(),
            receipt_begin: "20260701".into(),
            receipt_end: receipt_end.into(),
            category: "Funding".into(),
            region: "National".into(),
            body: String::new(),
            detail_url: String::new(),
            online_receipt: None,
            business_years: String::new(),
            recruiting: "Y".into(),
        }
    }

    fn stored(serial_no: i64, receipt_end: &str) -> StoredAnnouncement {
        StoredAnnouncement::project(&announcement(serial_no, receipt_end), Utc::now())
    }

    #[derive(Default)]
    struct MemBackend {
        rows: Mutex<Vec<StoredAnnouncement>>,
        fail_load: bool,
        fail_save: bool,
        fail_delete: bool,
    }

    impl MemBackend {
        fn with_rows(rows: Vec<StoredAnnouncement>) -> Self {
            Self {
                rows: Mutex::new(rows),
                ..Self::default()
            }
        }

        fn snapshot(&self) -> Vec<StoredAnnouncement> {
            self.rows.lock().unwrap().clone()
        }
    }

    // Arc impl lets a test hand the backend to the store and keep a handle
    // for inspection
    #[async_trait]
    impl SnapshotBackend for Arc<MemBackend> {
        async fn load(&self) -> Result<Vec<StoredAnnouncement>, BackendError> {
            if self.fail_load {
                return Err(BackendError::Other("load refused".into()));
            }
            Ok(self.snapshot())
        }

        async fn save(&self, rows: &[StoredAnnouncement]) -> Result<(), BackendError> {
            if self.fail_save {
                return Err(BackendError::Other("save refused".into()));
            }
            *self.rows.lock().unwrap() = rows.to_vec();
            Ok(())
        }

        async fn delete_expired(&self, cutoff: &str) -> Result<u64, BackendError> {
            if self.fail_delete {
                return Err(BackendError::Other("delete refused".into()));
            }
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|row| row.receipt_end.as_str() >= cutoff);
            Ok((before - rows.len()) as u64)
        }
    }

    fn hybrid(
        primary: MemBackend,
        fallback: MemBackend,
    ) -> (HybridStore, Arc<MemBackend>, Arc<MemBackend>) {
        let primary = Arc::new(primary);
        let fallback = Arc::new(fallback);
        let store = HybridStore::new(Box::new(primary.clone()), Box::new(fallback.clone()));
        (store, primary, fallback)
    }

    #[tokio::test]
    async fn load_prefers_the_primary() {
        let (store, _primary, _fallback) = hybrid(
            MemBackend::with_rows(vec![stored(1, "99991231")]),
            MemBackend::with_rows(vec![stored(2, "99991231")]),
        );

        let rows = store.load().await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].serial_no, 1);
    }

    #[tokio::test]
    async fn load_falls_back_when_the_primary_fails() {
        let (store, _primary, _fallback) = hybrid(
            MemBackend {
                fail_load: true,
                ..MemBackend::default()
            },
            MemBackend::with_rows(vec![stored(2, "99991231")]),
        );

        let rows = store.load().await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].serial_no, 2);
    }

    #[tokio::test]
    async fn load_degrades_to_empty_when_both_fail() {
        let (store, _primary, _fallback) = hybrid(
            MemBackend {
                fail_load: true,
                ..MemBackend::default()
            },
            MemBackend {
                fail_load: true,
                ..MemBackend::default()
            },
        );

        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn save_degrades_when_only_the_primary_fails() {
        let (store, _primary, fallback) = hybrid(
            MemBackend {
                fail_save: true,
                fail_load: true,
                ..MemBackend::default()
            },
            MemBackend::default(),
        );

        store
            .save(&[announcement(7, "99991231")])
            .await
            .expect("one surviving backend keeps the write durable");

        assert_eq!(fallback.snapshot().len(), 1);
        // a subsequent load is served by the fallback
        let rows = store.load().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].serial_no, 7);
    }

    #[tokio::test]
    async fn save_fails_only_when_both_backends_fail() {
        let (store, _primary, _fallback) = hybrid(
            MemBackend {
                fail_save: true,
                ..MemBackend::default()
            },
            MemBackend {
                fail_save: true,
                ..MemBackend::default()
            },
        );

        let err = store
            .save(&[announcement(7, "99991231")])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("save refused"));
        assert_eq!(err.primary, "save refused");
        assert_eq!(err.fallback, "save refused");
    }

    #[tokio::test]
    async fn empty_save_keeps_the_existing_snapshot() {
        let (store, primary, _fallback) = hybrid(
            MemBackend::with_rows(vec![stored(1, "99991231")]),
            MemBackend::default(),
        );

        store.save(&[]).await.unwrap();

        assert_eq!(primary.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn save_stamps_every_row_with_one_timestamp() {
        let (store, primary, _fallback) = hybrid(MemBackend::default(), MemBackend::default());

        store
            .save(&[announcement(1, "99991231"), announcement(2, "99991231")])
            .await
            .unwrap();

        let rows = primary.snapshot();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stored_at, rows[1].stored_at);
    }

    #[tokio::test]
    async fn prune_removes_expired_rows_from_both_backends() {
        let rows = vec![stored(1, "00010101"), stored(2, "99991231")];
        let (store, _primary, fallback) =
            hybrid(MemBackend::with_rows(rows.clone()), MemBackend::with_rows(rows));

        let remaining = store.prune(30).await;

        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].serial_no, 2);
        assert_eq!(fallback.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn prune_failures_never_escalate() {
        let (store, _primary, _fallback) = hybrid(
            MemBackend {
                rows: Mutex::new(vec![stored(1, "99991231")]),
                fail_delete: true,
                ..MemBackend::default()
            },
            MemBackend {
                fail_delete: true,
                ..MemBackend::default()
            },
        );

        let remaining = store.prune(30).await;

        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn stats_report_count_and_stamp_bounds() {
        let old = StoredAnnouncement {
            stored_at: Utc::now() - chrono::Duration::hours(2),
            ..stored(1, "99991231")
        };
        let new = stored(2, "99991231");
        let (store, _primary, _fallback) = hybrid(
            MemBackend::with_rows(vec![new.clone(), old.clone()]),
            MemBackend::default(),
        );

        let stats = store.stats().await;

        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.oldest_stored_at, Some(old.stored_at));
        assert_eq!(stats.newest_stored_at, Some(new.stored_at));
    }

    #[tokio::test]
    async fn file_backend_missing_file_is_an_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("missing/previous_announcements.json"));

        assert!(backend.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_backend_round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("data/previous_announcements.json"));

        backend.save(&[stored(1, "20260901")]).await.unwrap();
        backend
            .save(&[stored(2, "20260902"), stored(3, "20260903")])
            .await
            .unwrap();

        let rows = backend.load().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].serial_no, 2);
        // no temp files left behind
        let mut entries = std::fs::read_dir(dir.path().join("data")).unwrap();
        assert!(entries.all(|e| !e
            .unwrap()
            .file_name()
            .to_string_lossy()
            .ends_with(".tmp")));
    }

    #[tokio::test]
    async fn file_backend_corrupt_json_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("previous_announcements.json");
        std::fs::write(&path, "not json").unwrap();
        let backend = FileBackend::new(&path);

        assert!(matches!(
            backend.load().await.unwrap_err(),
            BackendError::Decode(_)
        ));
    }

    #[tokio::test]
    async fn file_backend_delete_expired_rewrites_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("previous_announcements.json"));
        backend
            .save(&[stored(1, "20250101"), stored(2, "99991231")])
            .await
            .unwrap();

        let removed = backend.delete_expired("20260101").await.unwrap();

        assert_eq!(removed, 1);
        let rows = backend.load().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].serial_no, 2);
    }
}
