use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use cloudmirror_core::Bookmark;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::action_queue::ActionQueue;
use super::item_store::{ItemStore, StoreError, is_corruption_error};
use super::paths::PathCase;
use crate::error::ErrorKind;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DATABASE_FILE: &str = "vault.sqlite";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vault is shutting down")]
    Draining,
    #[error("vault is closed")]
    Closed,
    #[error("vault storage is corrupted: {0}")]
    Corrupted(String),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Draining | VaultError::Closed => ErrorKind::Closed,
            VaultError::Corrupted(_) | VaultError::Migration(_) => ErrorKind::StorageCorruption,
            VaultError::Sqlx(err) if is_corruption_error(err) => ErrorKind::StorageCorruption,
            VaultError::Store(err) if err.is_corruption() => ErrorKind::StorageCorruption,
            VaultError::Sqlx(_) | VaultError::Store(_) | VaultError::Io(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    Open,
    Draining,
    Closed,
    Corrupted,
}

impl VaultStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => VaultStatus::Open,
            1 => VaultStatus::Draining,
            2 => VaultStatus::Closed,
            _ => VaultStatus::Corrupted,
        }
    }
}

/// Item store and action queue of one bookmark, with their lifecycle.
pub struct Vault {
    bookmark: Bookmark,
    location: Option<PathBuf>,
    files_root: PathBuf,
    staging_root: PathBuf,
    case: PathCase,
    pool: SqlitePool,
    writer: Mutex<()>,
    generation: watch::Sender<u64>,
    status: AtomicU8,
}

impl Vault {
    /// Opens (creating if needed) the vault under `<root>/<bookmark key>/`.
    pub async fn open(root: &Path, bookmark: &Bookmark, case: PathCase) -> Result<Self, VaultError> {
        let location = root.join(bookmark.storage_key());
        tokio::fs::create_dir_all(location.join("files")).await?;
        tokio::fs::create_dir_all(location.join("staging")).await?;
        let options = SqliteConnectOptions::new()
            .filename(location.join(DATABASE_FILE))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let row = sqlx::query("PRAGMA quick_check").fetch_one(&pool).await?;
        let verdict: String = row.try_get(0)?;
        if verdict != "ok" {
            pool.close().await;
            return Err(VaultError::Corrupted(verdict));
        }

        Self::init(
            bookmark.clone(),
            Some(location.clone()),
            location.join("files"),
            location.join("staging"),
            case,
            pool,
        )
        .await
    }

    /// Vault whose tables live in memory. Downloaded and staged files go to a
    /// private directory under the system temp dir.
    pub async fn open_in_memory(bookmark: &Bookmark, case: PathCase) -> Result<Self, VaultError> {
        let scratch = std::env::temp_dir()
            .join("cloudmirror")
            .join(format!("{}-{}", bookmark.storage_key(), Uuid::new_v4()));
        tokio::fs::create_dir_all(scratch.join("staging")).await?;
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // every connection to :memory: is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::init(
            bookmark.clone(),
            None,
            scratch.join("files"),
            scratch.join("staging"),
            case,
            pool,
        )
        .await
    }

    async fn init(
        bookmark: Bookmark,
        location: Option<PathBuf>,
        files_root: PathBuf,
        staging_root: PathBuf,
        case: PathCase,
        pool: SqlitePool,
    ) -> Result<Self, VaultError> {
        MIGRATOR.run(&pool).await?;
        let (generation, _) = watch::channel(0);
        let vault = Self {
            bookmark,
            location,
            files_root,
            staging_root,
            case,
            pool,
            writer: Mutex::new(()),
            generation,
            status: AtomicU8::new(0),
        };

        let mut txn = vault.write().await?;
        let recovered = txn.queue().recover_interrupted().await?;
        txn.commit().await?;
        if recovered > 0 {
            warn!(bookmark = %vault.bookmark, recovered, "reset sync records interrupted by a previous shutdown");
        }
        info!(bookmark = %vault.bookmark, location = ?vault.location, "vault opened");
        Ok(vault)
    }

    pub fn bookmark(&self) -> &Bookmark {
        &self.bookmark
    }

    /// Directory holding the database, `None` for in-memory vaults.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn case(&self) -> PathCase {
        self.case
    }

    pub fn status(&self) -> VaultStatus {
        VaultStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn check_usable(&self) -> Result<(), VaultError> {
        match self.status() {
            VaultStatus::Open | VaultStatus::Draining => Ok(()),
            VaultStatus::Closed => Err(VaultError::Closed),
            VaultStatus::Corrupted => Err(VaultError::Corrupted(
                "vault was closed after a storage failure".into(),
            )),
        }
    }

    /// Fails unless the vault accepts new commands.
    pub fn ensure_accepting(&self) -> Result<(), VaultError> {
        match self.status() {
            VaultStatus::Open => Ok(()),
            VaultStatus::Draining => Err(VaultError::Draining),
            _ => self.check_usable(),
        }
    }

    /// Consistent read snapshot of both tables.
    pub async fn read(&self) -> Result<ReadTxn, VaultError> {
        self.check_usable()?;
        let tx = self.pool.begin().await?;
        Ok(ReadTxn { tx, case: self.case })
    }

    /// Exclusive write transaction. Item changes committed through it are
    /// announced to `subscribe()`rs.
    pub async fn write(&self) -> Result<WriteTxn<'_>, VaultError> {
        self.check_usable()?;
        let guard = self.writer.lock().await;
        self.check_usable()?;
        let tx = self.pool.begin().await?;
        Ok(WriteTxn {
            tx,
            items_changed: false,
            vault: self,
            _guard: guard,
        })
    }

    /// Receives the change generation, bumped after every commit that touched
    /// items.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Stops accepting commands; in-flight work may still commit.
    pub fn begin_drain(&self) {
        let _ = self.status.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    pub async fn close(&self) {
        let _guard = self.writer.lock().await;
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |status| {
                (status < 2).then_some(2)
            });
        self.pool.close().await;
        info!(bookmark = %self.bookmark, "vault closed");
    }

    /// Closes the vault for good after a storage failure.
    pub async fn mark_corrupted(&self) {
        let previous = self.status.swap(3, Ordering::AcqRel);
        if previous != 3 {
            error!(bookmark = %self.bookmark, "vault storage corrupted; closing vault");
        }
        self.pool.close().await;
    }
}

/// Write transaction over both tables. Dropping it without `commit` rolls
/// back.
pub struct WriteTxn<'v> {
    tx: Transaction<'static, Sqlite>,
    items_changed: bool,
    vault: &'v Vault,
    _guard: MutexGuard<'v, ()>,
}

impl WriteTxn<'_> {
    pub fn items(&mut self) -> ItemStore<'_> {
        ItemStore::new(&mut self.tx, self.vault.case, Some(&mut self.items_changed))
    }

    pub fn queue(&mut self) -> ActionQueue<'_> {
        ActionQueue::new(&mut self.tx, self.vault.case)
    }

    pub async fn commit(self) -> Result<(), VaultError> {
        let WriteTxn {
            tx,
            items_changed,
            vault,
            _guard,
        } = self;
        tx.commit().await?;
        if items_changed {
            vault.generation.send_modify(|generation| *generation += 1);
        }
        Ok(())
    }
}

/// Read-only snapshot over both tables.
pub struct ReadTxn {
    tx: Transaction<'static, Sqlite>,
    case: PathCase,
}

impl ReadTxn {
    pub fn items(&mut self) -> ItemStore<'_> {
        ItemStore::new(&mut self.tx, self.case, None)
    }

    pub fn queue(&mut self) -> ActionQueue<'_> {
        ActionQueue::new(&mut self.tx, self.case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::item_store::Item;
    use crate::sync::record::{ActionKind, NewRecord, RecordState};
    use cloudmirror_core::ItemType;
    use tempfile::tempdir;

    #[tokio::test]
    async fn item_commits_bump_generation() {
        let vault = Vault::open_in_memory(&Bookmark::new("test"), PathCase::Sensitive)
            .await
            .unwrap();
        let mut generation = vault.subscribe();
        assert_eq!(*generation.borrow_and_update(), 0);

        let mut txn = vault.write().await.unwrap();
        txn.queue()
            .enqueue(NewRecord::new(ActionKind::Download, "/a.txt"))
            .await
            .unwrap();
        txn.commit().await.unwrap();
        assert!(!generation.has_changed().unwrap());

        let mut txn = vault.write().await.unwrap();
        txn.items()
            .upsert_item(&Item::placeholder("/a", ItemType::Folder))
            .await
            .unwrap();
        txn.commit().await.unwrap();
        assert!(generation.has_changed().unwrap());
        assert_eq!(vault.generation(), 1);
    }

    #[tokio::test]
    async fn dropped_write_rolls_back() {
        let vault = Vault::open_in_memory(&Bookmark::new("test"), PathCase::Sensitive)
            .await
            .unwrap();
        {
            let mut txn = vault.write().await.unwrap();
            txn.items()
                .upsert_item(&Item::placeholder("/gone", ItemType::Folder))
                .await
                .unwrap();
        }
        let mut read = vault.read().await.unwrap();
        assert!(read.items().lookup("/gone").await.unwrap().is_none());
        assert_eq!(vault.generation(), 0);
    }

    #[tokio::test]
    async fn reopen_recovers_claimed_records_as_interrupted() {
        let dir = tempdir().unwrap();
        let bookmark = Bookmark::new("alice@example.com");
        {
            let vault = Vault::open(dir.path(), &bookmark, PathCase::Sensitive)
                .await
                .unwrap();
            let mut txn = vault.write().await.unwrap();
            txn.queue()
                .enqueue(NewRecord::new(ActionKind::CreateFolder, "/a"))
                .await
                .unwrap();
            let claimed = txn.queue().dequeue_next(i64::MAX).await.unwrap().unwrap();
            txn.queue()
                .mark_state(claimed.seq, RecordState::Executing)
                .await
                .unwrap();
            txn.commit().await.unwrap();
            vault.close().await;
        }

        let vault = Vault::open(dir.path(), &bookmark, PathCase::Sensitive)
            .await
            .unwrap();
        let mut read = vault.read().await.unwrap();
        let records = read.queue().list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, RecordState::Pending);
        assert!(records[0].interrupted);
        assert!(dir.path().join("alice_example.com").join("files").is_dir());
    }

    #[tokio::test]
    async fn closed_vault_refuses_work() {
        let vault = Vault::open_in_memory(&Bookmark::new("test"), PathCase::Sensitive)
            .await
            .unwrap();
        vault.begin_drain();
        assert!(matches!(vault.ensure_accepting(), Err(VaultError::Draining)));
        assert!(vault.write().await.is_ok());

        vault.close().await;
        assert!(matches!(vault.read().await, Err(VaultError::Closed)));
        assert_eq!(vault.status(), VaultStatus::Closed);
    }

    #[tokio::test]
    async fn corrupted_vault_reports_storage_corruption() {
        let vault = Vault::open_in_memory(&Bookmark::new("test"), PathCase::Sensitive)
            .await
            .unwrap();
        vault.mark_corrupted().await;
        let err = vault.write().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::StorageCorruption);
    }

    #[tokio::test]
    async fn garbage_database_file_is_rejected() {
        let dir = tempdir().unwrap();
        let bookmark = Bookmark::new("broken");
        let location = dir.path().join(bookmark.storage_key());
        std::fs::create_dir_all(&location).unwrap();
        std::fs::write(location.join(DATABASE_FILE), vec![0x5a; 8192]).unwrap();

        let err = Vault::open(dir.path(), &bookmark, PathCase::Sensitive)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::StorageCorruption);
    }
}
