use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use tracing::debug;

use groupsync_core::SyncConfig;

use crate::deferred::DeferredUploadRepo;
use crate::error::StorageError;
use crate::file_index::FileIndexRepo;
use crate::group_lock::GroupLockRepo;
use crate::master_version::MasterVersionRepo;
use crate::sharing::SharingRepo;
use crate::uploads::UploadRepo;
use crate::users::{DeviceRepo, UserRepo};

/// Connection factory for the shared SQLite store. Every request, and every
/// Uploader pass, works on its own connection.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn open(config: &SyncConfig) -> Result<Self, StorageError> {
        Self::open_path(&config.database_path, config.busy_timeout())
    }

    pub fn open_path(path: &Path, busy_timeout: Duration) -> Result<Self, StorageError> {
        let store = Self {
            path: path.to_path_buf(),
            busy_timeout,
        };
        let conn = store.connect()?;
        crate::schema::init_schema(&conn)?;
        debug!(path = %store.path.display(), "store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        crate::schema::configure_connection(&conn, self.busy_timeout)?;
        Ok(conn)
    }
}

/// Fresh in-memory database with the full schema, for single-connection use.
pub fn open_in_memory() -> Result<Connection, StorageError> {
    let conn = Connection::open_in_memory()?;
    crate::schema::configure_connection(&conn, Duration::from_millis(0))?;
    crate::schema::init_schema(&conn)?;
    Ok(conn)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Locks are taken lazily, on first read/write.
    Deferred,
    /// The write lock is taken at BEGIN, waiting out any current holder.
    Immediate,
}

/// A store transaction with typed access to each table. Dropping it without
/// `commit` rolls back.
pub struct StoreTx<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> StoreTx<'conn> {
    pub fn begin(conn: &'conn mut Connection, mode: TxMode) -> Result<Self, StorageError> {
        let behavior = match mode {
            TxMode::Deferred => TransactionBehavior::Deferred,
            TxMode::Immediate => TransactionBehavior::Immediate,
        };
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(|e| StorageError::from_write(e, || "begin transaction".into()))?;
        Ok(Self { tx })
    }

    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    pub fn master_versions(&self) -> MasterVersionRepo<'_> {
        MasterVersionRepo::new(&self.tx)
    }

    pub fn group_locks(&self) -> GroupLockRepo<'_> {
        GroupLockRepo::new(&self.tx)
    }

    pub fn uploads(&self) -> UploadRepo<'_> {
        UploadRepo::new(&self.tx)
    }

    pub fn file_index(&self) -> FileIndexRepo<'_> {
        FileIndexRepo::new(&self.tx)
    }

    pub fn deferred_uploads(&self) -> DeferredUploadRepo<'_> {
        DeferredUploadRepo::new(&self.tx)
    }

    pub fn users(&self) -> UserRepo<'_> {
        UserRepo::new(&self.tx)
    }

    pub fn devices(&self) -> DeviceRepo<'_> {
        DeviceRepo::new(&self.tx)
    }

    pub fn sharing(&self) -> SharingRepo<'_> {
        SharingRepo::new(&self.tx)
    }

    pub fn commit(self) -> Result<(), StorageError> {
        self.tx
            .commit()
            .map_err(|e| StorageError::from_write(e, || "commit".into()))
    }

    pub fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback()?;
        Ok(())
    }
}

/// Wrapper error type used to tunnel conversion failures through rusqlite's
/// error system in row-mapping closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}

pub(crate) fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(OpaqueStorageError(message)))
}

pub(crate) fn id_bytes(row: &Row, idx: usize) -> rusqlite::Result<[u8; 16]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| conversion_error(idx, Type::Blob, format!("expected 16-byte id, got {}", v.len())))
}

pub(crate) fn opt_id_bytes(row: &Row, idx: usize) -> rusqlite::Result<Option<[u8; 16]>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| {
            b.try_into().map_err(|v: Vec<u8>| {
                conversion_error(idx, Type::Blob, format!("expected 16-byte id, got {}", v.len()))
            })
        })
        .transpose()
}

/// Parses a TEXT column through `parse`, reporting failures against `idx`.
pub(crate) fn text_col<T>(
    row: &Row,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, StorageError>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).map_err(|e| conversion_error(idx, Type::Text, e.to_string()))
}

pub(crate) fn opt_checksum(row: &Row, idx: usize) -> rusqlite::Result<Option<groupsync_core::ContentHash>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        groupsync_core::ContentHash::from_hex(&t)
            .map_err(|e| conversion_error(idx, Type::Text, e.to_string()))
    })
    .transpose()
}

pub(crate) fn u32_col(row: &Row, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw).map_err(|_| conversion_error(idx, Type::Integer, format!("{raw} out of range")))
}

pub(crate) fn u64_col(row: &Row, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw).map_err(|_| conversion_error(idx, Type::Integer, format!("{raw} out of range")))
}

pub(crate) fn opt_u64_col(row: &Row, idx: usize) -> rusqlite::Result<Option<u64>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|r| u64::try_from(r).map_err(|_| conversion_error(idx, Type::Integer, format!("{r} out of range"))))
        .transpose()
}

pub(crate) fn count_rows(conn: &Connection, table: &'static str) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(count as u64)
}
