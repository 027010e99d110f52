//! Durable persistence of share records
//!
//! `ShareStore` is the storage contract the registry writes through. Two
//! backends implement it: SQLite (default, survives agent restarts) and an
//! in-memory map for ephemeral deployments and tests.

use crate::config::{StoreBackend, StoreSettings};
use crate::daemon::protocol::{AccessModes, ShareId, ShareRecord};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSqlError, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::HashMap;
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Share {0} already exists")]
    DuplicateId(ShareId),

    #[error("Share {0} not found")]
    NotFound(ShareId),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create store directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value persistence of share records keyed by id.
///
/// Mutations are durable once they return `Ok`.
pub trait ShareStore: Send {
    /// Insert a record. Fails with `DuplicateId` if the id is taken.
    fn put(&mut self, record: &ShareRecord) -> StoreResult<()>;

    fn get(&self, id: ShareId) -> StoreResult<ShareRecord>;

    fn delete(&mut self, id: ShareId) -> StoreResult<()>;

    /// Every stored record, expired ones included, oldest first.
    fn list_all(&self) -> StoreResult<Vec<ShareRecord>>;

    /// Remove every record, returning how many were removed.
    fn clear(&mut self) -> StoreResult<usize>;

    fn backend_name(&self) -> &'static str;
}

/// Open the store selected by configuration.
pub fn open_store(settings: &StoreSettings) -> StoreResult<Box<dyn ShareStore>> {
    match settings.backend {
        StoreBackend::Sqlite => {
            let path = settings.effective_path();
            Ok(Box::new(SqliteStore::open(&path)?))
        }
        StoreBackend::Memory => Ok(Box::new(MemoryStore::new())),
    }
}

/// SQLite-backed store.
///
/// Rows carry an internal `row_id` surrogate key that never leaves this
/// module; records are addressed by their public id only.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a store at the specified path
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let store = Self { conn };
        store.create_tables()?;
        debug!(path = %path.display(), "Opened share store");
        Ok(store)
    }

    /// Open an in-memory SQLite database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS shares (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                public_id TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                path BLOB NOT NULL,
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                file_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                website INTEGER NOT NULL,
                wget INTEGER NOT NULL,
                owned_copy INTEGER NOT NULL DEFAULT 0,
                CHECK (expires_at >= created_at)
            );

            CREATE INDEX IF NOT EXISTS shares_expires_at ON shares (expires_at);
            "#,
        )?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = "SELECT public_id, owner, path, name, size, file_type, created_at, expires_at, website, wget, owned_copy FROM shares";

impl ShareStore for SqliteStore {
    fn put(&mut self, record: &ShareRecord) -> StoreResult<()> {
        let result = self.conn.execute(
            r#"
            INSERT INTO shares (public_id, owner, path, name, size, file_type, created_at, expires_at, website, wget, owned_copy)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.id.to_string(),
                record.owner,
                record.path.as_os_str().as_bytes(),
                record.name,
                record.size as i64,
                record.file_type,
                record.created_at.timestamp_micros(),
                record.expires_at.timestamp_micros(),
                record.modes.website,
                record.modes.wget,
                record.owned_copy,
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, message))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                // The only constraints are the id uniqueness and the expiry check,
                // so tell them apart by looking the id up.
                if self.get(record.id).is_ok() {
                    Err(StoreError::DuplicateId(record.id))
                } else {
                    Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, message)))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: ShareId) -> StoreResult<ShareRecord> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE public_id = ?1", SELECT_COLUMNS))?;

        let row: Option<ShareRow> = stmt
            .query_row(params![id.to_string()], ShareRow::from_row)
            .optional()?;

        match row {
            Some(row) => row.into_record(),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn delete(&mut self, id: ShareId) -> StoreResult<()> {
        let deleted = self.conn.execute(
            "DELETE FROM shares WHERE public_id = ?1",
            params![id.to_string()],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn list_all(&self) -> StoreResult<Vec<ShareRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY created_at ASC, row_id ASC", SELECT_COLUMNS))?;

        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(ShareRow::from_row(row)?.into_record()?);
        }
        Ok(records)
    }

    fn clear(&mut self) -> StoreResult<usize> {
        Ok(self.conn.execute("DELETE FROM shares", [])?)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Raw row data, converted into a `ShareRecord` outside of rusqlite's
/// error type.
struct ShareRow {
    public_id: String,
    owner: String,
    path: Vec<u8>,
    name: String,
    size: i64,
    file_type: String,
    created_at: i64,
    expires_at: i64,
    website: bool,
    wget: bool,
    owned_copy: bool,
}

impl ShareRow {
    fn from_row(row: &rusqlite::Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            public_id: row.get(0)?,
            owner: row.get(1)?,
            path: path_bytes(row.get_ref(2)?)?,
            name: row.get(3)?,
            size: row.get(4)?,
            file_type: row.get(5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
            website: row.get(8)?,
            wget: row.get(9)?,
            owned_copy: row.get(10)?,
        })
    }

    fn into_record(self) -> StoreResult<ShareRecord> {
        Ok(ShareRecord {
            id: self.public_id.parse()?,
            owner: self.owner,
            path: PathBuf::from(OsString::from_vec(self.path)),
            name: self.name,
            size: self.size.max(0) as u64,
            file_type: self.file_type,
            created_at: timestamp_from_micros(self.created_at)?,
            expires_at: timestamp_from_micros(self.expires_at)?,
            modes: AccessModes {
                website: self.website,
                wget: self.wget,
            },
            owned_copy: self.owned_copy,
        })
    }
}

/// Raw bytes of a stored path. Paths are written as BLOBs so names that are
/// not valid UTF-8 survive; TEXT values from older databases are accepted.
fn path_bytes(value: ValueRef<'_>) -> Result<Vec<u8>, rusqlite::Error> {
    match value {
        ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Ok(bytes.to_vec()),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            2,
            other.data_type(),
            Box::new(FromSqlError::InvalidType),
        )),
    }
}

fn timestamp_from_micros(micros: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros).ok_or(StoreError::InvalidTimestamp(micros))
}

/// Process-lifetime store backed by a hash map.
#[derive(Default)]
pub struct MemoryStore {
    records: HashMap<ShareId, (u64, ShareRecord)>,
    next_seq: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShareStore for MemoryStore {
    fn put(&mut self, record: &ShareRecord) -> StoreResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        self.next_seq += 1;
        self.records
            .insert(record.id, (self.next_seq, record.clone()));
        Ok(())
    }

    fn get(&self, id: ShareId) -> StoreResult<ShareRecord> {
        self.records
            .get(&id)
            .map(|(_, record)| record.clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn delete(&mut self, id: ShareId) -> StoreResult<()> {
        self.records
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    fn list_all(&self) -> StoreResult<Vec<ShareRecord>> {
        let mut entries: Vec<&(u64, ShareRecord)> = self.records.values().collect();
        entries.sort_by_key(|(seq, record)| (record.created_at, *seq));
        Ok(entries
            .into_iter()
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn clear(&mut self) -> StoreResult<usize> {
        let removed = self.records.len();
        self.records.clear();
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
