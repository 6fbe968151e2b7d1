// ABOUTME: SQLite-backed catalog kept in its own database file beside the artifacts.
// ABOUTME: Rows are never rewritten except to stamp a tombstone; list order follows insertion sequence.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use satchel_core::BackupMetadata;
use ulid::Ulid;

use super::{Catalog, CatalogError, remove_artifact};

pub const CATALOG_DB_FILENAME: &str = "catalog.db";

/// Catalog persisted in `catalog.db`. The connection lives behind the single
/// mutex that serializes every mutation.
pub struct SqliteCatalog {
    dir: PathBuf,
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str =
    "id, filename, size, checksum, tables, is_verified, include_data, created_at";

impl SqliteCatalog {
    /// Open or create the catalog database in `dir` and run migrations.
    pub fn open(dir: &Path) -> Result<Self, CatalogError> {
        fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(CATALOG_DB_FILENAME))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backup_catalog (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                tables TEXT NOT NULL,
                is_verified INTEGER NOT NULL,
                include_data INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                deleted_at TEXT
            );",
        )?;

        Ok(Self {
            dir: dir.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_row(row: &rusqlite::Row<'_>) -> Result<RawEntry, rusqlite::Error> {
        Ok(RawEntry {
            id: row.get(0)?,
            filename: row.get(1)?,
            size: row.get(2)?,
            checksum: row.get(3)?,
            tables: row.get(4)?,
            is_verified: row.get(5)?,
            include_data: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn find(conn: &Connection, id: &Ulid) -> Result<Option<BackupMetadata>, CatalogError> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM backup_catalog WHERE id = ?1 AND deleted_at IS NULL",
                    SELECT_COLUMNS
                ),
                params![id.to_string()],
                Self::read_row,
            )
            .optional()?;
        raw.map(RawEntry::into_metadata).transpose()
    }
}

/// A catalog row as stored, before its text columns are decoded.
struct RawEntry {
    id: String,
    filename: String,
    size: i64,
    checksum: String,
    tables: String,
    is_verified: bool,
    include_data: bool,
    created_at: String,
}

impl RawEntry {
    fn into_metadata(self) -> Result<BackupMetadata, CatalogError> {
        let id = self
            .id
            .parse::<Ulid>()
            .map_err(|e| CatalogError::Corrupt(format!("bad id {}: {}", self.id, e)))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| CatalogError::Corrupt(format!("bad created_at for {}: {}", id, e)))?
            .with_timezone(&Utc);

        Ok(BackupMetadata {
            id,
            filename: self.filename,
            size: self.size as u64,
            checksum: self.checksum,
            tables: serde_json::from_str(&self.tables)?,
            is_verified: self.is_verified,
            include_data: self.include_data,
            created_at,
        })
    }
}

impl Catalog for SqliteCatalog {
    fn backup_dir(&self) -> &Path {
        &self.dir
    }

    fn list(&self) -> Result<Vec<BackupMetadata>, CatalogError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM backup_catalog WHERE deleted_at IS NULL ORDER BY seq ASC",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::read_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_metadata()?);
        }
        Ok(entries)
    }

    fn get(&self, id: &Ulid) -> Result<BackupMetadata, CatalogError> {
        let conn = self.lock();
        Self::find(&conn, id)?.ok_or(CatalogError::NotFound(*id))
    }

    fn append(&self, metadata: &BackupMetadata) -> Result<(), CatalogError> {
        let conn = self.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT seq FROM backup_catalog WHERE id = ?1",
                params![metadata.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(CatalogError::Duplicate(metadata.id));
        }

        conn.execute(
            "INSERT INTO backup_catalog
                (id, filename, size, checksum, tables, is_verified, include_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metadata.id.to_string(),
                metadata.filename,
                metadata.size as i64,
                metadata.checksum,
                serde_json::to_string(&metadata.tables)?,
                metadata.is_verified,
                metadata.include_data,
                metadata.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &Ulid) -> Result<(), CatalogError> {
        let conn = self.lock();
        let metadata = Self::find(&conn, id)?.ok_or(CatalogError::NotFound(*id))?;

        remove_artifact(&self.dir.join(&metadata.filename), id)?;

        conn.execute(
            "UPDATE backup_catalog SET deleted_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }
}
