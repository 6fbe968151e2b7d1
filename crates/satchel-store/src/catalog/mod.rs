// ABOUTME: The Catalog seam: an append-only registry of backup metadata with two-phase delete.
// ABOUTME: JSONL-file and SQLite implementations are interchangeable behind the Catalog trait.

pub mod jsonl;
pub mod sqlite;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use satchel_core::BackupMetadata;
use thiserror::Error;
use ulid::Ulid;

pub use jsonl::JsonlCatalog;
pub use sqlite::SqliteCatalog;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("backup not found: {0}")]
    NotFound(Ulid),

    #[error("backup already registered: {0}")]
    Duplicate(Ulid),

    #[error("failed to remove artifact for backup {id}: {source}")]
    ArtifactRemoval {
        id: Ulid,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt catalog record: {0}")]
    Corrupt(String),
}

/// Durable registry of backup metadata. Implementations guard mutation with a
/// single mutex so concurrent appends are safe.
pub trait Catalog: Send + Sync {
    /// Directory holding the artifacts this catalog describes.
    fn backup_dir(&self) -> &Path;

    /// Live entries, oldest first.
    fn list(&self) -> Result<Vec<BackupMetadata>, CatalogError>;

    fn get(&self, id: &Ulid) -> Result<BackupMetadata, CatalogError>;

    /// Register a new entry. Ids are unique; re-registering one is an error.
    fn append(&self, metadata: &BackupMetadata) -> Result<(), CatalogError>;

    /// Remove the artifact, then the entry. If the artifact cannot be
    /// removed the entry stays and the error is returned.
    fn delete(&self, id: &Ulid) -> Result<(), CatalogError>;

    fn artifact_path(&self, metadata: &BackupMetadata) -> PathBuf {
        self.backup_dir().join(&metadata.filename)
    }
}

/// First phase of a delete. An artifact that is already gone is an orphaned
/// entry: logged and treated as removed so the entry can follow it.
pub(crate) fn remove_artifact(path: &Path, id: &Ulid) -> Result<(), CatalogError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!(
                "artifact {} for backup {} was already missing; dropping catalog entry",
                path.display(),
                id
            );
            Ok(())
        }
        Err(source) => Err(CatalogError::ArtifactRemoval { id: *id, source }),
    }
}
