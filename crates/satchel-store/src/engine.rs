// ABOUTME: BackupEngine, the entry point that owns the datastore, schema graph, catalog, and restore lock.
// ABOUTME: Adds retention pruning and a catalog audit on top of snapshot, verify, and restore.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use satchel_core::{
    BackupMetadata, BackupOptions, RestoreOptions, RestoreOutcome, SchemaGraph,
    SelectiveRestoreOptions,
};
use ulid::Ulid;

use crate::catalog::{Catalog, JsonlCatalog, SqliteCatalog};
use crate::datastore::Datastore;
use crate::error::{BackupError, ErrorContext};
use crate::restore::Restorer;
use crate::snapshot::Snapshotter;
use crate::verify::{inspect, verify};

/// Which catalog implementation backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatalogKind {
    #[default]
    Jsonl,
    Sqlite,
}

/// Where the engine keeps its state and how strictly it isolates backups.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub catalog: CatalogKind,
    /// Make backups wait for any running restore and block restores while
    /// they run.
    pub strict_isolation: bool,
}

/// Outcome of checking one catalog entry against its artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Verified,
    Corrupted,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub metadata: BackupMetadata,
    pub status: AuditStatus,
}

/// Result of `BackupEngine::audit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub entries: Vec<AuditEntry>,
    /// Artifact files in the backup directory that no entry refers to.
    pub orphaned_files: Vec<PathBuf>,
}

impl AuditReport {
    pub fn count(&self, status: AuditStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn is_clean(&self) -> bool {
        self.orphaned_files.is_empty()
            && self.entries.iter().all(|e| e.status == AuditStatus::Verified)
    }
}

/// Backup and recovery for one datastore. Safe to share across threads:
/// each operation opens its own connection, catalog mutation is serialized
/// by the catalog, and restores are serialized by a global lock.
pub struct BackupEngine {
    datastore: Datastore,
    graph: SchemaGraph,
    catalog: Arc<dyn Catalog>,
    restore_lock: RwLock<()>,
    strict_isolation: bool,
}

impl BackupEngine {
    pub fn new(datastore: Datastore, graph: SchemaGraph, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            datastore,
            graph,
            catalog,
            restore_lock: RwLock::new(()),
            strict_isolation: false,
        }
    }

    /// Open the datastore and catalog named by the config.
    pub fn open(config: &EngineConfig, graph: SchemaGraph) -> Result<Self, BackupError> {
        if let Some(parent) = config.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(e, ErrorContext::default()))?;
        }
        let datastore = Datastore::open(&config.db_path)
            .map_err(|e| BackupError::datastore(e, ErrorContext::default()))?;
        let catalog: Arc<dyn Catalog> = match config.catalog {
            CatalogKind::Jsonl => Arc::new(JsonlCatalog::open(&config.backup_dir)?),
            CatalogKind::Sqlite => Arc::new(SqliteCatalog::open(&config.backup_dir)?),
        };

        tracing::info!(
            "backup engine ready: db={}, backups={}, catalog={:?}, strict_isolation={}",
            config.db_path.display(),
            config.backup_dir.display(),
            config.catalog,
            config.strict_isolation
        );
        Ok(Self::new(datastore, graph, catalog).with_strict_isolation(config.strict_isolation))
    }

    pub fn with_strict_isolation(mut self, strict: bool) -> Self {
        self.strict_isolation = strict;
        self
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    pub fn graph(&self) -> &SchemaGraph {
        &self.graph
    }

    pub fn backup_dir(&self) -> &Path {
        self.catalog.backup_dir()
    }

    /// Create the schema's tables in the live datastore if they are missing.
    pub fn install_schema(&self) -> Result<(), BackupError> {
        self.datastore
            .install_schema(&self.graph)
            .map_err(|e| BackupError::datastore(e, ErrorContext::default()))
    }

    pub fn create_backup(&self, options: &BackupOptions) -> Result<BackupMetadata, BackupError> {
        let _guard = self.strict_isolation.then(|| self.read_lock());
        Snapshotter::new(&self.datastore, &self.graph, self.catalog.as_ref()).create_backup(options)
    }

    pub fn restore_from_backup(
        &self,
        id: &Ulid,
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome, BackupError> {
        let _guard = self.write_lock();
        Restorer::new(&self.datastore, &self.graph, self.catalog.as_ref())
            .restore_from_backup(id, options)
    }

    pub fn restore_selective_tables(
        &self,
        id: &Ulid,
        tables: &BTreeSet<String>,
        options: &SelectiveRestoreOptions,
    ) -> Result<RestoreOutcome, BackupError> {
        let _guard = self.write_lock();
        Restorer::new(&self.datastore, &self.graph, self.catalog.as_ref())
            .restore_selective_tables(id, tables, options)
    }

    /// Catalog entries, oldest first.
    pub fn list(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        Ok(self.catalog.list()?)
    }

    pub fn get(&self, id: &Ulid) -> Result<BackupMetadata, BackupError> {
        Ok(self.catalog.get(id)?)
    }

    /// Remove the artifact, then the entry.
    pub fn delete(&self, id: &Ulid) -> Result<(), BackupError> {
        self.catalog.delete(id)?;
        tracing::info!("deleted backup {}", id);
        Ok(())
    }

    /// Recompute the artifact's checksum and compare it to the catalog. Never
    /// changes the entry.
    pub fn verify(&self, id: &Ulid) -> Result<bool, BackupError> {
        let metadata = self.catalog.get(id)?;
        verify(&self.catalog.artifact_path(&metadata), &metadata)
            .map_err(|e| BackupError::io(e, ErrorContext::backup(*id)))
    }

    /// Delete every backup except the newest `keep_last`. Returns the ids
    /// deleted, oldest first. Stops at the first delete that fails.
    pub fn prune(&self, keep_last: usize) -> Result<Vec<Ulid>, BackupError> {
        let entries = self.catalog.list()?;
        let excess = entries.len().saturating_sub(keep_last);

        let mut deleted = Vec::with_capacity(excess);
        for metadata in &entries[..excess] {
            self.catalog.delete(&metadata.id)?;
            deleted.push(metadata.id);
        }

        tracing::info!(
            "pruned {} backup(s), kept {}",
            deleted.len(),
            entries.len() - deleted.len()
        );
        Ok(deleted)
    }

    /// Check every entry against its artifact and look for artifact files no
    /// entry refers to.
    pub fn audit(&self) -> Result<AuditReport, BackupError> {
        let entries = self.catalog.list()?;

        let mut report = AuditReport::default();
        for metadata in entries {
            let path = self.catalog.artifact_path(&metadata);
            let inspection = inspect(&path, &metadata)
                .map_err(|e| BackupError::io(e, ErrorContext::backup(metadata.id)))?;
            let status = if inspection.is_missing() {
                AuditStatus::Missing
            } else if inspection.is_match() {
                AuditStatus::Verified
            } else {
                AuditStatus::Corrupted
            };
            if status != AuditStatus::Verified {
                tracing::warn!("backup {} audit status {:?}", metadata.id, status);
            }
            report.entries.push(AuditEntry { metadata, status });
        }

        let known: BTreeSet<&str> = report
            .entries
            .iter()
            .map(|e| e.metadata.filename.as_str())
            .collect();
        let dir_entries = fs::read_dir(self.catalog.backup_dir())
            .map_err(|e| BackupError::io(e, ErrorContext::default()))?;
        for entry in dir_entries {
            let entry = entry.map_err(|e| BackupError::io(e, ErrorContext::default()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if is_artifact_name(&name) && !known.contains(name.as_ref()) {
                report.orphaned_files.push(entry.path());
            }
        }
        report.orphaned_files.sort();

        Ok(report)
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.restore_lock.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.restore_lock.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Final artifact names only; in-flight temp files start with a dot.
fn is_artifact_name(name: &str) -> bool {
    name.starts_with("backup-") && name.ends_with(".jsonl")
}
