// ABOUTME: Snapshotter: serializes selected tables in dependency order into one verified artifact.
// ABOUTME: Write-then-register ordering guarantees no catalog entry without a complete artifact.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;
use satchel_core::{BackupMetadata, BackupOptions, SchemaGraph};
use ulid::Ulid;

use crate::artifact::{ArtifactWriter, sql_literal};
use crate::catalog::Catalog;
use crate::datastore::{Datastore, attached_sql, quote_ident, table_columns, table_sql};
use crate::error::{BackupError, ErrorContext};
use crate::verify::{sha256_hex, verify};

/// Produces backups of the live datastore and registers them in a catalog.
pub struct Snapshotter<'a> {
    datastore: &'a Datastore,
    graph: &'a SchemaGraph,
    catalog: &'a dyn Catalog,
}

impl<'a> Snapshotter<'a> {
    pub fn new(datastore: &'a Datastore, graph: &'a SchemaGraph, catalog: &'a dyn Catalog) -> Self {
        Self {
            datastore,
            graph,
            catalog,
        }
    }

    /// Resolve the options to the ordered list of tables to snapshot.
    pub fn select_tables(&self, options: &BackupOptions) -> Result<Vec<String>, BackupError> {
        match &options.include_tables {
            None => Ok(self.graph.forward_order()),
            Some(requested) => {
                if requested.is_empty() {
                    return Err(BackupError::validation(
                        "include_tables is empty",
                        ErrorContext::default(),
                    ));
                }
                self.graph.validate_tables(requested)?;
                Ok(self.graph.order_subset(requested))
            }
        }
    }

    /// Snapshot the selected tables, write the artifact, self-verify it, and
    /// register it. On any failure after the artifact is written, the file is
    /// removed again so no orphan is left behind.
    pub fn create_backup(&self, options: &BackupOptions) -> Result<BackupMetadata, BackupError> {
        let tables = self.select_tables(options)?;
        let id = Ulid::new();
        let created_at = Utc::now();
        let context = ErrorContext::backup(id);

        tracing::info!(
            "creating backup {} of {} table(s), include_data={}",
            id,
            tables.len(),
            options.include_data
        );

        let bytes = self
            .serialize(id, created_at, options.include_data, &tables)
            .map_err(|e| e.with_context(context.clone()))?;

        let filename = BackupMetadata::artifact_filename(&id);
        let path = self.catalog.backup_dir().join(&filename);
        write_artifact(&path, &bytes).map_err(|e| BackupError::io(e, context.clone()))?;

        let mut metadata = BackupMetadata {
            id,
            filename,
            size: bytes.len() as u64,
            checksum: sha256_hex(&bytes),
            tables,
            is_verified: false,
            include_data: options.include_data,
            created_at,
        };

        match verify(&path, &metadata) {
            Ok(true) => metadata.is_verified = true,
            Ok(false) => {
                tracing::error!("backup {} failed its creation-time self-check", id);
            }
            Err(e) => {
                discard_artifact(&path);
                return Err(BackupError::io(e, context));
            }
        }

        if let Err(e) = self.catalog.append(&metadata) {
            discard_artifact(&path);
            return Err(BackupError::from(e).with_context(context));
        }

        tracing::info!(
            "backup {} written: {} bytes, checksum {}",
            id,
            metadata.size,
            metadata.checksum
        );
        Ok(metadata)
    }

    /// Read every selected table inside one transaction so the artifact
    /// reflects a single point in time.
    fn serialize(
        &self,
        id: Ulid,
        created_at: chrono::DateTime<Utc>,
        include_data: bool,
        tables: &[String],
    ) -> Result<Vec<u8>, BackupError> {
        let mut conn = self
            .datastore
            .connect()
            .map_err(|e| BackupError::datastore(e, ErrorContext::default()))?;
        let tx = conn
            .transaction()
            .map_err(|e| BackupError::datastore(e, ErrorContext::default()))?;

        let mut writer = ArtifactWriter::new(id, created_at, include_data, tables)?;
        for table in tables {
            let context = ErrorContext::default().on_table(table.as_str());
            let create_sql = table_sql(&tx, table)
                .map_err(|e| BackupError::datastore(e, context.clone()))?
                .ok_or_else(|| {
                    BackupError::validation(
                        format!("table {} does not exist in the datastore", table),
                        context.clone(),
                    )
                })?;
            let columns = table_columns(&tx, table)
                .map_err(|e| BackupError::datastore(e, context.clone()))?;
            let attached = attached_sql(&tx, table)
                .map_err(|e| BackupError::datastore(e, context.clone()))?;

            writer.table(table, &columns, &create_sql, &attached)?;
            if include_data {
                let rows = dump_rows(&tx, table, &columns)
                    .map_err(|e| BackupError::datastore(e, context.clone()))?;
                tracing::debug!("table {}: {} row(s)", table, rows.len());
                for literals in rows {
                    writer.row(table, &columns, &literals)?;
                }
            }
        }

        tx.commit()
            .map_err(|e| BackupError::datastore(e, ErrorContext::default()))?;
        Ok(writer.finish())
    }
}

/// Every row of a table as rendered SQL literals, in rowid order.
fn dump_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
) -> Result<Vec<Vec<String>>, rusqlite::Error> {
    let select: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} ORDER BY rowid",
        select.join(", "),
        quote_ident(table)
    ))?;

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut literals = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            literals.push(sql_literal(row.get_ref(i)?));
        }
        out.push(literals);
    }
    Ok(out)
}

/// Write the artifact with temp-file + fsync + rename so a crash never
/// leaves a partial file under the final name. The temp file is created
/// exclusively so two writers can never share it.
pub fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{}.tmp", name));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);

    if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, path)) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    if let Ok(dir) = File::open(&dir) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn discard_artifact(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::error!("could not remove unregistered artifact {}: {}", path.display(), e);
    }
}
