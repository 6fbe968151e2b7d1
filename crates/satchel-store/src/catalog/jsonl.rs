// ABOUTME: File-backed catalog: an append-only JSONL log of append and tombstone records.
// ABOUTME: Replayed into memory on open; each record is fsynced before the in-memory view changes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use satchel_core::BackupMetadata;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{Catalog, CatalogError, remove_artifact};

pub const CATALOG_FILENAME: &str = "catalog.jsonl";

/// One line of the catalog log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum CatalogRecord {
    Append {
        metadata: BackupMetadata,
    },
    Tombstone {
        id: Ulid,
        deleted_at: DateTime<Utc>,
    },
}

struct Inner {
    file: File,
    entries: Vec<BackupMetadata>,
}

/// Catalog persisted as `catalog.jsonl` next to the artifacts.
pub struct JsonlCatalog {
    dir: PathBuf,
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonlCatalog {
    /// Open (or create) the catalog in `dir`. A torn trailing line left by a
    /// crash mid-append is repaired before replay.
    pub fn open(dir: &Path) -> Result<Self, CatalogError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CATALOG_FILENAME);

        let entries = if path.exists() {
            Self::repair(&path)?;
            Self::replay(&path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!("opened catalog {} with {} entries", path.display(), entries.len());

        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            inner: Mutex::new(Inner { file, entries }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn replay(path: &Path) -> Result<Vec<BackupMetadata>, CatalogError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries: Vec<BackupMetadata> = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CatalogRecord>(&line)? {
                CatalogRecord::Append { metadata } => {
                    if entries.iter().any(|m| m.id == metadata.id) {
                        return Err(CatalogError::Corrupt(format!(
                            "backup {} appended twice",
                            metadata.id
                        )));
                    }
                    entries.push(metadata);
                }
                CatalogRecord::Tombstone { id, .. } => {
                    entries.retain(|m| m.id != id);
                }
            }
        }

        Ok(entries)
    }

    /// Drop a trailing line that does not parse. Only the last line may be
    /// torn; an unparseable line earlier in the log is real corruption and
    /// is left for replay to report.
    fn repair(path: &Path) -> Result<(), CatalogError> {
        let contents = fs::read_to_string(path)?;
        if contents.is_empty() || contents.ends_with('\n') {
            return Ok(());
        }

        let keep = contents.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let tail = &contents[keep..];
        if serde_json::from_str::<CatalogRecord>(tail).is_ok() {
            // Complete record that only lost its newline.
            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            return Ok(());
        }

        tracing::warn!("truncating torn catalog record in {}", path.display());
        let tmp_path = path.with_extension("jsonl.tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(contents[..keep].as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn write_record(file: &mut File, record: &CatalogRecord) -> Result<(), CatalogError> {
        let json = serde_json::to_string(record)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;
        Ok(())
    }
}

impl Catalog for JsonlCatalog {
    fn backup_dir(&self) -> &Path {
        &self.dir
    }

    fn list(&self) -> Result<Vec<BackupMetadata>, CatalogError> {
        Ok(self.lock().entries.clone())
    }

    fn get(&self, id: &Ulid) -> Result<BackupMetadata, CatalogError> {
        self.lock()
            .entries
            .iter()
            .find(|m| m.id == *id)
            .cloned()
            .ok_or(CatalogError::NotFound(*id))
    }

    fn append(&self, metadata: &BackupMetadata) -> Result<(), CatalogError> {
        let mut inner = self.lock();
        if inner.entries.iter().any(|m| m.id == metadata.id) {
            return Err(CatalogError::Duplicate(metadata.id));
        }

        Self::write_record(
            &mut inner.file,
            &CatalogRecord::Append {
                metadata: metadata.clone(),
            },
        )?;
        inner.entries.push(metadata.clone());
        Ok(())
    }

    fn delete(&self, id: &Ulid) -> Result<(), CatalogError> {
        let mut inner = self.lock();
        let Some(position) = inner.entries.iter().position(|m| m.id == *id) else {
            return Err(CatalogError::NotFound(*id));
        };

        let path = self.dir.join(&inner.entries[position].filename);
        remove_artifact(&path, id)?;

        Self::write_record(
            &mut inner.file,
            &CatalogRecord::Tombstone {
                id: *id,
                deleted_at: Utc::now(),
            },
        )?;
        inner.entries.remove(position);
        Ok(())
    }
}
