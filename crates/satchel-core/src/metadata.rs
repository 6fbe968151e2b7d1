// ABOUTME: Defines BackupMetadata, the catalog record describing one backup artifact.
// ABOUTME: Also holds the option and outcome types for creating backups and restoring them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Everything the catalog knows about one backup. All fields except
/// `is_verified` describe the artifact as it was at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: Ulid,
    pub filename: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the artifact bytes.
    pub checksum: String,
    /// Tables in the artifact, parents before children.
    pub tables: Vec<String>,
    pub is_verified: bool,
    pub include_data: bool,
    pub created_at: DateTime<Utc>,
}

impl BackupMetadata {
    /// Artifact file name for a backup id. ULIDs are unique, so the name is
    /// collision-free without consulting the directory.
    pub fn artifact_filename(id: &Ulid) -> String {
        format!("backup-{}.jsonl", id)
    }
}

/// Options for `create_backup`.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub include_data: bool,
    /// Restrict the snapshot to these tables. `None` means every table.
    pub include_tables: Option<BTreeSet<String>>,
}

impl BackupOptions {
    /// A full backup: every table, with row data.
    pub fn full() -> Self {
        Self {
            include_data: true,
            include_tables: None,
        }
    }

    pub fn schema_only() -> Self {
        Self {
            include_data: false,
            include_tables: None,
        }
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }
}

/// Options for a full restore.
#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    pub drop_existing: bool,
    pub validate_before_restore: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            drop_existing: true,
            validate_before_restore: true,
        }
    }
}

/// What a selective restore does when a requested child table's parent was
/// not requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentPolicy {
    /// Refuse unless the live parent table is already present and populated.
    #[default]
    Reject,
    /// Restore the parent closure of the requested tables.
    IncludeParents,
}

/// Options for a selective restore.
#[derive(Debug, Clone, Copy)]
pub struct SelectiveRestoreOptions {
    pub validate_before_restore: bool,
    pub parent_policy: ParentPolicy,
    /// Delete the live rows of every restored table (children first) before
    /// replaying. Without it, replayed rows are added to what is there.
    pub clear_existing: bool,
}

impl Default for SelectiveRestoreOptions {
    fn default() -> Self {
        Self {
            validate_before_restore: true,
            parent_policy: ParentPolicy::Reject,
            clear_existing: false,
        }
    }
}

/// Result of a restore. `restored_tables` lists exactly the tables that were
/// applied, in apply order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub success: bool,
    pub restored_tables: Vec<String>,
}
