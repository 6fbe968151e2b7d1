// ABOUTME: Configuration loading for the satchel CLI from environment variables.
// ABOUTME: Resolves the datastore path, backup directory, catalog kind, and isolation mode.

use std::path::PathBuf;

use satchel_store::{CatalogKind, EngineConfig};
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SATCHEL_CATALOG must be 'jsonl' or 'sqlite', got {0:?}")]
    InvalidCatalog(String),
}

/// CLI configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SatchelConfig {
    pub home: PathBuf,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub catalog: CatalogKind,
    pub strict_isolation: bool,
}

impl SatchelConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - SATCHEL_HOME: data directory (default: ~/.satchel)
    /// - SATCHEL_DB: live CRM database (default: $SATCHEL_HOME/crm.db)
    /// - SATCHEL_BACKUP_DIR: artifacts and catalog (default: $SATCHEL_HOME/backups)
    /// - SATCHEL_CATALOG: jsonl or sqlite (default: jsonl)
    /// - SATCHEL_STRICT_ISOLATION: backups wait for running restores (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let home = var("SATCHEL_HOME").map(PathBuf::from).unwrap_or_else(|| {
            var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".satchel")
        });

        let db_path = var("SATCHEL_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("crm.db"));
        let backup_dir = var("SATCHEL_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("backups"));

        let catalog = match var("SATCHEL_CATALOG").as_deref() {
            None | Some("jsonl") => CatalogKind::Jsonl,
            Some("sqlite") => CatalogKind::Sqlite,
            Some(other) => return Err(ConfigError::InvalidCatalog(other.to_string())),
        };

        let strict_isolation = var("SATCHEL_STRICT_ISOLATION")
            .map(|v| v == "true" || v == "1" || v == "yes")
            .unwrap_or(false);

        Ok(Self {
            home,
            db_path,
            backup_dir,
            catalog,
            strict_isolation,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            db_path: self.db_path.clone(),
            backup_dir: self.backup_dir.clone(),
            catalog: self.catalog,
            strict_isolation: self.strict_isolation,
        }
    }
}
