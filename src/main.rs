// ABOUTME: Entry point for the satchel binary.
// ABOUTME: Parses CLI arguments, initializes tracing, and runs backup engine commands off the async runtime.

mod config;

use std::collections::BTreeSet;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use satchel_core::{BackupOptions, ParentPolicy, RestoreOptions, SelectiveRestoreOptions, crm_schema};
use satchel_store::{AuditStatus, BackupEngine};
use ulid::Ulid;

use crate::config::SatchelConfig;

#[derive(Debug, Parser)]
#[command(name = "satchel", version, about = "Verifiable backups of the CRM datastore")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the CRM tables in the datastore if they are missing.
    Init,
    /// Snapshot the datastore into a new verified artifact.
    Backup {
        /// Capture table structure only.
        #[arg(long)]
        schema_only: bool,
        /// Restrict the backup to these tables (repeatable).
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// List catalogued backups, oldest first.
    List,
    Show {
        id: String,
    },
    /// Recompute an artifact's checksum and compare it to the catalog.
    Verify {
        id: String,
    },
    /// Restore every table in a backup.
    Restore {
        id: String,
        /// Merge into the existing tables instead of dropping them first.
        #[arg(long)]
        keep_existing: bool,
        #[arg(long)]
        skip_validation: bool,
    },
    /// Restore only the named tables from a backup.
    RestoreTables {
        id: String,
        #[arg(long = "table", required = true)]
        tables: Vec<String>,
        /// Also restore the parents of the named tables.
        #[arg(long)]
        include_parents: bool,
        /// Delete the tables' live rows before replaying.
        #[arg(long)]
        clear_existing: bool,
        #[arg(long)]
        skip_validation: bool,
    },
    /// Delete a backup's artifact and catalog entry.
    Delete {
        id: String,
    },
    /// Delete all but the newest N backups.
    Prune {
        #[arg(long)]
        keep: usize,
    },
    /// Check every backup against its artifact and report stray files.
    Audit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("satchel=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SatchelConfig::from_env()?;
    tracing::debug!("loaded config: {:?}", config);

    tokio::task::spawn_blocking(move || run(cli.command, &config))
        .await
        .context("engine task panicked")?
}

fn parse_id(id: &str) -> anyhow::Result<Ulid> {
    id.parse::<Ulid>()
        .with_context(|| format!("invalid backup id: {}", id))
}

fn run(command: Command, config: &SatchelConfig) -> anyhow::Result<()> {
    let engine = BackupEngine::open(&config.engine_config(), crm_schema()?)?;

    match command {
        Command::Init => {
            engine.install_schema()?;
            println!("initialized {}", config.db_path.display());
        }
        Command::Backup {
            schema_only,
            tables,
        } => {
            let mut options = if schema_only {
                BackupOptions::schema_only()
            } else {
                BackupOptions::full()
            };
            if !tables.is_empty() {
                options = options.with_tables(tables);
            }
            let metadata = engine.create_backup(&options)?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::List => {
            for metadata in engine.list()? {
                println!(
                    "{}  {}  {:>10} bytes  verified={}  tables={}",
                    metadata.id,
                    metadata.created_at.to_rfc3339(),
                    metadata.size,
                    metadata.is_verified,
                    metadata.tables.join(",")
                );
            }
        }
        Command::Show { id } => {
            let metadata = engine.get(&parse_id(&id)?)?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::Verify { id } => {
            let id = parse_id(&id)?;
            if !engine.verify(&id)? {
                bail!("backup {} failed verification", id);
            }
            println!("backup {} verified", id);
        }
        Command::Restore {
            id,
            keep_existing,
            skip_validation,
        } => {
            let options = RestoreOptions {
                drop_existing: !keep_existing,
                validate_before_restore: !skip_validation,
            };
            let outcome = engine.restore_from_backup(&parse_id(&id)?, &options)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::RestoreTables {
            id,
            tables,
            include_parents,
            clear_existing,
            skip_validation,
        } => {
            let options = SelectiveRestoreOptions {
                validate_before_restore: !skip_validation,
                parent_policy: if include_parents {
                    ParentPolicy::IncludeParents
                } else {
                    ParentPolicy::Reject
                },
                clear_existing,
            };
            let tables: BTreeSet<String> = tables.into_iter().collect();
            let outcome = engine.restore_selective_tables(&parse_id(&id)?, &tables, &options)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Delete { id } => {
            let id = parse_id(&id)?;
            engine.delete(&id)?;
            println!("deleted {}", id);
        }
        Command::Prune { keep } => {
            for id in engine.prune(keep)? {
                println!("deleted {}", id);
            }
        }
        Command::Audit => {
            let report = engine.audit()?;
            for entry in &report.entries {
                let status = match entry.status {
                    AuditStatus::Verified => "ok",
                    AuditStatus::Corrupted => "CORRUPTED",
                    AuditStatus::Missing => "MISSING",
                };
                println!("{}  {}", entry.metadata.id, status);
            }
            for path in &report.orphaned_files {
                println!("orphaned  {}", path.display());
            }
            if !report.is_clean() {
                bail!(
                    "audit found {} corrupted, {} missing, {} orphaned",
                    report.count(AuditStatus::Corrupted),
                    report.count(AuditStatus::Missing),
                    report.orphaned_files.len()
                );
            }
        }
    }

    Ok(())
}
