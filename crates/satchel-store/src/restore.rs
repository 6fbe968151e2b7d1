// ABOUTME: Restorer: verifies an artifact, plans drops and replays against the live store, applies in one transaction.
// ABOUTME: Every invocation walks the RestorePhase machine and ends Committed, Rejected, or RolledBack.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;

use rusqlite::Connection;
use satchel_core::{
    ParentPolicy, RestoreOptions, RestoreOutcome, RestorePhase, SchemaGraph,
    SelectiveRestoreOptions,
};
use ulid::Ulid;

use crate::artifact::Artifact;
use crate::catalog::Catalog;
use crate::datastore::{
    Datastore, foreign_key_parents, introspect, list_tables, quote_ident, row_count,
    table_columns, table_exists,
};
use crate::error::{BackupError, ErrorContext};
use crate::verify::verify_bytes;

/// Ordered work for one restore. Drops run first, then clears, then each
/// applied table is created if missing and its rows replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestorePlan {
    pub drops: Vec<String>,
    pub clears: Vec<String>,
    pub applies: Vec<String>,
}

/// Phase bookkeeping for a single restore invocation.
struct Run {
    id: Ulid,
    phase: RestorePhase,
}

impl Run {
    fn new(id: Ulid) -> Self {
        Self {
            id,
            phase: RestorePhase::Idle,
        }
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::backup(self.id).in_phase(self.phase)
    }

    fn advance(&mut self, next: RestorePhase) -> Result<(), BackupError> {
        self.phase
            .advance(next)
            .map_err(|e| BackupError::from(e).with_context(ErrorContext::backup(self.id)))
    }

    /// Stamp the error with where it happened, then move to the terminal
    /// phase that matches: rolled back once applying started, rejected before.
    fn abort(&mut self, err: BackupError) -> BackupError {
        let err = err.with_context(self.context());
        let exit = if self.phase == RestorePhase::Applying {
            RestorePhase::RolledBack
        } else {
            RestorePhase::Rejected
        };
        if self.phase.advance(exit).is_ok() {
            tracing::warn!("restore of backup {} ended {}: {}", self.id, exit, err);
        }
        err
    }
}

/// Replays catalogued artifacts into the live datastore.
pub struct Restorer<'a> {
    datastore: &'a Datastore,
    graph: &'a SchemaGraph,
    catalog: &'a dyn Catalog,
}

impl<'a> Restorer<'a> {
    pub fn new(datastore: &'a Datastore, graph: &'a SchemaGraph, catalog: &'a dyn Catalog) -> Self {
        Self {
            datastore,
            graph,
            catalog,
        }
    }

    /// Restore every table in the artifact. With `drop_existing` the
    /// artifact's tables are dropped children-first and recreated; without
    /// it the rows are merged into the existing tables, and conflicts
    /// surface as an apply error that rolls everything back.
    pub fn restore_from_backup(
        &self,
        id: &Ulid,
        options: &RestoreOptions,
    ) -> Result<RestoreOutcome, BackupError> {
        let mut run = Run::new(*id);
        tracing::info!(
            "restoring backup {} (drop_existing={}, validate={})",
            id,
            options.drop_existing,
            options.validate_before_restore
        );

        run.advance(RestorePhase::Validating)?;
        let artifact = self
            .load(id, options.validate_before_restore)
            .map_err(|e| run.abort(e))?;

        run.advance(RestorePhase::Preparing)?;
        let mut conn = self
            .datastore
            .connect()
            .map_err(|e| run.abort(BackupError::datastore(e, ErrorContext::default())))?;
        let plan = plan_full(&conn, &artifact, options).map_err(|e| run.abort(e))?;

        execute(&mut run, &mut conn, &artifact, plan)
    }

    /// Restore only the requested tables (plus their parents under
    /// `ParentPolicy::IncludeParents`). Every other table is left untouched.
    pub fn restore_selective_tables(
        &self,
        id: &Ulid,
        tables: &BTreeSet<String>,
        options: &SelectiveRestoreOptions,
    ) -> Result<RestoreOutcome, BackupError> {
        let mut run = Run::new(*id);
        tracing::info!(
            "restoring {:?} from backup {} (policy={:?}, validate={})",
            tables,
            id,
            options.parent_policy,
            options.validate_before_restore
        );

        run.advance(RestorePhase::Validating)?;
        let artifact = self
            .load(id, options.validate_before_restore)
            .and_then(|artifact| {
                self.check_request(&artifact, tables)?;
                Ok(artifact)
            })
            .map_err(|e| run.abort(e))?;

        run.advance(RestorePhase::Preparing)?;
        let mut conn = self
            .datastore
            .connect()
            .map_err(|e| run.abort(BackupError::datastore(e, ErrorContext::default())))?;
        let plan = plan_selective(&conn, self.graph, &artifact, tables, options)
            .map_err(|e| run.abort(e))?;

        execute(&mut run, &mut conn, &artifact, plan)
    }

    /// Read the artifact once, check those exact bytes, then decode them.
    fn load(&self, id: &Ulid, validate: bool) -> Result<Artifact, BackupError> {
        let metadata = self.catalog.get(id)?;
        let path = self.catalog.artifact_path(&metadata);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackupError::corruption(
                    format!("artifact {} is missing", path.display()),
                    ErrorContext::default(),
                ));
            }
            Err(e) => return Err(BackupError::io(e, ErrorContext::default())),
        };

        if validate && !verify_bytes(&bytes, &metadata) {
            return Err(BackupError::corruption(
                format!(
                    "artifact {} does not match its recorded checksum",
                    metadata.filename
                ),
                ErrorContext::default(),
            ));
        }

        let artifact = Artifact::parse(&bytes)?;
        if artifact.backup_id != metadata.id {
            return Err(BackupError::corruption(
                format!("artifact header names backup {}", artifact.backup_id),
                ErrorContext::default(),
            ));
        }
        Ok(artifact)
    }

    fn check_request(&self, artifact: &Artifact, tables: &BTreeSet<String>) -> Result<(), BackupError> {
        if tables.is_empty() {
            return Err(BackupError::validation(
                "no tables requested",
                ErrorContext::default(),
            ));
        }
        self.graph.validate_tables(tables)?;
        for table in tables {
            if artifact.section(table).is_none() {
                return Err(BackupError::validation(
                    format!("table {} is not in this backup", table),
                    ErrorContext::default().on_table(table.as_str()),
                ));
            }
        }
        Ok(())
    }
}

fn execute(
    run: &mut Run,
    conn: &mut Connection,
    artifact: &Artifact,
    plan: RestorePlan,
) -> Result<RestoreOutcome, BackupError> {
    run.advance(RestorePhase::Applying)?;
    tracing::debug!(
        "backup {}: drop {:?}, clear {:?}, apply {:?}",
        run.id,
        plan.drops,
        plan.clears,
        plan.applies
    );

    if let Err(e) = apply_plan(conn, artifact, &plan) {
        return Err(run.abort(e));
    }

    run.advance(RestorePhase::Committed)?;
    tracing::info!(
        "restore of backup {} committed: {} table(s)",
        run.id,
        plan.applies.len()
    );
    Ok(RestoreOutcome {
        success: true,
        restored_tables: plan.applies,
    })
}

fn plan_full(
    conn: &Connection,
    artifact: &Artifact,
    options: &RestoreOptions,
) -> Result<RestorePlan, BackupError> {
    let applies = artifact.tables();

    if !options.drop_existing {
        check_columns(conn, artifact, &applies)?;
        return Ok(RestorePlan {
            applies,
            ..RestorePlan::default()
        });
    }

    let live: BTreeSet<String> = list_tables(conn)
        .map_err(|e| BackupError::datastore(e, ErrorContext::default()))?
        .into_iter()
        .collect();
    let drops: Vec<String> = applies
        .iter()
        .rev()
        .filter(|t| live.contains(*t))
        .cloned()
        .collect();

    // The artifact's order came from the graph at backup time; the drops
    // must also be safe under the foreign keys the live tables declare.
    let live_graph = introspect(conn)?;
    let dropped: BTreeSet<String> = drops.iter().cloned().collect();
    if !live_graph.is_safe_drop_sequence(&drops, &dropped) {
        return Err(BackupError::dependency(
            format!(
                "dropping {:?} in that order would remove a parent before its child",
                drops
            ),
            ErrorContext::default(),
        ));
    }
    check_live_dependents(conn, &live, &drops, "drop")?;

    Ok(RestorePlan {
        drops,
        clears: Vec::new(),
        applies,
    })
}

fn plan_selective(
    conn: &Connection,
    graph: &SchemaGraph,
    artifact: &Artifact,
    requested: &BTreeSet<String>,
    options: &SelectiveRestoreOptions,
) -> Result<RestorePlan, BackupError> {
    let in_artifact: BTreeSet<String> = artifact.tables().into_iter().collect();
    let wanted: BTreeSet<String> = match options.parent_policy {
        ParentPolicy::Reject => requested.clone(),
        // Parents that already hold rows stay as they are, exactly as under
        // Reject; only missing or empty ones are brought back.
        ParentPolicy::IncludeParents => {
            let mut wanted = requested.clone();
            for parent in graph.parent_closure(requested) {
                if wanted.contains(&parent) || !in_artifact.contains(&parent) {
                    continue;
                }
                let populated = has_rows(conn, &parent).map_err(|e| {
                    BackupError::datastore(e, ErrorContext::default().on_table(parent.as_str()))
                })?;
                if !populated {
                    wanted.insert(parent);
                }
            }
            wanted
        }
    };
    let applies: Vec<String> = artifact
        .tables()
        .into_iter()
        .filter(|t| wanted.contains(t))
        .collect();

    // A child that brings rows needs every parent outside the restored set
    // to already hold data.
    for table in &applies {
        let carries_rows = artifact.section(table).is_some_and(|s| !s.rows.is_empty());
        if !carries_rows {
            continue;
        }
        for parent in graph.parents_of(table) {
            if parent == table || wanted.contains(parent) {
                continue;
            }
            let populated = has_rows(conn, parent).map_err(|e| {
                BackupError::datastore(e, ErrorContext::default().on_table(parent.as_str()))
            })?;
            if !populated {
                let reason = match options.parent_policy {
                    ParentPolicy::Reject => "was not requested",
                    ParentPolicy::IncludeParents => "is not in this backup",
                };
                return Err(BackupError::dependency(
                    format!(
                        "table {} needs parent {}, which {} and has no live rows",
                        table, parent, reason
                    ),
                    ErrorContext::default().on_table(table.as_str()),
                ));
            }
        }
    }

    check_columns(conn, artifact, &applies)?;

    let clears = if options.clear_existing {
        let live: BTreeSet<String> = list_tables(conn)
            .map_err(|e| BackupError::datastore(e, ErrorContext::default()))?
            .into_iter()
            .collect();
        let clears: Vec<String> = applies
            .iter()
            .rev()
            .filter(|t| live.contains(*t))
            .cloned()
            .collect();
        check_live_dependents(conn, &live, &clears, "clear")?;
        clears
    } else {
        Vec::new()
    };

    Ok(RestorePlan {
        drops: Vec::new(),
        clears,
        applies,
    })
}

fn has_rows(conn: &Connection, table: &str) -> Result<bool, rusqlite::Error> {
    Ok(table_exists(conn, table)? && row_count(conn, table)? > 0)
}

/// Refuse to empty tables that a live table outside the restore still
/// references with rows of its own.
fn check_live_dependents(
    conn: &Connection,
    live: &BTreeSet<String>,
    removed: &[String],
    action: &str,
) -> Result<(), BackupError> {
    let removed: BTreeSet<&String> = removed.iter().collect();
    for table in live.iter().filter(|t| !removed.contains(t)) {
        let context = ErrorContext::default().on_table(table.as_str());
        let parents = foreign_key_parents(conn, table)
            .map_err(|e| BackupError::datastore(e, context.clone()))?;
        let Some(parent) = parents.iter().find(|p| removed.contains(p)) else {
            continue;
        };
        let rows = row_count(conn, table).map_err(|e| BackupError::datastore(e, context.clone()))?;
        if rows > 0 {
            return Err(BackupError::dependency(
                format!(
                    "cannot {} {}: {} row(s) in {} reference it",
                    action, parent, rows, table
                ),
                context,
            ));
        }
    }
    Ok(())
}

/// Replaying into an existing table requires the exact column list the
/// artifact's statements were written against.
fn check_columns(conn: &Connection, artifact: &Artifact, tables: &[String]) -> Result<(), BackupError> {
    for table in tables {
        let Some(section) = artifact.section(table) else {
            continue;
        };
        let context = ErrorContext::default().on_table(table.as_str());
        let live = table_columns(conn, table).map_err(|e| BackupError::datastore(e, context.clone()))?;
        if !live.is_empty() && live != section.columns {
            return Err(BackupError::validation(
                format!(
                    "live columns {:?} differ from backup columns {:?}",
                    live, section.columns
                ),
                context,
            ));
        }
    }
    Ok(())
}

fn apply_error(source: rusqlite::Error, statement: usize, table: &str) -> BackupError {
    BackupError::Apply {
        source,
        statement,
        context: ErrorContext::default().on_table(table),
    }
}

/// Run the plan in one transaction. Returning early drops the transaction,
/// which rolls back every statement of this invocation.
fn apply_plan(conn: &mut Connection, artifact: &Artifact, plan: &RestorePlan) -> Result<(), BackupError> {
    let tx = conn
        .transaction()
        .map_err(|e| BackupError::datastore(e, ErrorContext::default()))?;
    let mut statement = 0usize;

    for table in &plan.drops {
        statement += 1;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .map_err(|e| apply_error(e, statement, table))?;
    }

    for table in &plan.clears {
        statement += 1;
        tx.execute(&format!("DELETE FROM {}", quote_ident(table)), [])
            .map_err(|e| apply_error(e, statement, table))?;
    }

    for table in &plan.applies {
        let section = artifact.section(table).ok_or_else(|| {
            BackupError::corruption(
                format!("no section for table {}", table),
                ErrorContext::default().on_table(table.as_str()),
            )
        })?;

        statement += 1;
        tx.execute_batch(&section.create_sql)
            .map_err(|e| apply_error(e, statement, table))?;
        for row in &section.rows {
            statement += 1;
            tx.execute(row, []).map_err(|e| apply_error(e, statement, table))?;
        }
        // Triggers go in after the rows so replayed inserts do not fire them.
        for sql in &section.attached_sql {
            statement += 1;
            tx.execute(sql, []).map_err(|e| apply_error(e, statement, table))?;
        }
        tracing::debug!(
            "applied {} row(s) and {} index/trigger definition(s) to {}",
            section.rows.len(),
            section.attached_sql.len(),
            table
        );
    }

    tx.commit()
        .map_err(|e| BackupError::datastore(e, ErrorContext::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactWriter;
    use crate::catalog::JsonlCatalog;
    use crate::snapshot::{Snapshotter, write_artifact};
    use crate::testing::{CrmSeed, clear_all, dump_all, dump_table, seed_crm};
    use crate::verify::sha256_hex;
    use chrono::Utc;
    use satchel_core::{BackupMetadata, BackupOptions, crm_schema};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Datastore,
        graph: SchemaGraph,
        catalog: JsonlCatalog,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let graph = crm_schema().unwrap();
            let store = Datastore::open(&dir.path().join("crm.db")).unwrap();
            store.install_schema(&graph).unwrap();
            seed_crm(&store.connect().unwrap(), &CrmSeed::small()).unwrap();
            let catalog = JsonlCatalog::open(&dir.path().join("backups")).unwrap();
            Self {
                _dir: dir,
                store,
                graph,
                catalog,
            }
        }

        fn backup(&self, options: &BackupOptions) -> BackupMetadata {
            Snapshotter::new(&self.store, &self.graph, &self.catalog)
                .create_backup(options)
                .unwrap()
        }

        fn restorer(&self) -> Restorer<'_> {
            Restorer::new(&self.store, &self.graph, &self.catalog)
        }

        fn conn(&self) -> Connection {
            self.store.connect().unwrap()
        }

        fn count(&self, table: &str) -> u64 {
            row_count(&self.conn(), table).unwrap()
        }

        /// Register hand-built artifact bytes as if a snapshot had produced them.
        fn register(&self, id: Ulid, tables: Vec<String>, bytes: &[u8]) {
            let meta = BackupMetadata {
                id,
                filename: BackupMetadata::artifact_filename(&id),
                size: bytes.len() as u64,
                checksum: sha256_hex(bytes),
                tables,
                is_verified: true,
                include_data: true,
                created_at: Utc::now(),
            };
            write_artifact(&self.catalog.artifact_path(&meta), bytes).unwrap();
            self.catalog.append(&meta).unwrap();
        }
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn full_restore_reproduces_every_table() {
        let fx = Fixture::new();
        let before = dump_all(&fx.conn(), &fx.graph).unwrap();
        let meta = fx.backup(&BackupOptions::full());

        let conn = fx.conn();
        clear_all(&conn, &fx.graph).unwrap();
        conn.execute(
            "INSERT INTO schools (id, name, created_at) VALUES (77, 'Interloper', 'now')",
            [],
        )
        .unwrap();
        drop(conn);

        let outcome = fx
            .restorer()
            .restore_from_backup(&meta.id, &RestoreOptions::default())
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.restored_tables, fx.graph.forward_order());
        assert_eq!(dump_all(&fx.conn(), &fx.graph).unwrap(), before);
    }

    #[test]
    fn tampered_artifact_is_rejected_before_any_change() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());

        let path = fx.catalog.artifact_path(&meta);
        let mut bytes = fs::read(&path).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        clear_all(&fx.conn(), &fx.graph).unwrap();
        let before = dump_all(&fx.conn(), &fx.graph).unwrap();

        let err = fx
            .restorer()
            .restore_from_backup(&meta.id, &RestoreOptions::default())
            .unwrap_err();

        assert!(matches!(err, BackupError::Corruption { .. }));
        let context = err.context();
        assert_eq!(context.backup_id, Some(meta.id));
        assert_eq!(context.phase, Some(RestorePhase::Validating));
        assert_eq!(dump_all(&fx.conn(), &fx.graph).unwrap(), before);
    }

    #[test]
    fn broken_structure_is_corruption_even_unvalidated() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());

        // Keep only the header line: its table list no longer matches the body.
        let path = fx.catalog.artifact_path(&meta);
        let text = fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap().to_string();
        fs::write(&path, format!("{}\n", header)).unwrap();

        let options = RestoreOptions {
            drop_existing: true,
            validate_before_restore: false,
        };
        let err = fx.restorer().restore_from_backup(&meta.id, &options).unwrap_err();
        assert!(matches!(err, BackupError::Corruption { .. }));
        assert_eq!(fx.count("schools"), 3);
    }

    #[test]
    fn missing_artifact_is_corruption() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());
        fs::remove_file(fx.catalog.artifact_path(&meta)).unwrap();

        let err = fx
            .restorer()
            .restore_from_backup(&meta.id, &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, BackupError::Corruption { .. }));
    }

    #[test]
    fn unknown_backup_is_not_found() {
        let fx = Fixture::new();
        let missing = Ulid::new();
        let err = fx
            .restorer()
            .restore_from_backup(&missing, &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(err, BackupError::NotFound(id) if id == missing));
    }

    #[test]
    fn drop_order_is_children_before_parents() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());
        let artifact = Artifact::read(&fx.catalog.artifact_path(&meta)).unwrap();
        let conn = fx.conn();

        let plan = plan_full(&conn, &artifact, &RestoreOptions::default()).unwrap();
        let live: BTreeSet<String> = list_tables(&conn).unwrap().into_iter().collect();

        assert_eq!(plan.drops, fx.graph.reverse_order());
        assert!(fx.graph.is_safe_drop_sequence(&plan.drops, &live));
        assert_eq!(plan.applies, fx.graph.forward_order());
    }

    #[test]
    fn drop_refused_while_live_children_outside_backup_reference_it() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full().with_tables(["schools"]));

        let err = fx
            .restorer()
            .restore_from_backup(&meta.id, &RestoreOptions::default())
            .unwrap_err();

        assert!(matches!(err, BackupError::Dependency { .. }));
        assert_eq!(err.context().phase, Some(RestorePhase::Preparing));
        assert_eq!(fx.count("schools"), 3);
    }

    #[test]
    fn failing_statement_rolls_back_drops_and_inserts() {
        let fx = Fixture::new();
        let before = dump_all(&fx.conn(), &fx.graph).unwrap();

        let conn = fx.conn();
        let tables = vec!["schools".to_string(), "contacts".to_string()];
        let id = Ulid::new();
        let mut writer = ArtifactWriter::new(id, Utc::now(), true, &tables).unwrap();
        let school: Vec<String> = ["1", "'Only'", "NULL", "NULL", "NULL", "NULL", "NULL", "NULL", "'2024-01-01'"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let orphan: Vec<String> = ["1", "999", "'Ghost'", "NULL", "NULL", "NULL", "0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        for (table, row) in tables.iter().zip([school, orphan]) {
            let columns = table_columns(&conn, table).unwrap();
            let create_sql = &fx.graph.table(table).unwrap().create_sql;
            writer.table(table, &columns, create_sql, &[]).unwrap();
            writer.row(table, &columns, &row).unwrap();
        }
        drop(conn);
        fx.register(id, tables, &writer.finish());

        // Only the artifact's tables are dropped; the other children still
        // reference schools, so clear them first to let the drop proceed.
        let conn = fx.conn();
        for table in ["interactions", "partnerships", "preferences"] {
            conn.execute(&format!("DELETE FROM {}", table), []).unwrap();
        }
        drop(conn);
        let cleared = dump_all(&fx.conn(), &fx.graph).unwrap();
        assert_ne!(cleared, before);

        let err = fx
            .restorer()
            .restore_from_backup(&id, &RestoreOptions::default())
            .unwrap_err();

        match &err {
            BackupError::Apply {
                statement, context, ..
            } => {
                // 2 drops, schools create + row, contacts create, then the orphan.
                assert_eq!(*statement, 6);
                assert_eq!(context.table.as_deref(), Some("contacts"));
                assert_eq!(context.phase, Some(RestorePhase::Applying));
            }
            other => panic!("expected apply error, got {:?}", other),
        }
        assert_eq!(dump_all(&fx.conn(), &fx.graph).unwrap(), cleared);
    }

    #[test]
    fn merge_into_mismatched_columns_is_validation_error() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());
        fx.conn()
            .execute_batch("ALTER TABLE preferences ADD COLUMN note TEXT;")
            .unwrap();

        let options = RestoreOptions {
            drop_existing: false,
            validate_before_restore: true,
        };
        let err = fx.restorer().restore_from_backup(&meta.id, &options).unwrap_err();

        assert!(matches!(err, BackupError::Validation { .. }));
        let context = err.context();
        assert_eq!(context.phase, Some(RestorePhase::Preparing));
        assert_eq!(context.table.as_deref(), Some("preferences"));
    }

    #[test]
    fn merge_conflict_rolls_back() {
        let fx = Fixture::new();
        let before = dump_all(&fx.conn(), &fx.graph).unwrap();
        let meta = fx.backup(&BackupOptions::full());

        let options = RestoreOptions {
            drop_existing: false,
            validate_before_restore: true,
        };
        let err = fx.restorer().restore_from_backup(&meta.id, &options).unwrap_err();

        assert!(matches!(err, BackupError::Apply { .. }));
        assert_eq!(dump_all(&fx.conn(), &fx.graph).unwrap(), before);
    }

    #[test]
    fn merge_into_empty_tables_succeeds() {
        let fx = Fixture::new();
        let before = dump_all(&fx.conn(), &fx.graph).unwrap();
        let meta = fx.backup(&BackupOptions::full());
        clear_all(&fx.conn(), &fx.graph).unwrap();

        let options = RestoreOptions {
            drop_existing: false,
            validate_before_restore: true,
        };
        fx.restorer().restore_from_backup(&meta.id, &options).unwrap();
        assert_eq!(dump_all(&fx.conn(), &fx.graph).unwrap(), before);
    }

    #[test]
    fn selective_restore_leaves_other_tables_alone() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());
        clear_all(&fx.conn(), &fx.graph).unwrap();

        let outcome = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["schools"]), &SelectiveRestoreOptions::default())
            .unwrap();

        assert_eq!(outcome.restored_tables, vec!["schools"]);
        assert_eq!(fx.count("schools"), 3);
        for table in ["contacts", "interactions", "partnerships", "preferences"] {
            assert_eq!(fx.count(table), 0, "{} should stay empty", table);
        }
    }

    #[test]
    fn reject_policy_refuses_children_without_parents() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());
        clear_all(&fx.conn(), &fx.graph).unwrap();

        let err = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["contacts"]), &SelectiveRestoreOptions::default())
            .unwrap_err();

        assert!(matches!(err, BackupError::Dependency { .. }));
        assert_eq!(err.context().table.as_deref(), Some("contacts"));
        assert_eq!(fx.count("contacts"), 0);
        assert_eq!(fx.count("schools"), 0);
    }

    #[test]
    fn reject_policy_accepts_children_when_parents_are_live() {
        let fx = Fixture::new();
        let contacts_before = dump_table(&fx.conn(), "contacts").unwrap();
        let meta = fx.backup(&BackupOptions::full());
        fx.conn().execute("DELETE FROM contacts", []).unwrap();

        let outcome = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["contacts"]), &SelectiveRestoreOptions::default())
            .unwrap();

        assert_eq!(outcome.restored_tables, vec!["contacts"]);
        assert_eq!(dump_table(&fx.conn(), "contacts").unwrap(), contacts_before);
    }

    #[test]
    fn include_parents_restores_the_parent_closure() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());
        clear_all(&fx.conn(), &fx.graph).unwrap();

        let options = SelectiveRestoreOptions {
            parent_policy: ParentPolicy::IncludeParents,
            ..SelectiveRestoreOptions::default()
        };
        let outcome = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["contacts"]), &options)
            .unwrap();

        assert_eq!(outcome.restored_tables, vec!["schools", "contacts"]);
        assert_eq!(fx.count("schools"), 3);
        assert_eq!(fx.count("contacts"), 6);
        assert_eq!(fx.count("interactions"), 0);
    }

    #[test]
    fn include_parents_needs_parents_in_backup_or_live() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full().with_tables(["contacts"]));
        clear_all(&fx.conn(), &fx.graph).unwrap();

        let options = SelectiveRestoreOptions {
            parent_policy: ParentPolicy::IncludeParents,
            ..SelectiveRestoreOptions::default()
        };
        let err = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["contacts"]), &options)
            .unwrap_err();
        assert!(matches!(err, BackupError::Dependency { .. }));
    }

    #[test]
    fn include_parents_leaves_populated_parents_alone() {
        let fx = Fixture::new();
        let schools_before = dump_table(&fx.conn(), "schools").unwrap();
        let contacts_before = dump_table(&fx.conn(), "contacts").unwrap();
        let meta = fx.backup(&BackupOptions::full());
        fx.conn().execute("DELETE FROM contacts", []).unwrap();

        let options = SelectiveRestoreOptions {
            parent_policy: ParentPolicy::IncludeParents,
            ..SelectiveRestoreOptions::default()
        };
        let outcome = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["contacts"]), &options)
            .unwrap();

        assert_eq!(outcome.restored_tables, vec!["contacts"]);
        assert_eq!(dump_table(&fx.conn(), "contacts").unwrap(), contacts_before);
        assert_eq!(dump_table(&fx.conn(), "schools").unwrap(), schools_before);

        // Clearing touches only the requested table when the parent is live.
        fx.conn()
            .execute(
                "INSERT INTO contacts (id, school_id, name) VALUES (500, 1, 'Added later')",
                [],
            )
            .unwrap();
        let options = SelectiveRestoreOptions {
            clear_existing: true,
            ..options
        };
        let outcome = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["contacts"]), &options)
            .unwrap();

        assert_eq!(outcome.restored_tables, vec!["contacts"]);
        assert_eq!(dump_table(&fx.conn(), "contacts").unwrap(), contacts_before);
        assert_eq!(fx.count("interactions"), 6);
    }

    #[test]
    fn drop_restore_brings_back_indexes_and_triggers() {
        let fx = Fixture::new();
        fx.conn()
            .execute_batch(
                "CREATE INDEX idx_contacts_email ON contacts(email);
                 CREATE TRIGGER schools_renamed AFTER UPDATE OF name ON schools
                 BEGIN UPDATE schools SET notes = 'renamed' WHERE id = NEW.id; END;",
            )
            .unwrap();
        let objects = |conn: &Connection| -> Vec<(String, String, String)> {
            let mut stmt = conn
                .prepare(
                    "SELECT type, name, tbl_name FROM sqlite_master
                     WHERE type IN ('index', 'trigger') ORDER BY name",
                )
                .unwrap();
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            rows
        };
        let before = objects(&fx.conn());
        let rows_before = dump_all(&fx.conn(), &fx.graph).unwrap();
        let meta = fx.backup(&BackupOptions::full());

        fx.restorer()
            .restore_from_backup(&meta.id, &RestoreOptions::default())
            .unwrap();

        let conn = fx.conn();
        assert_eq!(objects(&conn), before);
        assert!(before.iter().any(|(_, name, _)| name == "idx_contacts_email"));
        // Replayed rows did not fire the trigger.
        assert_eq!(dump_all(&conn, &fx.graph).unwrap(), rows_before);

        conn.execute("UPDATE schools SET name = 'New Name' WHERE id = 1", [])
            .unwrap();
        let notes: Option<String> = conn
            .query_row("SELECT notes FROM schools WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(notes.as_deref(), Some("renamed"));
    }

    #[test]
    fn drop_order_is_checked_against_live_foreign_keys() {
        let fx = Fixture::new();
        let before = dump_all(&fx.conn(), &fx.graph).unwrap();

        // Sections in the wrong order: dropping them in reverse would remove
        // schools while contacts still points at it.
        let conn = fx.conn();
        let tables = vec!["contacts".to_string(), "schools".to_string()];
        let id = Ulid::new();
        let mut writer = ArtifactWriter::new(id, Utc::now(), false, &tables).unwrap();
        for table in &tables {
            let columns = table_columns(&conn, table).unwrap();
            let create_sql = &fx.graph.table(table).unwrap().create_sql;
            writer.table(table, &columns, create_sql, &[]).unwrap();
        }
        drop(conn);
        fx.register(id, tables, &writer.finish());

        let err = fx
            .restorer()
            .restore_from_backup(&id, &RestoreOptions::default())
            .unwrap_err();

        assert!(matches!(err, BackupError::Dependency { .. }));
        assert_eq!(err.context().phase, Some(RestorePhase::Preparing));
        assert_eq!(dump_all(&fx.conn(), &fx.graph).unwrap(), before);
    }

    #[test]
    fn selective_request_must_name_known_tables_in_the_backup() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full().with_tables(["schools", "contacts"]));
        let restorer = fx.restorer();
        let options = SelectiveRestoreOptions::default();

        let unknown = restorer
            .restore_selective_tables(&meta.id, &set(&["students"]), &options)
            .unwrap_err();
        assert!(matches!(unknown, BackupError::Validation { .. }));

        let absent = restorer
            .restore_selective_tables(&meta.id, &set(&["interactions"]), &options)
            .unwrap_err();
        assert!(matches!(absent, BackupError::Validation { .. }));
        assert_eq!(absent.context().phase, Some(RestorePhase::Validating));

        let empty = restorer
            .restore_selective_tables(&meta.id, &BTreeSet::new(), &options)
            .unwrap_err();
        assert!(matches!(empty, BackupError::Validation { .. }));
    }

    #[test]
    fn clear_existing_replaces_rows() {
        let fx = Fixture::new();
        let contacts_before = dump_table(&fx.conn(), "contacts").unwrap();
        let meta = fx.backup(&BackupOptions::full());
        fx.conn()
            .execute(
                "INSERT INTO contacts (id, school_id, name) VALUES (500, 1, 'Added later')",
                [],
            )
            .unwrap();

        let options = SelectiveRestoreOptions {
            clear_existing: true,
            ..SelectiveRestoreOptions::default()
        };
        fx.restorer()
            .restore_selective_tables(&meta.id, &set(&["contacts"]), &options)
            .unwrap();

        assert_eq!(dump_table(&fx.conn(), "contacts").unwrap(), contacts_before);
    }

    #[test]
    fn clearing_a_referenced_parent_is_refused() {
        let fx = Fixture::new();
        let meta = fx.backup(&BackupOptions::full());

        let options = SelectiveRestoreOptions {
            clear_existing: true,
            ..SelectiveRestoreOptions::default()
        };
        let err = fx
            .restorer()
            .restore_selective_tables(&meta.id, &set(&["schools"]), &options)
            .unwrap_err();

        assert!(matches!(err, BackupError::Dependency { .. }));
        assert_eq!(fx.count("schools"), 3);
    }
}
