// ABOUTME: Handle to the live SQLite datastore plus the table introspection the engine relies on.
// ABOUTME: Opens per-operation connections in WAL mode with foreign keys enforced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use satchel_core::{SchemaError, SchemaGraph, TableDef};
use thiserror::Error;

/// Errors that can occur while deriving a schema graph from a live database.
#[derive(Debug, Error)]
pub enum IntrospectError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

/// The live relational store. Holds only the path: every operation opens its
/// own connection so concurrent backups read committed state independently.
#[derive(Debug, Clone)]
pub struct Datastore {
    path: PathBuf,
}

impl Datastore {
    /// Open or create the database file and switch it to WAL mode.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh connection with foreign keys enforced.
    pub fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Create every table of the graph, parents first, in one transaction.
    pub fn install_schema(&self, graph: &SchemaGraph) -> Result<(), rusqlite::Error> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for name in graph.forward_order() {
            if let Some(table) = graph.table(&name) {
                tx.execute_batch(&table.create_sql)?;
            }
        }
        tx.commit()
    }
}

/// Quote an identifier for SQL, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// The stored CREATE statement for a table, if the table exists.
pub fn table_sql(conn: &Connection, table: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )
    .optional()
}

/// Index and trigger definitions attached to a table, in creation order.
/// Indexes SQLite creates for UNIQUE and PRIMARY KEY constraints have no SQL
/// and are left out; the table's own definition recreates them.
pub fn attached_sql(conn: &Connection, table: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master
         WHERE type IN ('index', 'trigger') AND tbl_name = ?1 AND sql IS NOT NULL
         ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;

    let mut statements = Vec::new();
    for row in rows {
        statements.push(row?);
    }
    Ok(statements)
}

/// Column names in declaration order. Empty for a missing table.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

pub fn row_count(conn: &Connection, table: &str) -> Result<u64, rusqlite::Error> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Names of every user table, in creation order.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut tables = Vec::new();
    for row in rows {
        tables.push(row?);
    }
    Ok(tables)
}

/// Tables the given table's foreign keys reference, as declared live,
/// without duplicates.
pub fn foreign_key_parents(conn: &Connection, table: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT \"table\" FROM pragma_foreign_key_list(?1)")?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;

    let mut parents: Vec<String> = Vec::new();
    for row in rows {
        let parent = row?;
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }
    Ok(parents)
}

/// Derive the dependency graph from the live database: one table per user
/// table, parents taken from its foreign-key list.
pub fn introspect(conn: &Connection) -> Result<SchemaGraph, IntrospectError> {
    let mut defs = Vec::new();
    for name in list_tables(conn)? {
        let create_sql = table_sql(conn, &name)?.unwrap_or_default();
        let parents = foreign_key_parents(conn, &name)?;
        defs.push(TableDef {
            name,
            parents,
            create_sql,
        });
    }

    Ok(SchemaGraph::new(defs)?)
}
