// ABOUTME: JSON Lines codec for backup artifacts: a header, then per table its structure and row statements.
// ABOUTME: Row values are rendered as escaped SQL literals; JSON string framing keeps every statement on one line.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::datastore::quote_ident;

/// Current artifact layout version, written into every header.
pub const ARTIFACT_FORMAT: u32 = 1;

/// Errors that can occur while reading or decoding an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed artifact: {0}")]
    Malformed(String),
}

/// One line of an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactRecord {
    Header {
        format: u32,
        backup_id: Ulid,
        created_at: DateTime<Utc>,
        include_data: bool,
        tables: Vec<String>,
    },
    Table {
        name: String,
        columns: Vec<String>,
        create_sql: String,
        /// Index and trigger definitions, replayed after the rows.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attached_sql: Vec<String>,
    },
    Row {
        table: String,
        sql: String,
    },
}

/// Structure and data of one table inside a decoded artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSection {
    pub name: String,
    pub columns: Vec<String>,
    pub create_sql: String,
    pub attached_sql: Vec<String>,
    pub rows: Vec<String>,
}

/// A fully decoded artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub backup_id: Ulid,
    pub created_at: DateTime<Utc>,
    pub include_data: bool,
    pub sections: Vec<TableSection>,
}

impl Artifact {
    /// Table names in the order they appear, which is dependency order.
    pub fn tables(&self) -> Vec<String> {
        self.sections.iter().map(|s| s.name.clone()).collect()
    }

    pub fn section(&self, name: &str) -> Option<&TableSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn read(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Decode artifact bytes. Structural problems (missing header, rows
    /// outside a table, statements that do not insert into their own table,
    /// attached statements that are not index or trigger definitions,
    /// header/section mismatch) are reported as `Malformed`.
    pub fn parse(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ArtifactError::Malformed(format!("not valid utf-8: {}", e)))?;

        let mut lines = text.split_terminator('\n').enumerate();

        let Some((_, first)) = lines.next() else {
            return Err(ArtifactError::Malformed("empty artifact".to_string()));
        };
        let (backup_id, created_at, include_data, declared) = match serde_json::from_str::<ArtifactRecord>(first)? {
            ArtifactRecord::Header {
                format,
                backup_id,
                created_at,
                include_data,
                tables,
            } => {
                if format != ARTIFACT_FORMAT {
                    return Err(ArtifactError::Malformed(format!(
                        "unsupported artifact format {}",
                        format
                    )));
                }
                (backup_id, created_at, include_data, tables)
            }
            _ => {
                return Err(ArtifactError::Malformed(
                    "first line is not a header".to_string(),
                ));
            }
        };

        let mut sections: Vec<TableSection> = Vec::new();
        for (index, line) in lines {
            let line_no = index + 1;
            match serde_json::from_str::<ArtifactRecord>(line)? {
                ArtifactRecord::Header { .. } => {
                    return Err(ArtifactError::Malformed(format!(
                        "line {}: second header",
                        line_no
                    )));
                }
                ArtifactRecord::Table {
                    name,
                    columns,
                    create_sql,
                    attached_sql,
                } => {
                    if sections.iter().any(|s| s.name == name) {
                        return Err(ArtifactError::Malformed(format!(
                            "line {}: table {} appears twice",
                            line_no, name
                        )));
                    }
                    if let Some(bad) = attached_sql.iter().find(|sql| !is_attached_definition(sql)) {
                        return Err(ArtifactError::Malformed(format!(
                            "line {}: {:?} is not an index or trigger definition",
                            line_no, bad
                        )));
                    }
                    sections.push(TableSection {
                        name,
                        columns,
                        create_sql,
                        attached_sql,
                        rows: Vec::new(),
                    });
                }
                ArtifactRecord::Row { table, sql } => {
                    let Some(section) = sections.last_mut() else {
                        return Err(ArtifactError::Malformed(format!(
                            "line {}: row before any table",
                            line_no
                        )));
                    };
                    if section.name != table {
                        return Err(ArtifactError::Malformed(format!(
                            "line {}: row for {} inside section {}",
                            line_no, table, section.name
                        )));
                    }
                    if !sql.starts_with(&insert_prefix(&table)) {
                        return Err(ArtifactError::Malformed(format!(
                            "line {}: statement does not insert into {}",
                            line_no, table
                        )));
                    }
                    section.rows.push(sql);
                }
            }
        }

        let found: Vec<String> = sections.iter().map(|s| s.name.clone()).collect();
        if found != declared {
            return Err(ArtifactError::Malformed(format!(
                "header lists {:?} but artifact contains {:?}",
                declared, found
            )));
        }

        Ok(Self {
            backup_id,
            created_at,
            include_data,
            sections,
        })
    }
}

/// Builds artifact bytes in memory, one JSON record per line. Rows may only
/// follow the table record they belong to.
pub struct ArtifactWriter {
    buf: Vec<u8>,
    current: Option<String>,
}

impl ArtifactWriter {
    pub fn new(
        backup_id: Ulid,
        created_at: DateTime<Utc>,
        include_data: bool,
        tables: &[String],
    ) -> Result<Self, ArtifactError> {
        let mut writer = Self {
            buf: Vec::new(),
            current: None,
        };
        writer.push(&ArtifactRecord::Header {
            format: ARTIFACT_FORMAT,
            backup_id,
            created_at,
            include_data,
            tables: tables.to_vec(),
        })?;
        Ok(writer)
    }

    pub fn table(
        &mut self,
        name: &str,
        columns: &[String],
        create_sql: &str,
        attached_sql: &[String],
    ) -> Result<(), ArtifactError> {
        self.push(&ArtifactRecord::Table {
            name: name.to_string(),
            columns: columns.to_vec(),
            create_sql: ensure_if_not_exists(create_sql),
            attached_sql: attached_sql.iter().map(|sql| ensure_if_not_exists(sql)).collect(),
        })?;
        self.current = Some(name.to_string());
        Ok(())
    }

    /// Append one INSERT statement built from already-rendered SQL literals.
    pub fn row(
        &mut self,
        table: &str,
        columns: &[String],
        literals: &[String],
    ) -> Result<(), ArtifactError> {
        if self.current.as_deref() != Some(table) {
            return Err(ArtifactError::Malformed(format!(
                "row for {} written outside its table section (current: {:?})",
                table, self.current
            )));
        }
        self.push(&ArtifactRecord::Row {
            table: table.to_string(),
            sql: insert_statement(table, columns, literals),
        })
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn push(&mut self, record: &ArtifactRecord) -> Result<(), ArtifactError> {
        serde_json::to_writer(&mut self.buf, record)?;
        self.buf.push(b'\n');
        Ok(())
    }
}

fn insert_prefix(table: &str) -> String {
    format!("INSERT INTO {} ", quote_ident(table))
}

pub fn insert_statement(table: &str, columns: &[String], literals: &[String]) -> String {
    let columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "{}({}) VALUES ({})",
        insert_prefix(table),
        columns.join(", "),
        literals.join(", ")
    )
}

/// Render a column value as a SQL literal that reproduces it exactly.
/// Absent values become `NULL`, never an empty string.
pub fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => real_literal(f),
        ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if !text.contains('\0') => text_literal(text),
            _ => format!("CAST(X'{}' AS TEXT)", hex::encode_upper(bytes)),
        },
        ValueRef::Blob(bytes) => format!("X'{}'", hex::encode_upper(bytes)),
    }
}

/// Single-quote a string, doubling embedded quotes.
pub fn text_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn real_literal(f: f64) -> String {
    if f.is_nan() {
        "NULL".to_string()
    } else if f.is_infinite() {
        let literal = if f > 0.0 { "9e999" } else { "-9e999" };
        literal.to_string()
    } else {
        // Debug keeps a decimal point or exponent, so SQLite reads it back as REAL.
        format!("{:?}", f)
    }
}

const ATTACHED_KEYWORDS: [&str; 3] = ["CREATE INDEX", "CREATE UNIQUE INDEX", "CREATE TRIGGER"];

fn is_attached_definition(sql: &str) -> bool {
    let upper = sql.trim().to_ascii_uppercase();
    ATTACHED_KEYWORDS.iter().any(|k| upper.starts_with(k))
}

/// Rewrite a stored `CREATE TABLE`, `CREATE [UNIQUE] INDEX` or
/// `CREATE TRIGGER` so replaying it onto a store that already has the object
/// is a no-op.
pub fn ensure_if_not_exists(create_sql: &str) -> String {
    let trimmed = create_sql.trim();
    let upper = trimmed.to_ascii_uppercase();
    for keyword in ["CREATE TABLE"].iter().chain(ATTACHED_KEYWORDS.iter()) {
        if let Some(rest) = upper.strip_prefix(keyword) {
            if rest.trim_start().starts_with("IF NOT EXISTS") {
                break;
            }
            return format!("{} IF NOT EXISTS{}", keyword, &trimmed[keyword.len()..]);
        }
    }
    trimmed.to_string()
}
