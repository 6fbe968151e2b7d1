// ABOUTME: Test utilities for satchel-store: seed CRM rows, clear tables, and dump table contents.
// ABOUTME: Used by unit tests here and by the workspace's end-to-end tests.

use rusqlite::types::Value;
use rusqlite::{Connection, params};
use satchel_core::SchemaGraph;

use crate::datastore::quote_ident;

/// How much CRM data to seed. Every school gets the same number of dependent
/// rows in each child table.
#[derive(Debug, Clone, Copy)]
pub struct CrmSeed {
    pub schools: usize,
    pub contacts_per_school: usize,
    pub interactions_per_school: usize,
    pub partnerships_per_school: usize,
    pub preferences_per_school: usize,
}

impl CrmSeed {
    /// A few rows in every table.
    pub fn small() -> Self {
        Self {
            schools: 3,
            contacts_per_school: 2,
            interactions_per_school: 2,
            partnerships_per_school: 1,
            preferences_per_school: 2,
        }
    }

    /// Schools and contacts only.
    pub fn schools_and_contacts(schools: usize, contacts_per_school: usize) -> Self {
        Self {
            schools,
            contacts_per_school,
            interactions_per_school: 0,
            partnerships_per_school: 0,
            preferences_per_school: 0,
        }
    }
}

/// Insert seed rows. Text values deliberately include quotes, semicolons,
/// newlines and NULLs so round trips exercise literal escaping.
pub fn seed_crm(conn: &Connection, seed: &CrmSeed) -> Result<(), rusqlite::Error> {
    let mut contact_id = 1i64;
    let mut interaction_id = 1i64;
    let mut partnership_id = 1i64;
    let mut preference_id = 1i64;

    for s in 1..=seed.schools as i64 {
        conn.execute(
            "INSERT INTO schools (id, name, district, city, state, enrollment, rating, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                s,
                format!("O'Brien Academy #{}", s),
                if s % 2 == 0 { None } else { Some(format!("District {}", s)) },
                "Springfield",
                "IL",
                400 + s * 25,
                3.5 + s as f64 / 10.0,
                format!("line one; DROP TABLE schools;\nline two -- {}", s),
                "2024-01-15T09:30:00Z",
            ],
        )?;

        for c in 0..seed.contacts_per_school {
            conn.execute(
                "INSERT INTO contacts (id, school_id, name, role, email, phone, is_primary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    contact_id,
                    s,
                    format!("Contact \"{}\" of {}", c, s),
                    "Counselor",
                    format!("contact{}@school{}.edu", contact_id, s),
                    Option::<String>::None,
                    c == 0,
                ],
            )?;
            contact_id += 1;
        }

        for _ in 0..seed.interactions_per_school {
            conn.execute(
                "INSERT INTO interactions (id, school_id, kind, summary, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    interaction_id,
                    s,
                    "visit",
                    "Met with the principal; follow up in May",
                    "2024-03-01T14:00:00Z",
                ],
            )?;
            interaction_id += 1;
        }

        for _ in 0..seed.partnerships_per_school {
            conn.execute(
                "INSERT INTO partnerships (id, school_id, program, status, started_on, ended_on)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    partnership_id,
                    s,
                    "Dual enrollment",
                    "active",
                    "2023-09-01",
                    Option::<String>::None,
                ],
            )?;
            partnership_id += 1;
        }

        for p in 0..seed.preferences_per_school {
            conn.execute(
                "INSERT INTO preferences (id, school_id, key, value) VALUES (?1, ?2, ?3, ?4)",
                params![preference_id, s, format!("pref_{}", p), "yes"],
            )?;
            preference_id += 1;
        }
    }

    Ok(())
}

/// Delete every row of every table, children first.
pub fn clear_all(conn: &Connection, graph: &SchemaGraph) -> Result<(), rusqlite::Error> {
    for table in graph.reverse_order() {
        conn.execute(&format!("DELETE FROM {}", quote_ident(&table)), [])?;
    }
    Ok(())
}

/// Every row of a table, all columns, ordered by rowid.
pub fn dump_table(conn: &Connection, table: &str) -> Result<Vec<Vec<Value>>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} ORDER BY rowid",
        quote_ident(table)
    ))?;
    let width = stmt.column_count();

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, Value>(i)?);
        }
        out.push(values);
    }
    Ok(out)
}

/// Contents of every table in the graph, in forward order.
pub fn dump_all(
    conn: &Connection,
    graph: &SchemaGraph,
) -> Result<Vec<(String, Vec<Vec<Value>>)>, rusqlite::Error> {
    let mut out = Vec::new();
    for table in graph.forward_order() {
        let rows = dump_table(conn, &table)?;
        out.push((table, rows));
    }
    Ok(out)
}
