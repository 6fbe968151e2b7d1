// ABOUTME: Table definitions for the school-recruitment CRM datastore.
// ABOUTME: Schools are the single parent; contacts, interactions, partnerships and preferences reference them.

use crate::schema::{SchemaError, SchemaGraph, TableDef};

pub const SCHOOLS: &str = "schools";
pub const CONTACTS: &str = "contacts";
pub const INTERACTIONS: &str = "interactions";
pub const PARTNERSHIPS: &str = "partnerships";
pub const PREFERENCES: &str = "preferences";

/// The CRM's table definitions in declaration order.
pub fn crm_tables() -> Vec<TableDef> {
    vec![
        TableDef::new(
            SCHOOLS,
            &[],
            "CREATE TABLE IF NOT EXISTS schools (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                district TEXT,
                city TEXT,
                state TEXT,
                enrollment INTEGER,
                rating REAL,
                notes TEXT,
                created_at TEXT NOT NULL
            )",
        ),
        TableDef::new(
            CONTACTS,
            &[SCHOOLS],
            "CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY,
                school_id INTEGER NOT NULL REFERENCES schools(id),
                name TEXT NOT NULL,
                role TEXT,
                email TEXT,
                phone TEXT,
                is_primary INTEGER NOT NULL DEFAULT 0
            )",
        ),
        TableDef::new(
            INTERACTIONS,
            &[SCHOOLS],
            "CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY,
                school_id INTEGER NOT NULL REFERENCES schools(id),
                kind TEXT NOT NULL,
                summary TEXT,
                occurred_at TEXT NOT NULL
            )",
        ),
        TableDef::new(
            PARTNERSHIPS,
            &[SCHOOLS],
            "CREATE TABLE IF NOT EXISTS partnerships (
                id INTEGER PRIMARY KEY,
                school_id INTEGER NOT NULL REFERENCES schools(id),
                program TEXT NOT NULL,
                status TEXT NOT NULL,
                started_on TEXT,
                ended_on TEXT
            )",
        ),
        TableDef::new(
            PREFERENCES,
            &[SCHOOLS],
            "CREATE TABLE IF NOT EXISTS preferences (
                id INTEGER PRIMARY KEY,
                school_id INTEGER NOT NULL REFERENCES schools(id),
                key TEXT NOT NULL,
                value TEXT,
                UNIQUE (school_id, key)
            )",
        ),
    ]
}

/// The CRM dependency graph. The table list is static and known to be
/// acyclic, but construction still goes through validation.
pub fn crm_schema() -> Result<SchemaGraph, SchemaError> {
    SchemaGraph::new(crm_tables())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schools_come_first_and_last() {
        let graph = crm_schema().unwrap();
        assert_eq!(
            graph.forward_order(),
            vec![SCHOOLS, CONTACTS, INTERACTIONS, PARTNERSHIPS, PREFERENCES]
        );
        assert_eq!(
            graph.reverse_order(),
            vec![PREFERENCES, PARTNERSHIPS, INTERACTIONS, CONTACTS, SCHOOLS]
        );
    }

    #[test]
    fn every_child_points_at_schools() {
        let graph = crm_schema().unwrap();
        for child in [CONTACTS, INTERACTIONS, PARTNERSHIPS, PREFERENCES] {
            assert_eq!(graph.parents_of(child), &[SCHOOLS.to_string()]);
        }
        assert!(graph.parents_of(SCHOOLS).is_empty());
    }
}
