// ABOUTME: Explicit foreign-key dependency graph over the datastore's tables.
// ABOUTME: Derives forward (parents first) and reverse (children first) orders from one source of truth.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when building or querying a schema graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate table in schema: {0}")]
    DuplicateTable(String),

    #[error("table {table} references unknown parent {parent}")]
    UnknownParent { table: String, parent: String },

    #[error("foreign-key cycle involving tables: {0:?}")]
    Cycle(Vec<String>),

    #[error("unknown table: {0}")]
    UnknownTable(String),
}

/// One table of the graph: its name, the tables its foreign keys point at,
/// and the DDL used to create it in a fresh store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub parents: Vec<String>,
    pub create_sql: String,
}

impl TableDef {
    pub fn new(name: &str, parents: &[&str], create_sql: &str) -> Self {
        Self {
            name: name.to_string(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
            create_sql: create_sql.to_string(),
        }
    }
}

/// A validated, acyclic dependency graph. The topological order is computed
/// once at construction; ties are broken by declaration order so the result
/// is deterministic.
#[derive(Debug, Clone)]
pub struct SchemaGraph {
    tables: Vec<TableDef>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

impl SchemaGraph {
    /// Build a graph from `(table, parents)` definitions. Self-references are
    /// ignored for ordering purposes since a table cannot precede itself.
    pub fn new(tables: Vec<TableDef>) -> Result<Self, SchemaError> {
        let mut index = HashMap::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            if index.insert(table.name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
        }

        for table in &tables {
            for parent in &table.parents {
                if !index.contains_key(parent) {
                    return Err(SchemaError::UnknownParent {
                        table: table.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm, always picking the earliest-declared ready table.
        let mut pending: Vec<usize> = tables
            .iter()
            .map(|t| t.parents.iter().filter(|p| **p != t.name).count())
            .collect();
        let mut placed = vec![false; tables.len()];
        let mut order = Vec::with_capacity(tables.len());

        while order.len() < tables.len() {
            let next = (0..tables.len()).find(|&i| !placed[i] && pending[i] == 0);
            let Some(next) = next else {
                let stuck = (0..tables.len())
                    .filter(|&i| !placed[i])
                    .map(|i| tables[i].name.clone())
                    .collect();
                return Err(SchemaError::Cycle(stuck));
            };

            placed[next] = true;
            order.push(next);
            let name = &tables[next].name;
            for (i, table) in tables.iter().enumerate() {
                if !placed[i] && table.name != *name {
                    pending[i] -= table.parents.iter().filter(|p| *p == name).count();
                }
            }
        }

        Ok(Self {
            tables,
            index,
            order,
        })
    }

    /// All table definitions in declaration order.
    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.index.get(name).map(|&i| &self.tables[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct parents of a table. Unknown tables have none.
    pub fn parents_of(&self, name: &str) -> &[String] {
        self.table(name).map(|t| t.parents.as_slice()).unwrap_or(&[])
    }

    /// Every table, parents before children.
    pub fn forward_order(&self) -> Vec<String> {
        self.order
            .iter()
            .map(|&i| self.tables[i].name.clone())
            .collect()
    }

    /// Every table, children before parents. Always the exact reverse of
    /// `forward_order`.
    pub fn reverse_order(&self) -> Vec<String> {
        let mut order = self.forward_order();
        order.reverse();
        order
    }

    /// The given tables in forward order. Names outside the graph are dropped.
    pub fn order_subset<'a, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let wanted: BTreeSet<&str> = names.into_iter().map(String::as_str).collect();
        self.forward_order()
            .into_iter()
            .filter(|name| wanted.contains(name.as_str()))
            .collect()
    }

    /// The given tables plus all of their transitive parents.
    pub fn parent_closure<'a, I>(&self, names: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut closure = BTreeSet::new();
        let mut stack: Vec<String> = names.into_iter().cloned().collect();
        while let Some(name) = stack.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            for parent in self.parents_of(&name) {
                if !closure.contains(parent) {
                    stack.push(parent.clone());
                }
            }
        }
        closure
    }

    /// Reject any name the graph does not know about. Returns the first
    /// unknown name encountered, in iteration order.
    pub fn validate_tables<'a, I>(&self, names: I) -> Result<(), SchemaError>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for name in names {
            if !self.contains(name) {
                return Err(SchemaError::UnknownTable(name.clone()));
            }
        }
        Ok(())
    }

    /// Check that dropping tables in the given sequence never removes a
    /// parent while a child that references it is still present. `remaining`
    /// is the set of tables that exist before the first drop.
    pub fn is_safe_drop_sequence(&self, sequence: &[String], remaining: &BTreeSet<String>) -> bool {
        let mut remaining = remaining.clone();
        for table in sequence {
            let blocked = remaining.iter().any(|other| {
                other != table && self.parents_of(other).iter().any(|p| p == table)
            });
            if blocked {
                return false;
            }
            remaining.remove(table);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn diamond() -> SchemaGraph {
        SchemaGraph::new(vec![
            TableDef::new("leaf", &["left", "right"], ""),
            TableDef::new("left", &["root"], ""),
            TableDef::new("right", &["root"], ""),
            TableDef::new("root", &[], ""),
        ])
        .unwrap()
    }

    #[test]
    fn forward_order_puts_parents_first() {
        let graph = diamond();
        assert_eq!(graph.forward_order(), names(&["root", "left", "right", "leaf"]));
    }

    #[test]
    fn reverse_order_is_mirror_of_forward() {
        let graph = diamond();
        let mut forward = graph.forward_order();
        forward.reverse();
        assert_eq!(graph.reverse_order(), forward);
    }

    #[test]
    fn rejects_unknown_parent() {
        let err = SchemaGraph::new(vec![TableDef::new("child", &["ghost"], "")]).unwrap_err();
        assert_eq!(
            err,
            SchemaError::UnknownParent {
                table: "child".to_string(),
                parent: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn rejects_duplicate_table() {
        let err = SchemaGraph::new(vec![
            TableDef::new("a", &[], ""),
            TableDef::new("a", &[], ""),
        ])
        .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateTable("a".to_string()));
    }

    #[test]
    fn rejects_cycle() {
        let err = SchemaGraph::new(vec![
            TableDef::new("a", &["b"], ""),
            TableDef::new("b", &["a"], ""),
        ])
        .unwrap_err();
        assert!(matches!(err, SchemaError::Cycle(ref stuck) if stuck.len() == 2));
    }

    #[test]
    fn self_reference_does_not_block_ordering() {
        let graph = SchemaGraph::new(vec![TableDef::new("tree", &["tree"], "")]).unwrap();
        assert_eq!(graph.forward_order(), names(&["tree"]));
    }

    #[test]
    fn parent_closure_is_transitive() {
        let graph = diamond();
        let closure = graph.parent_closure(&names(&["leaf"]));
        let expected: BTreeSet<String> = names(&["leaf", "left", "right", "root"]).into_iter().collect();
        assert_eq!(closure, expected);
    }

    #[test]
    fn order_subset_keeps_dependency_order() {
        let graph = diamond();
        let subset = graph.order_subset(&names(&["leaf", "root"]));
        assert_eq!(subset, names(&["root", "leaf"]));
    }

    #[test]
    fn validate_tables_names_the_unknown_one() {
        let graph = diamond();
        let err = graph.validate_tables(&names(&["root", "nope"])).unwrap_err();
        assert_eq!(err, SchemaError::UnknownTable("nope".to_string()));
    }

    #[test]
    fn drop_sequence_check_detects_parent_first() {
        let graph = diamond();
        let all: BTreeSet<String> = graph.forward_order().into_iter().collect();
        assert!(graph.is_safe_drop_sequence(&graph.reverse_order(), &all));
        assert!(!graph.is_safe_drop_sequence(&graph.forward_order(), &all));
    }
}
