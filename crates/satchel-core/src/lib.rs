// ABOUTME: Core library for satchel, the CRM datastore backup and recovery engine.
// ABOUTME: Defines the schema dependency graph, backup metadata, and restore state machine.

pub mod crm;
pub mod metadata;
pub mod phase;
pub mod schema;

pub use crm::{crm_schema, crm_tables};
pub use metadata::{
    BackupMetadata, BackupOptions, ParentPolicy, RestoreOptions, RestoreOutcome,
    SelectiveRestoreOptions,
};
pub use phase::{RestorePhase, TransitionError};
pub use schema::{SchemaError, SchemaGraph, TableDef};
