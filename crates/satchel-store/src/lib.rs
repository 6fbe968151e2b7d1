// ABOUTME: Persistence layer for satchel, producing and replaying backups of the CRM's SQLite store.
// ABOUTME: Provides the artifact codec, catalogs, snapshotter, verifier, restorer, and the BackupEngine facade.

pub mod artifact;
pub mod catalog;
pub mod datastore;
pub mod engine;
pub mod error;
pub mod restore;
pub mod snapshot;
pub mod testing;
pub mod verify;

pub use artifact::{Artifact, ArtifactError, ArtifactWriter};
pub use catalog::{Catalog, CatalogError, JsonlCatalog, SqliteCatalog};
pub use datastore::{Datastore, IntrospectError, introspect};
pub use engine::{AuditEntry, AuditReport, AuditStatus, BackupEngine, CatalogKind, EngineConfig};
pub use error::{BackupError, ErrorContext};
pub use restore::{RestorePlan, Restorer};
pub use snapshot::Snapshotter;
pub use verify::{VerificationReport, inspect, verify};
