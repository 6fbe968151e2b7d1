// ABOUTME: Error taxonomy surfaced by the backup engine to its callers.
// ABOUTME: Every variant carries the backup id, restore phase, and table being processed when known.

use std::fmt;

use satchel_core::{RestorePhase, SchemaError, TransitionError};
use thiserror::Error;
use ulid::Ulid;

use crate::artifact::ArtifactError;
use crate::catalog::CatalogError;
use crate::datastore::IntrospectError;

/// Where an error happened: which backup, which restore phase, which table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub backup_id: Option<Ulid>,
    pub phase: Option<RestorePhase>,
    pub table: Option<String>,
}

impl ErrorContext {
    pub fn backup(id: Ulid) -> Self {
        Self {
            backup_id: Some(id),
            ..Self::default()
        }
    }

    pub fn in_phase(mut self, phase: RestorePhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(id) = &self.backup_id {
            parts.push(format!("backup={}", id));
        }
        if let Some(phase) = &self.phase {
            parts.push(format!("phase={}", phase));
        }
        if let Some(table) = &self.table {
            parts.push(format!("table={}", table));
        }
        if parts.is_empty() {
            f.write_str("no context")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

/// Errors returned by snapshot, verify, restore, and catalog operations.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("validation error: {message} ({context})")]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("corruption detected: {message} ({context})")]
    Corruption {
        message: String,
        context: ErrorContext,
    },

    #[error("dependency error: {message} ({context})")]
    Dependency {
        message: String,
        context: ErrorContext,
    },

    #[error("io error: {source} ({context})")]
    Io {
        #[source]
        source: std::io::Error,
        context: ErrorContext,
    },

    #[error("backup not found: {0}")]
    NotFound(Ulid),

    #[error("apply error at statement {statement}: {source} ({context})")]
    Apply {
        #[source]
        source: rusqlite::Error,
        statement: usize,
        context: ErrorContext,
    },

    #[error("datastore error: {source} ({context})")]
    Datastore {
        #[source]
        source: rusqlite::Error,
        context: ErrorContext,
    },
}

impl BackupError {
    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        BackupError::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn corruption(message: impl Into<String>, context: ErrorContext) -> Self {
        BackupError::Corruption {
            message: message.into(),
            context,
        }
    }

    pub fn dependency(message: impl Into<String>, context: ErrorContext) -> Self {
        BackupError::Dependency {
            message: message.into(),
            context,
        }
    }

    pub fn io(source: std::io::Error, context: ErrorContext) -> Self {
        BackupError::Io { source, context }
    }

    pub fn datastore(source: rusqlite::Error, context: ErrorContext) -> Self {
        BackupError::Datastore { source, context }
    }

    /// The context attached to this error. `NotFound` only knows its id.
    pub fn context(&self) -> ErrorContext {
        match self {
            BackupError::Validation { context, .. }
            | BackupError::Corruption { context, .. }
            | BackupError::Dependency { context, .. }
            | BackupError::Io { context, .. }
            | BackupError::Apply { context, .. }
            | BackupError::Datastore { context, .. } => context.clone(),
            BackupError::NotFound(id) => ErrorContext::backup(*id),
        }
    }

    /// Attach a context to an error produced below the layer that knows it.
    /// Fields already set are kept.
    pub fn with_context(mut self, outer: ErrorContext) -> Self {
        let merge = |context: &mut ErrorContext| {
            if context.backup_id.is_none() {
                context.backup_id = outer.backup_id;
            }
            if context.phase.is_none() {
                context.phase = outer.phase;
            }
            if context.table.is_none() {
                context.table = outer.table.clone();
            }
        };
        match &mut self {
            BackupError::Validation { context, .. }
            | BackupError::Corruption { context, .. }
            | BackupError::Dependency { context, .. }
            | BackupError::Io { context, .. }
            | BackupError::Apply { context, .. }
            | BackupError::Datastore { context, .. } => merge(context),
            BackupError::NotFound(_) => {}
        }
        self
    }
}

impl From<CatalogError> for BackupError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(id) => BackupError::NotFound(id),
            CatalogError::Duplicate(id) => BackupError::validation(
                format!("backup {} is already registered", id),
                ErrorContext::backup(id),
            ),
            CatalogError::ArtifactRemoval { id, source } => {
                BackupError::io(source, ErrorContext::backup(id))
            }
            CatalogError::Io(source) => BackupError::io(source, ErrorContext::default()),
            other => BackupError::io(std::io::Error::other(other), ErrorContext::default()),
        }
    }
}

impl From<ArtifactError> for BackupError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Io(source) => BackupError::io(source, ErrorContext::default()),
            other => BackupError::corruption(other.to_string(), ErrorContext::default()),
        }
    }
}

impl From<SchemaError> for BackupError {
    fn from(err: SchemaError) -> Self {
        BackupError::validation(err.to_string(), ErrorContext::default())
    }
}

impl From<IntrospectError> for BackupError {
    fn from(err: IntrospectError) -> Self {
        match err {
            IntrospectError::Sqlite(source) => BackupError::datastore(source, ErrorContext::default()),
            IntrospectError::Schema(err) => BackupError::from(err),
        }
    }
}

impl From<TransitionError> for BackupError {
    fn from(err: TransitionError) -> Self {
        BackupError::validation(err.to_string(), ErrorContext::default().in_phase(err.from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_display_lists_known_fields() {
        let id = Ulid::new();
        let ctx = ErrorContext::backup(id)
            .in_phase(RestorePhase::Applying)
            .on_table("contacts");
        let shown = ctx.to_string();
        assert!(shown.contains(&id.to_string()));
        assert!(shown.contains("phase=Applying"));
        assert!(shown.contains("table=contacts"));
        assert_eq!(ErrorContext::default().to_string(), "no context");
    }

    #[test]
    fn with_context_keeps_inner_fields() {
        let id = Ulid::new();
        let err = BackupError::corruption("bad line", ErrorContext::default().on_table("schools"))
            .with_context(ErrorContext::backup(id).in_phase(RestorePhase::Validating).on_table("x"));
        let ctx = err.context();
        assert_eq!(ctx.backup_id, Some(id));
        assert_eq!(ctx.phase, Some(RestorePhase::Validating));
        assert_eq!(ctx.table.as_deref(), Some("schools"));
    }

    #[test]
    fn catalog_not_found_maps_to_not_found() {
        let id = Ulid::new();
        let err: BackupError = CatalogError::NotFound(id).into();
        assert!(matches!(err, BackupError::NotFound(found) if found == id));
    }

    #[test]
    fn malformed_artifact_maps_to_corruption() {
        let err: BackupError = ArtifactError::Malformed("line 3".to_string()).into();
        assert!(matches!(err, BackupError::Corruption { .. }));
    }
}
