#![forbid(unsafe_code)]
//! Core types for the dbconstraints library.
//! This crate is database-agnostic and should not contain any backend-specific logic.

// Re-export for downstream `Form` implementations.
pub use async_trait::async_trait;

pub mod convert;
pub mod form;
pub mod save;
// Public transactions module (backend-agnostic abstractions)
pub mod transactions;
pub mod validation;

pub use convert::{
    fallback_conversion, validation_error_from_integrity_error, Convertor, UniqueFieldConvertor,
};
pub use form::{escape_html, Form, FormErrors};
pub use save::{record_errors, save_converting, transactional_save, transactional_save_form};
pub use validation::{ErrorKey, ValidationError, NON_FIELD_ERRORS};

use std::fmt;
use std::sync::Arc;

/// The kind of database constraint that rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    Unique,
    PrimaryKey,
    ForeignKey,
    NotNull,
    Check,
    Exclusion,
    /// A constraint violation the driver did not describe further.
    Other,
}

impl ConstraintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::PrimaryKey => "primary_key",
            ConstraintKind::ForeignKey => "foreign_key",
            ConstraintKind::NotNull => "not_null",
            ConstraintKind::Check => "check",
            ConstraintKind::Exclusion => "exclusion",
            ConstraintKind::Other => "other",
        }
    }
}

/// A database-level constraint violation, as reported by a backend adapter.
///
/// `Display` yields the driver's own message, which is what the fallback
/// conversion shows to users. The originating driver error, if any, is kept
/// as the `source()`.
#[derive(Debug, Clone)]
pub struct IntegrityError {
    kind: ConstraintKind,
    message: String,
    table: Option<String>,
    columns: Vec<String>,
    constraint: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl IntegrityError {
    pub fn new(kind: ConstraintKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            table: None,
            columns: Vec::new(),
            constraint: None,
            source: None,
        }
    }

    /// Shorthand for a unique violation, the common case.
    pub fn unique(message: impl Into<String>) -> Self {
        Self::new(ConstraintKind::Unique, message)
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Attach the driver error this violation was classified from.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for IntegrityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error type for everything that runs inside a transactional save.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// User-facing validation failure carrying field-scoped messages.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    /// A database constraint rejected the write. Never escapes
    /// [`save_converting`]; it is converted to `Validation` first.
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    /// The object being edited does not exist.
    #[error("entity not found")]
    NotFound,
    /// Opaque backend error from the underlying driver or adapter.
    #[error("backend error")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SaveError {
    /// Wrap a backend/driver error.
    pub fn backend<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SaveError::Backend {
            source: Box::new(e),
        }
    }

    /// Wrap a plain message as a backend error.
    pub fn backend_msg(msg: impl Into<String>) -> Self {
        SaveError::backend(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            SaveError::Validation(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SaveError::Validation(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, SaveError::Integrity(_))
    }

    /// Short label used in logs and metrics.
    pub fn kind_str(&self) -> &'static str {
        match self {
            SaveError::Validation(_) => "validation",
            SaveError::Integrity(_) => "integrity",
            SaveError::NotFound => "not_found",
            SaveError::Backend { .. } => "backend",
        }
    }
}

/// Convenience alias for results returned inside a transactional save.
pub type SaveResult<T> = Result<T, SaveError>;
