#![forbid(unsafe_code)]
//! Facade crate re-exporting the core save protocol for the `dbconstraints` library.
//!
//! Database constraints (unique columns above all) are the only reliable
//! guard against two requests that both validate against stale data and then
//! race to write. This crate turns the resulting integrity error into an
//! ordinary form validation error, so the losing request redisplays its form
//! instead of failing.
//!
//! # Example: saving a form
//!
//! ```ignore
//! // Non-runnable: a real form needs a backend transaction manager.
//! use dbconstraints::{transactional_save_form, UniqueFieldConvertor};
//! use dbconstraints::transactions::TransactionDefinition;
//!
//! let unique = UniqueFieldConvertor::new("Entry").column("unique_value", "unique_value");
//! let def = TransactionDefinition::default();
//! match transactional_save_form(&manager, &def, &mut form, &[&unique]).await {
//!     Ok(entry) => redirect_to(entry),
//!     Err(e) if e.is_validation() => render(form.errors().as_ul()),
//!     Err(e) => return Err(e),
//! }
//! ```
//!
//! # Example: a create handler
//!
//! [`views::FormView`] bundles validation, the transactional save and the
//! redisplay-on-error decision. A runnable axum demo lives under `demos/`.

// Re-export the core types and the save protocol.
pub use dbconstraints_core::{
    async_trait, escape_html, fallback_conversion, record_errors, save_converting,
    transactional_save, transactional_save_form, validation_error_from_integrity_error,
    ConstraintKind, Convertor, ErrorKey, Form, FormErrors, IntegrityError, SaveError, SaveResult,
    UniqueFieldConvertor, ValidationError, NON_FIELD_ERRORS,
};

// Re-export backend-agnostic transactions API so end-users can import from `dbconstraints`.
pub use dbconstraints_core::transactions;

pub mod views;

// Backend transaction managers re-exported under a neutral namespace, so end-users don't
// have to depend on backend crates directly. These are feature-gated.
pub mod backends {
    #[cfg(feature = "libsql-backend")]
    pub use dbconstraints_libsql::LibsqlTransactionManager;
    #[cfg(feature = "mysql-async")]
    pub use dbconstraints_mysql_async::MysqlAsyncTransactionManager;
    #[cfg(feature = "postgres-backend")]
    pub use dbconstraints_tokio_postgres::TokioPostgresTransactionManager;
}
