//! Integrity error → validation error conversion chain.

use crate::{ConstraintKind, IntegrityError, ValidationError};
use std::collections::HashMap;

/// Translates an [`IntegrityError`] into a [`ValidationError`], or declines
/// with `None` so the next convertor in the chain gets a go.
///
/// Implemented for any `Fn(&IntegrityError) -> Option<ValidationError>`.
pub trait Convertor: Send + Sync {
    fn convert(&self, error: &IntegrityError) -> Option<ValidationError>;
}

impl<F> Convertor for F
where
    F: Fn(&IntegrityError) -> Option<ValidationError> + Send + Sync,
{
    fn convert(&self, error: &IntegrityError) -> Option<ValidationError> {
        self(error)
    }
}

/// The last link of every chain: the raw error text as one non-field message.
pub fn fallback_conversion(error: &IntegrityError) -> Option<ValidationError> {
    Some(ValidationError::new(error.to_string()))
}

/// Run `convertors` in order, then [`fallback_conversion`], and return the
/// first result. The returned error carries `error` as its cause.
pub fn validation_error_from_integrity_error(
    error: &IntegrityError,
    convertors: &[&dyn Convertor],
) -> ValidationError {
    let mut converted = convertors
        .iter()
        .find_map(|c| c.convert(error))
        .unwrap_or_else(|| ValidationError::new(error.to_string()));
    converted.set_cause(error.clone());
    converted
}

/// Turns a unique violation on one known column into a field error such as
/// `"Entry with this Unique value already exists."`.
///
/// Declines for other constraint kinds, composite keys and unmapped columns.
#[derive(Debug, Clone)]
pub struct UniqueFieldConvertor {
    model_label: String,
    // column -> (field name, field label)
    columns: HashMap<String, (String, String)>,
}

impl UniqueFieldConvertor {
    pub fn new(model_label: impl Into<String>) -> Self {
        Self {
            model_label: model_label.into(),
            columns: HashMap::new(),
        }
    }

    /// Map `column` to a form field. The label defaults to the field name with
    /// underscores as spaces and the first letter capitalised.
    pub fn column(mut self, column: impl Into<String>, field: impl Into<String>) -> Self {
        let field = field.into();
        let label = capitalise(&field.replace('_', " "));
        self.columns.insert(column.into(), (field, label));
        self
    }

    pub fn column_with_label(
        mut self,
        column: impl Into<String>,
        field: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        self.columns
            .insert(column.into(), (field.into(), label.into()));
        self
    }
}

impl Convertor for UniqueFieldConvertor {
    fn convert(&self, error: &IntegrityError) -> Option<ValidationError> {
        if !matches!(error.kind(), ConstraintKind::Unique) {
            return None;
        }
        let [column] = error.columns() else {
            return None;
        };
        let (field, label) = self.columns.get(column)?;
        Some(ValidationError::for_field(
            field.clone(),
            format!("{} with this {} already exists.", self.model_label, label),
        ))
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
