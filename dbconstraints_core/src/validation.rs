//! User-facing validation errors.

use crate::IntegrityError;
use std::collections::BTreeMap;
use std::fmt;

/// Rendered name of the non-field bucket.
pub const NON_FIELD_ERRORS: &str = "__all__";

/// Key under which validation messages are filed.
///
/// `NonField` sorts first so form-wide messages are listed before field
/// messages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKey {
    NonField,
    Field(String),
}

impl ErrorKey {
    /// Map an optional field name to a key; `None` is the non-field bucket.
    pub fn from_field(field: Option<&str>) -> Self {
        match field {
            Some(name) if name != NON_FIELD_ERRORS => ErrorKey::Field(name.to_string()),
            _ => ErrorKey::NonField,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorKey::NonField => NON_FIELD_ERRORS,
            ErrorKey::Field(name) => name,
        }
    }

    pub fn is_non_field(&self) -> bool {
        matches!(self, ErrorKey::NonField)
    }
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-scoped validation messages plus the integrity error they were
/// converted from, if any.
///
/// Equality compares the field/message content only; `cause` is diagnostic.
#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    errors: BTreeMap<ErrorKey, Vec<String>>,
    cause: Option<IntegrityError>,
}

impl ValidationError {
    /// A single non-field message.
    pub fn new(message: impl Into<String>) -> Self {
        Self::from_messages([message])
    }

    /// A list of non-field messages, kept in order.
    pub fn from_messages<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Self::default();
        for m in messages {
            out.push(ErrorKey::NonField, m.into());
        }
        out
    }

    /// A single message attached to `field`.
    pub fn for_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut out = Self::default();
        out.push(ErrorKey::Field(field.into()), message.into());
        out
    }

    /// A field → messages mapping. Use [`NON_FIELD_ERRORS`] as the field name
    /// for form-wide messages.
    pub fn from_field_messages<I, F, M, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (F, M)>,
        F: AsRef<str>,
        M: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Self::default();
        for (field, messages) in fields {
            let key = ErrorKey::from_field(Some(field.as_ref()));
            for m in messages {
                out.push(key.clone(), m.into());
            }
        }
        out
    }

    /// Add another message under `field` (`None` for non-field).
    pub fn with_message(mut self, field: Option<&str>, message: impl Into<String>) -> Self {
        self.push(ErrorKey::from_field(field), message.into());
        self
    }

    fn push(&mut self, key: ErrorKey, message: String) {
        self.errors.entry(key).or_default().push(message);
    }

    /// All messages, non-field first, in insertion order within a field.
    pub fn messages(&self) -> Vec<&str> {
        self.errors
            .values()
            .flat_map(|v| v.iter().map(String::as_str))
            .collect()
    }

    pub fn error_dict(&self) -> &BTreeMap<ErrorKey, Vec<String>> {
        &self.errors
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ErrorKey, &[String])> {
        self.errors.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn field_messages(&self, field: Option<&str>) -> &[String] {
        self.errors
            .get(&ErrorKey::from_field(field))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.errors.values().all(Vec::is_empty)
    }

    pub fn cause(&self) -> Option<&IntegrityError> {
        self.cause.as_ref()
    }

    pub fn set_cause(&mut self, cause: IntegrityError) {
        self.cause = Some(cause);
    }
}

impl PartialEq for ValidationError {
    fn eq(&self, other: &Self) -> bool {
        self.errors == other.errors
    }
}

impl Eq for ValidationError {}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, messages) in &self.errors {
            for m in messages {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                match key {
                    ErrorKey::NonField => f.write_str(m)?,
                    ErrorKey::Field(name) => write!(f, "{}: {}", name, m)?,
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}
