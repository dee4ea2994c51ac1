//! Form-side error collection and the `Form` trait saved by the protocol.

use crate::transactions::TransactionContext;
use crate::{ErrorKey, SaveResult, ValidationError};
use std::collections::BTreeMap;

/// Mutable, per-form collection of validation messages keyed by field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormErrors {
    errors: BTreeMap<ErrorKey, Vec<String>>,
}

impl FormErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` under `field`; `None` files it as a non-field error.
    pub fn add_error(&mut self, field: Option<&str>, message: impl Into<String>) {
        self.errors
            .entry(ErrorKey::from_field(field))
            .or_default()
            .push(message.into());
    }

    /// Append every message of `error`, keeping each under its own field.
    pub fn extend_from(&mut self, error: &ValidationError) {
        for (key, messages) in error.iter() {
            self.errors
                .entry(key.clone())
                .or_default()
                .extend(messages.iter().cloned());
        }
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.errors
            .get(&ErrorKey::from_field(Some(field)))
            .map(Vec::as_slice)
    }

    pub fn non_field_errors(&self) -> &[String] {
        self.errors
            .get(&ErrorKey::NonField)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ErrorKey, &[String])> {
        self.errors.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.errors.values().all(Vec::is_empty)
    }

    /// Total number of messages across all fields.
    pub fn len(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// Render the whole collection as nested `errorlist` HTML lists.
    pub fn as_ul(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("<ul class=\"errorlist\">");
        for (key, messages) in &self.errors {
            if messages.is_empty() {
                continue;
            }
            out.push_str("<li>");
            out.push_str(&escape_html(key.as_str()));
            out.push_str(&list_html(messages));
            out.push_str("</li>");
        }
        out.push_str("</ul>");
        out
    }

    /// Render one field's messages; empty when the field has none.
    pub fn field_as_ul(&self, field: Option<&str>) -> String {
        match self.errors.get(&ErrorKey::from_field(field)) {
            Some(messages) if !messages.is_empty() => list_html(messages),
            _ => String::new(),
        }
    }
}

fn list_html(messages: &[String]) -> String {
    let mut out = String::from("<ul class=\"errorlist\">");
    for m in messages {
        out.push_str("<li>");
        out.push_str(&escape_html(m));
        out.push_str("</li>");
    }
    out.push_str("</ul>");
    out
}

/// Escape text for an HTML body or a quoted attribute value.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// A bound form: validated input plus a `save` that writes it.
///
/// `save` runs inside a transaction opened by the save protocol; backends
/// hand out the transaction-bound connection for the given context.
#[async_trait::async_trait]
pub trait Form: Send {
    /// What a successful save produces, usually the stored record.
    type Output: Send;

    fn errors(&self) -> &FormErrors;

    fn errors_mut(&mut self) -> &mut FormErrors;

    /// Field and cross-field checks against the bound data.
    fn clean(&mut self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Run [`Form::clean`] and report whether it left any errors.
    ///
    /// Errors are recomputed from scratch on every call, so checking a form
    /// before handing it to a view does not file its messages twice.
    fn is_valid(&mut self) -> bool {
        self.errors_mut().clear();
        if let Err(e) = self.clean() {
            self.errors_mut().extend_from(&e);
        }
        self.errors().is_empty()
    }

    async fn save(&mut self, ctx: TransactionContext<'_>) -> SaveResult<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NON_FIELD_ERRORS;

    #[test]
    fn add_error_defaults_to_non_field() {
        let mut errs = FormErrors::new();
        errs.add_error(None, "boom");
        errs.add_error(Some("name"), "required");
        assert_eq!(errs.non_field_errors(), &["boom".to_string()]);
        assert_eq!(errs.get("name"), Some(&["required".to_string()][..]));
        assert_eq!(errs.get(NON_FIELD_ERRORS), Some(&["boom".to_string()][..]));
        assert_eq!(errs.len(), 2);
        errs.clear();
        assert!(errs.is_empty());
    }

    #[test]
    fn extend_from_preserves_field_association_and_appends() {
        let mut errs = FormErrors::new();
        errs.add_error(Some("unique"), "already bad");
        let v = ValidationError::from_field_messages([
            ("unique", vec!["some message", "some other message"]),
        ])
        .with_message(None, "form-wide");
        errs.extend_from(&v);
        assert_eq!(
            errs.get("unique").map(<[String]>::len),
            Some(3),
            "messages are appended, not replaced"
        );
        assert_eq!(errs.non_field_errors(), &["form-wide".to_string()]);
    }

    #[test]
    fn as_ul_renders_errorlist_and_escapes() {
        let mut errs = FormErrors::new();
        assert_eq!(errs.as_ul(), "");
        errs.add_error(Some("unique"), "<b>taken</b>");
        let html = errs.as_ul();
        assert!(html.contains("class=\"errorlist\""));
        assert!(html.contains("&lt;b&gt;taken&lt;/b&gt;"));
        assert_eq!(
            errs.field_as_ul(Some("unique")),
            "<ul class=\"errorlist\"><li>&lt;b&gt;taken&lt;/b&gt;</li></ul>"
        );
        assert_eq!(errs.field_as_ul(None), "");
    }

    #[test]
    fn escape_html_covers_attribute_quotes() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#x27;&amp;&#x27;&lt;/a&gt;"
        );
        assert_eq!(escape_html("42"), "42");
    }

    struct Cleaning {
        errors: FormErrors,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Form for Cleaning {
        type Output = ();
        fn errors(&self) -> &FormErrors {
            &self.errors
        }
        fn errors_mut(&mut self) -> &mut FormErrors {
            &mut self.errors
        }
        fn clean(&mut self) -> Result<(), ValidationError> {
            if self.fail {
                Err(ValidationError::for_field("unique", "Enter a whole number."))
            } else {
                Ok(())
            }
        }
        async fn save(&mut self, _ctx: TransactionContext<'_>) -> SaveResult<()> {
            Ok(())
        }
    }

    #[test]
    fn is_valid_files_clean_errors() {
        let mut ok = Cleaning {
            errors: FormErrors::new(),
            fail: false,
        };
        assert!(ok.is_valid());

        let mut bad = Cleaning {
            errors: FormErrors::new(),
            fail: true,
        };
        assert!(!bad.is_valid());
        assert_eq!(
            bad.errors().get("unique"),
            Some(&["Enter a whole number.".to_string()][..])
        );
    }

    #[test]
    fn repeated_is_valid_files_clean_errors_once() {
        let mut bad = Cleaning {
            errors: FormErrors::new(),
            fail: true,
        };
        assert!(!bad.is_valid());
        assert!(!bad.is_valid());
        assert_eq!(
            bad.errors().get("unique"),
            Some(&["Enter a whole number.".to_string()][..])
        );
        assert_eq!(bad.errors().len(), 1);

        bad.fail = false;
        assert!(bad.is_valid(), "fixed input clears earlier clean errors");
        assert!(bad.errors().is_empty());
    }
}
