//! Create/update request handling around the transactional save.

use crate::transactions::{TransactionDefinition, TransactionManager};
use crate::{transactional_save_form, Convertor, Form, SaveError, SaveResult};
use std::fmt;

#[cfg(feature = "tracing")]
use tracing::debug;

/// What a POST handler should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormResponse<T> {
    /// The save committed; redirect to `location`.
    Success { object: T, location: String },
    /// Redisplay the form, whose errors are now populated.
    Invalid,
}

impl<T> FormResponse<T> {
    /// HTTP status the response maps to: 302 on success, 200 on redisplay.
    pub fn status_code(&self) -> u16 {
        match self {
            FormResponse::Success { .. } => 302,
            FormResponse::Invalid => 200,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FormResponse::Success { .. })
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            FormResponse::Success { location, .. } => Some(location),
            FormResponse::Invalid => None,
        }
    }

    pub fn into_object(self) -> Option<T> {
        match self {
            FormResponse::Success { object, .. } => Some(object),
            FormResponse::Invalid => None,
        }
    }
}

/// Handler for a form POST: validate, save transactionally, then redirect or
/// redisplay.
///
/// The integrity-to-validation conversion can be overridden per view with
/// [`FormView::with_conversion`]; view convertors run before the fallback.
pub struct FormView {
    success_url: String,
    definition: TransactionDefinition,
    convertors: Vec<Box<dyn Convertor>>,
}

/// A [`FormView`] whose form builds a new record.
pub type CreateView = FormView;
/// A [`FormView`] whose form was bound to an existing record by the caller.
pub type UpdateView = FormView;

impl FormView {
    pub fn new(success_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            definition: TransactionDefinition::default(),
            convertors: Vec::new(),
        }
    }

    pub fn with_definition(mut self, definition: TransactionDefinition) -> Self {
        self.definition = definition;
        self
    }

    /// Add a view-level conversion, tried in insertion order.
    pub fn with_conversion<C>(mut self, convertor: C) -> Self
    where
        C: Convertor + 'static,
    {
        self.convertors.push(Box::new(convertor));
        self
    }

    pub fn success_url(&self) -> &str {
        &self.success_url
    }

    /// Handle a submitted form.
    ///
    /// Returns `Ok(FormResponse::Invalid)` both when validation fails up
    /// front and when the save raises a validation error (converted or
    /// not). Any other save error is returned as `Err`.
    pub async fn post<M, Fm>(
        &self,
        manager: &M,
        form: &mut Fm,
    ) -> SaveResult<FormResponse<Fm::Output>>
    where
        M: TransactionManager,
        Fm: Form,
    {
        if !form.is_valid() {
            #[cfg(feature = "tracing")]
            {
                debug!(errors = form.errors().len(), "form invalid before save");
            }
            return Ok(FormResponse::Invalid);
        }
        let convertors: Vec<&dyn Convertor> = self.convertors.iter().map(|c| c.as_ref()).collect();
        match transactional_save_form(manager, &self.definition, form, &convertors).await {
            Ok(object) => Ok(FormResponse::Success {
                object,
                location: self.success_url.clone(),
            }),
            Err(SaveError::Validation(_e)) => {
                #[cfg(feature = "tracing")]
                {
                    debug!(error = %_e, "save rejected, redisplaying form");
                }
                Ok(FormResponse::Invalid)
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for FormView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormView")
            .field("success_url", &self.success_url)
            .field("definition", &self.definition)
            .field("convertors", &self.convertors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::{DefaultTransactionManager, TransactionContext};
    use crate::{FormErrors, IntegrityError, ValidationError};

    /// Minimal form over a shared "unique" set, enough to drive the view.
    struct SetForm<'s> {
        taken: &'s std::sync::Mutex<Vec<i64>>,
        raw: String,
        value: Option<i64>,
        errors: FormErrors,
    }

    impl<'s> SetForm<'s> {
        fn new(taken: &'s std::sync::Mutex<Vec<i64>>, raw: &str) -> Self {
            Self {
                taken,
                raw: raw.to_string(),
                value: None,
                errors: FormErrors::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl<'s> Form for SetForm<'s> {
        type Output = i64;
        fn errors(&self) -> &FormErrors {
            &self.errors
        }
        fn errors_mut(&mut self) -> &mut FormErrors {
            &mut self.errors
        }
        fn clean(&mut self) -> Result<(), ValidationError> {
            match self.raw.trim().parse::<i64>() {
                Ok(v) => {
                    self.value = Some(v);
                    Ok(())
                }
                Err(_) => Err(ValidationError::for_field("unique", "Enter a whole number.")),
            }
        }
        async fn save(&mut self, _ctx: TransactionContext<'_>) -> SaveResult<i64> {
            let v = self.value.ok_or(SaveError::NotFound)?;
            let mut g = self.taken.lock().unwrap();
            if g.contains(&v) {
                return Err(IntegrityError::unique(format!("duplicate value {v}")).into());
            }
            g.push(v);
            Ok(v)
        }
    }

    #[tokio::test]
    async fn success_redirects_to_success_url() {
        let taken = std::sync::Mutex::new(Vec::new());
        let view = CreateView::new("/");
        let mut form = SetForm::new(&taken, "1");
        let resp = view.post(&DefaultTransactionManager, &mut form).await.unwrap();
        assert_eq!(resp.status_code(), 302);
        assert_eq!(resp.location(), Some("/"));
        assert_eq!(resp.into_object(), Some(1));
        assert!(form.errors().is_empty());
    }

    #[tokio::test]
    async fn integrity_error_redisplays_with_fallback_message() {
        let taken = std::sync::Mutex::new(vec![1]);
        let view = CreateView::new("/");
        let mut form = SetForm::new(&taken, "1");
        let resp = view.post(&DefaultTransactionManager, &mut form).await.unwrap();
        assert_eq!(resp, FormResponse::Invalid);
        assert_eq!(resp.status_code(), 200);
        assert!(form.errors().as_ul().contains("errorlist"));
        assert_eq!(form.errors().non_field_errors(), &["duplicate value 1".to_string()]);
    }

    #[tokio::test]
    async fn overridden_conversion_wins() {
        let taken = std::sync::Mutex::new(vec![3]);
        let view = UpdateView::new("/")
            .with_conversion(|_: &IntegrityError| Some(ValidationError::new("poop")));
        let mut form = SetForm::new(&taken, "3");
        let resp = view.post(&DefaultTransactionManager, &mut form).await.unwrap();
        assert!(!resp.is_success());
        assert!(form.errors().as_ul().contains("poop"));
    }

    #[tokio::test]
    async fn invalid_input_never_saves() {
        let taken = std::sync::Mutex::new(Vec::new());
        let view = CreateView::new("/");
        let mut form = SetForm::new(&taken, "not a number");
        // Checked once by the caller, then again by the view.
        assert!(!form.is_valid());
        let resp = view.post(&DefaultTransactionManager, &mut form).await.unwrap();
        assert_eq!(resp, FormResponse::Invalid);
        assert!(taken.lock().unwrap().is_empty());
        assert_eq!(
            form.errors().get("unique"),
            Some(&["Enter a whole number.".to_string()][..])
        );
    }

    #[test]
    fn debug_hides_convertors() {
        let view = FormView::new("/done")
            .with_conversion(|_: &IntegrityError| -> Option<ValidationError> { None });
        let s = format!("{:?}", view);
        assert!(s.contains("/done"));
        assert!(s.contains("convertors: 1"));
    }
}
