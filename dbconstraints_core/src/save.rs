//! The transactional save protocol.
//!
//! A save runs inside `TransactionManager::execute`. A constraint violation
//! raised by the save (or by the COMMIT) rolls the transaction back and is
//! converted into a [`ValidationError`] through the convertor chain. Any
//! validation error, converted or raised directly by the save, is copied
//! onto the caller's [`FormErrors`] and then returned unchanged, so callers
//! must handle the `Err` to redisplay the form.

use crate::transactions::{TransactionContext, TransactionDefinition, TransactionManager};
use crate::{
    validation_error_from_integrity_error, Convertor, Form, FormErrors, SaveError, SaveResult,
    ValidationError,
};
use std::future::Future;
use std::time::Instant;

#[cfg(feature = "tracing")]
use tracing::{debug, info};

#[inline]
#[allow(unused_variables)]
fn obs_record(op: &str, start: Instant, outcome: &str) {
    let elapsed = start.elapsed().as_millis() as u64;
    #[cfg(feature = "tracing")]
    {
        info!(op = op, outcome = outcome, elapsed_ms = elapsed, "transactional save");
    }
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("tsave_total", 1, "op" => op.to_string(), "outcome" => outcome.to_string());
        metrics::histogram!("tsave_duration_ms", elapsed as f64, "op" => op.to_string());
        if outcome == "converted" {
            metrics::counter!("tsave_integrity_conversions_total", 1, "op" => op.to_string());
        }
    }
}

/// Run `save` in a transaction and convert integrity errors.
///
/// Never returns `SaveError::Integrity`: constraint violations come back as
/// `SaveError::Validation` carrying the original error as `cause`. Other
/// errors pass through untouched.
///
/// The save is atomic even inside an active transaction: a definition that
/// would join it runs under a savepoint (see [`TransactionDefinition::atomic`]),
/// so a failed save leaves none of its writes behind.
pub async fn save_converting<'m, M, R, F, Fut>(
    manager: &'m M,
    def: &TransactionDefinition,
    convertors: &[&dyn Convertor],
    save: F,
) -> SaveResult<R>
where
    M: TransactionManager,
    F: FnOnce(TransactionContext<'m>) -> Fut + Send + 'm,
    Fut: Future<Output = SaveResult<R>> + Send + 'm,
    R: Send + 'm,
{
    let start = Instant::now();
    let def = def.atomic(manager.in_transaction());
    match manager.execute(&def, save).await {
        Ok(v) => {
            obs_record("save", start, "committed");
            Ok(v)
        }
        Err(SaveError::Integrity(ierror)) => {
            #[cfg(feature = "tracing")]
            {
                debug!(
                    kind = ierror.kind().as_str(),
                    table = ierror.table().unwrap_or(""),
                    error = %ierror,
                    "converting integrity error"
                );
            }
            let verror = validation_error_from_integrity_error(&ierror, convertors);
            obs_record("save", start, "converted");
            Err(SaveError::Validation(verror))
        }
        Err(e) => {
            obs_record("save", start, e.kind_str());
            Err(e)
        }
    }
}

/// File the messages of a validation error onto `errors`; other errors are
/// left alone. Returns the validation error when there was one.
pub fn record_errors<'e>(
    errors: &mut FormErrors,
    error: &'e SaveError,
) -> Option<&'e ValidationError> {
    let verror = error.as_validation()?;
    errors.extend_from(verror);
    Some(verror)
}

/// Save wrapper: run `save` transactionally, convert integrity errors, and
/// append any validation messages to `errors` before returning the error.
pub async fn transactional_save<'m, M, R, F, Fut>(
    manager: &'m M,
    def: &TransactionDefinition,
    errors: &mut FormErrors,
    convertors: &[&dyn Convertor],
    save: F,
) -> SaveResult<R>
where
    M: TransactionManager,
    F: FnOnce(TransactionContext<'m>) -> Fut + Send + 'm,
    Fut: Future<Output = SaveResult<R>> + Send + 'm,
    R: Send + 'm,
{
    let result = save_converting(manager, def, convertors, save).await;
    if let Err(e) = &result {
        record_errors(errors, e);
    }
    result
}

/// [`transactional_save`] for a [`Form`]: calls `form.save` and writes any
/// validation messages into `form.errors_mut()`.
pub async fn transactional_save_form<M, Fm>(
    manager: &M,
    def: &TransactionDefinition,
    form: &mut Fm,
    convertors: &[&dyn Convertor],
) -> SaveResult<Fm::Output>
where
    M: TransactionManager,
    Fm: Form,
{
    let result = save_converting(manager, def, convertors, |ctx| form.save(ctx)).await;
    if let Err(e) = &result {
        record_errors(form.errors_mut(), e);
    }
    result
}
