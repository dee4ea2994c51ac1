//! Backend-agnostic transaction abstractions.
//! This module defines only generic types and traits. Backends provide implementations.

use crate::{Convertor, Form, FormErrors, SaveResult};
use std::time::Duration;

/// Transaction propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Join the active transaction or open one.
    Required,
    /// Run isolated from the active transaction (a savepoint when nested).
    RequiresNew,
    Supports,
    NotSupported,
    Never,
    Nested,
}

/// Transaction isolation level (best-effort across backends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// How a save's transaction is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub isolation: Isolation,
    pub read_only: bool,
    /// Lock wait / statement timeout, applied best-effort per backend.
    pub timeout: Option<Duration>,
}

impl TransactionDefinition {
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether this definition opens (or joins) a real transaction when none is active.
    pub fn starts_transaction(&self) -> bool {
        !matches!(
            self.propagation,
            Propagation::Supports | Propagation::NotSupported | Propagation::Never
        )
    }

    /// The definition a save boundary runs with. A save that would join an
    /// active transaction gets a savepoint instead, so its writes are undone
    /// on failure without disturbing the outer transaction.
    pub fn atomic(&self, in_transaction: bool) -> TransactionDefinition {
        let joins = matches!(self.propagation, Propagation::Required | Propagation::Supports);
        if in_transaction && joins {
            self.clone().with_propagation(Propagation::Nested)
        } else {
            self.clone()
        }
    }
}

impl Default for TransactionDefinition {
    fn default() -> Self {
        Self {
            propagation: Propagation::Required,
            isolation: Isolation::Default,
            read_only: false,
            timeout: None,
        }
    }
}

/// Opaque handle passed to the save callback. Backends use it to vend the
/// transaction-bound connection; user code just passes it along.
#[derive(Debug, Clone, Copy)]
pub struct TransactionContext<'a> {
    _priv: std::marker::PhantomData<&'a ()>,
}

impl<'a> TransactionContext<'a> {
    pub fn new() -> Self {
        Self {
            _priv: std::marker::PhantomData,
        }
    }
}

impl<'a> Default for TransactionContext<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend-implemented transaction manager.
#[async_trait::async_trait]
pub trait TransactionManager: Send + Sync {
    /// Run `f` inside a transactional scope per `def`: commit when it returns
    /// `Ok`, roll back when it returns `Err`. Implementations classify driver
    /// failures (including a failed COMMIT) into `SaveError::Integrity` when
    /// they are constraint violations.
    async fn execute<'a, R, F, Fut>(&'a self, def: &TransactionDefinition, f: F) -> SaveResult<R>
    where
        F: FnOnce(TransactionContext<'a>) -> Fut + Send + 'a,
        Fut: core::future::Future<Output = SaveResult<R>> + Send + 'a,
        R: Send + 'a;

    /// Whether the current task is inside a transaction opened by this manager.
    fn in_transaction(&self) -> bool {
        false
    }
}

/// A manager paired with default transaction settings.
#[derive(Debug)]
pub struct TransactionTemplate<M: TransactionManager> {
    manager: M,
    defaults: TransactionDefinition,
}

impl<M: TransactionManager> TransactionTemplate<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            defaults: TransactionDefinition::default(),
        }
    }

    pub fn with_defaults(mut self, def: TransactionDefinition) -> Self {
        self.defaults = def;
        self
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn defaults(&self) -> &TransactionDefinition {
        &self.defaults
    }

    pub async fn execute<R, F, Fut>(&self, f: F) -> SaveResult<R>
    where
        F: for<'a> FnOnce(TransactionContext<'a>) -> Fut + Send,
        Fut: core::future::Future<Output = SaveResult<R>> + Send,
        R: Send + 'static,
    {
        self.manager.execute(&self.defaults, f).await
    }

    /// [`crate::transactional_save`] with this template's manager and defaults.
    pub async fn save<R, F, Fut>(
        &self,
        errors: &mut FormErrors,
        convertors: &[&dyn Convertor],
        f: F,
    ) -> SaveResult<R>
    where
        F: for<'a> FnOnce(TransactionContext<'a>) -> Fut + Send,
        Fut: core::future::Future<Output = SaveResult<R>> + Send,
        R: Send + 'static,
    {
        crate::transactional_save(&self.manager, &self.defaults, errors, convertors, f).await
    }

    /// [`crate::transactional_save_form`] with this template's manager and defaults.
    pub async fn save_form<Fm: Form>(
        &self,
        form: &mut Fm,
        convertors: &[&dyn Convertor],
    ) -> SaveResult<Fm::Output> {
        crate::transactional_save_form(&self.manager, &self.defaults, form, convertors).await
    }
}

/// Runs the callback without a real database transaction. Useful for
/// in-memory stores and tests; integrity errors still go through conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransactionManager;

#[async_trait::async_trait]
impl TransactionManager for DefaultTransactionManager {
    async fn execute<'a, R, F, Fut>(&'a self, _def: &TransactionDefinition, f: F) -> SaveResult<R>
    where
        F: FnOnce(TransactionContext<'a>) -> Fut + Send + 'a,
        Fut: core::future::Future<Output = SaveResult<R>> + Send + 'a,
        R: Send + 'a,
    {
        f(TransactionContext::new()).await
    }
}

/// A template over [`DefaultTransactionManager`].
pub fn default_transaction_template() -> TransactionTemplate<DefaultTransactionManager> {
    TransactionTemplate::new(DefaultTransactionManager)
}
