//! Common integration testing utilities and generic scenarios reusable across backends.
//!
//! Each backend implements [`EntryStore`] over its own connection type and
//! runs the `test_*` scenarios against a real database.

use async_trait::async_trait;
use dbconstraints::views::{CreateView, FormResponse, UpdateView};
use dbconstraints_core::transactions::{
    TransactionContext, TransactionDefinition, TransactionManager,
};
use dbconstraints_core::{
    transactional_save, transactional_save_form, ConstraintKind, Form, FormErrors,
    IntegrityError, SaveError, SaveResult, UniqueFieldConvertor, ValidationError,
};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Form field (and column) guarded by the UNIQUE constraint.
pub const UNIQUE_FIELD: &str = "unique_value";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub id: i64,
    pub unique_value: i64,
}

/// Expose migration SQL via constants for harnesses.
pub mod migrations {
    pub const POSTGRES_ENTRIES_SQL: &str = include_str!("../migrations/postgres/001_entries.sql");
    pub const MYSQL_ENTRIES_SQL: &str = include_str!("../migrations/mysql/001_entries.sql");
    pub const LIBSQL_ENTRIES_SQL: &str = include_str!("../migrations/libsql/001_entries.sql");
}

/// Storage for [`Entry`] rows, bound to a backend transaction manager.
///
/// `insert` and `update` run on the connection of the transaction that
/// `ctx` belongs to and report constraint violations as
/// `SaveError::Integrity`.
#[async_trait]
pub trait EntryStore: Send + Sync + 'static {
    type Manager: TransactionManager;

    fn manager(&self) -> &Self::Manager;

    /// Ensure the schema exists and the table is empty.
    async fn reset(&self) -> SaveResult<()>;

    async fn insert(&self, ctx: TransactionContext<'_>, unique_value: i64) -> SaveResult<Entry>;

    async fn update(
        &self,
        ctx: TransactionContext<'_>,
        id: i64,
        unique_value: i64,
    ) -> SaveResult<Entry>;

    async fn get(&self, id: i64) -> SaveResult<Option<Entry>>;

    async fn count(&self) -> SaveResult<i64>;
}

/// Synchronisation point inside [`EntryForm::save`], used to force two saves
/// to overlap.
#[derive(Clone, Debug, Default)]
pub enum SaveHook {
    #[default]
    None,
    /// Take a permit before writing.
    WaitFor(Arc<Semaphore>),
    /// Add a permit after writing, before the transaction commits.
    Signal(Arc<Semaphore>),
}

/// Model form over a single integer field.
pub struct EntryForm<'s, S: EntryStore> {
    store: &'s S,
    instance: Option<Entry>,
    raw: String,
    cleaned: Option<i64>,
    hook: SaveHook,
    errors: FormErrors,
}

impl<'s, S: EntryStore> EntryForm<'s, S> {
    /// A form that inserts a new entry.
    pub fn create(store: &'s S, raw: impl Into<String>) -> Self {
        Self {
            store,
            instance: None,
            raw: raw.into(),
            cleaned: None,
            hook: SaveHook::None,
            errors: FormErrors::new(),
        }
    }

    /// A form bound to an existing entry.
    pub fn update(store: &'s S, instance: Entry, raw: impl Into<String>) -> Self {
        Self {
            instance: Some(instance),
            ..Self::create(store, raw)
        }
    }

    pub fn with_hook(mut self, hook: SaveHook) -> Self {
        self.hook = hook;
        self
    }
}

#[async_trait]
impl<'s, S: EntryStore> Form for EntryForm<'s, S> {
    type Output = Entry;

    fn errors(&self) -> &FormErrors {
        &self.errors
    }

    fn errors_mut(&mut self) -> &mut FormErrors {
        &mut self.errors
    }

    fn clean(&mut self) -> Result<(), ValidationError> {
        match self.raw.trim().parse::<i64>() {
            Ok(v) => {
                self.cleaned = Some(v);
                Ok(())
            }
            Err(_) => Err(ValidationError::for_field(
                UNIQUE_FIELD,
                "Enter a whole number.",
            )),
        }
    }

    async fn save(&mut self, ctx: TransactionContext<'_>) -> SaveResult<Entry> {
        if let SaveHook::WaitFor(gate) = &self.hook {
            gate.acquire().await.map_err(SaveError::backend)?.forget();
        }
        let value = self
            .cleaned
            .ok_or_else(|| SaveError::backend_msg("save called before is_valid"))?;
        let saved = match &self.instance {
            Some(entry) => self.store.update(ctx, entry.id, value).await?,
            None => self.store.insert(ctx, value).await?,
        };
        if let SaveHook::Signal(gate) = &self.hook {
            gate.add_permits(1);
        }
        Ok(saved)
    }
}

/// Insert one entry in its own transaction.
pub async fn seed<S: EntryStore>(store: &S, unique_value: i64) -> SaveResult<Entry> {
    store
        .manager()
        .execute(&TransactionDefinition::default(), |ctx| {
            store.insert(ctx, unique_value)
        })
        .await
}

fn expect_validation<T: std::fmt::Debug>(result: SaveResult<T>) -> ValidationError {
    match result {
        Err(SaveError::Validation(v)) => v,
        other => panic!("expected a validation error, got {:?}", other),
    }
}

fn assert_single_non_field_error(verror: &ValidationError, errors: &FormErrors) {
    let cause = verror.cause().expect("converted from an integrity error");
    assert_eq!(cause.kind(), ConstraintKind::Unique);
    assert_eq!(verror.messages().len(), 1);
    assert_eq!(errors.non_field_errors(), &[verror.messages()[0].to_string()]);
    assert!(errors.get(UNIQUE_FIELD).is_none());
}

/// Two creates race for the same value. The first waits until the second
/// has written; exactly one commits and the other redisplays a single
/// non-field error.
pub async fn test_concurrent_create_converts_loser<S: EntryStore>(
    store: Arc<S>,
) -> SaveResult<()> {
    store.reset().await?;
    let gate = Arc::new(Semaphore::new(0));

    let first = {
        let store = Arc::clone(&store);
        let hook = SaveHook::WaitFor(Arc::clone(&gate));
        tokio::spawn(async move {
            let mut form = EntryForm::create(&*store, "1").with_hook(hook);
            assert!(form.is_valid());
            let result = transactional_save_form(
                store.manager(),
                &TransactionDefinition::default(),
                &mut form,
                &[],
            )
            .await;
            (result, form.errors().clone())
        })
    };
    let second = {
        let store = Arc::clone(&store);
        let hook = SaveHook::Signal(Arc::clone(&gate));
        tokio::spawn(async move {
            let mut form = EntryForm::create(&*store, "1").with_hook(hook);
            assert!(form.is_valid());
            let result = transactional_save_form(
                store.manager(),
                &TransactionDefinition::default(),
                &mut form,
                &[],
            )
            .await;
            (result, form.errors().clone())
        })
    };

    let (first_result, first_errors) = first.await.map_err(SaveError::backend)?;
    let (second_result, second_errors) = second.await.map_err(SaveError::backend)?;

    let winner = second_result?;
    assert_eq!(winner.unique_value, 1);
    assert!(second_errors.is_empty());

    let verror = expect_validation(first_result);
    assert_single_non_field_error(&verror, &first_errors);
    assert_eq!(store.count().await?, 1);
    Ok(())
}

/// Two updates race to move different rows onto the same value. The loser's
/// row keeps its old value.
pub async fn test_concurrent_update_keeps_loser_unchanged<S: EntryStore>(
    store: Arc<S>,
) -> SaveResult<()> {
    store.reset().await?;
    let tm1 = seed(&*store, 1).await?;
    let tm2 = seed(&*store, 2).await?;
    let gate = Arc::new(Semaphore::new(0));

    let first = {
        let store = Arc::clone(&store);
        let hook = SaveHook::WaitFor(Arc::clone(&gate));
        let instance = tm1.clone();
        tokio::spawn(async move {
            let mut form = EntryForm::update(&*store, instance, "3").with_hook(hook);
            assert!(form.is_valid());
            let result = transactional_save_form(
                store.manager(),
                &TransactionDefinition::default(),
                &mut form,
                &[],
            )
            .await;
            (result, form.errors().clone())
        })
    };
    let second = {
        let store = Arc::clone(&store);
        let hook = SaveHook::Signal(Arc::clone(&gate));
        let instance = tm2.clone();
        tokio::spawn(async move {
            let mut form = EntryForm::update(&*store, instance, "3").with_hook(hook);
            assert!(form.is_valid());
            transactional_save_form(
                store.manager(),
                &TransactionDefinition::default(),
                &mut form,
                &[],
            )
            .await
        })
    };

    let (first_result, first_errors) = first.await.map_err(SaveError::backend)?;
    let winner = second.await.map_err(SaveError::backend)??;
    assert_eq!(winner, Entry { id: tm2.id, unique_value: 3 });

    let verror = expect_validation(first_result);
    assert_single_non_field_error(&verror, &first_errors);

    assert_eq!(store.get(tm1.id).await?.map(|e| e.unique_value), Some(1));
    assert_eq!(store.get(tm2.id).await?.map(|e| e.unique_value), Some(3));
    assert_eq!(store.count().await?, 2);
    Ok(())
}

/// A view-level conversion replaces the fallback message; the loser gets a
/// 200 redisplay showing it, the winner a redirect.
pub async fn test_view_override_redisplays_loser<S: EntryStore>(
    store: Arc<S>,
) -> SaveResult<()> {
    store.reset().await?;
    let existing = seed(&*store, 1).await?;
    let gate = Arc::new(Semaphore::new(0));

    let first = {
        let store = Arc::clone(&store);
        let hook = SaveHook::WaitFor(Arc::clone(&gate));
        tokio::spawn(async move {
            let view = CreateView::new("/").with_conversion(|_: &IntegrityError| {
                Some(ValidationError::new("poop"))
            });
            let mut form = EntryForm::create(&*store, "3").with_hook(hook);
            let response = view.post(store.manager(), &mut form).await;
            (response, form.errors().as_ul())
        })
    };
    let second = {
        let store = Arc::clone(&store);
        let hook = SaveHook::Signal(Arc::clone(&gate));
        tokio::spawn(async move {
            let view = UpdateView::new("/");
            let mut form = EntryForm::update(&*store, existing, "3").with_hook(hook);
            view.post(store.manager(), &mut form).await
        })
    };

    let (first_response, rendered) = first.await.map_err(SaveError::backend)?;
    let first_response = first_response?;
    assert_eq!(first_response, FormResponse::Invalid);
    assert_eq!(first_response.status_code(), 200);
    assert!(rendered.contains("errorlist"));
    assert!(rendered.contains("poop"));

    let second_response = second.await.map_err(SaveError::backend)??;
    assert_eq!(second_response.status_code(), 302);
    assert_eq!(second_response.location(), Some("/"));
    assert_eq!(store.count().await?, 1);
    Ok(())
}

/// Bad input never reaches the database.
pub async fn test_invalid_input_is_not_saved<S: EntryStore>(store: &S) -> SaveResult<()> {
    store.reset().await?;
    let view = CreateView::new("/");
    let mut form = EntryForm::create(store, "twelve");
    let response = view.post(store.manager(), &mut form).await?;
    assert_eq!(response, FormResponse::Invalid);
    assert_eq!(
        form.errors().get(UNIQUE_FIELD),
        Some(&["Enter a whole number.".to_string()][..])
    );
    assert_eq!(store.count().await?, 0);
    Ok(())
}

/// The backend reports enough about a unique violation for a field-level
/// message.
pub async fn test_unique_convertor_targets_field<S: EntryStore>(store: &S) -> SaveResult<()> {
    store.reset().await?;
    seed(store, 7).await?;
    let unique = UniqueFieldConvertor::new("Entry").column(UNIQUE_FIELD, UNIQUE_FIELD);

    let mut form = EntryForm::create(store, "7");
    assert!(form.is_valid());
    let err = transactional_save_form(
        store.manager(),
        &TransactionDefinition::default(),
        &mut form,
        &[&unique],
    )
    .await
    .expect_err("duplicate must be rejected");
    assert!(err.is_validation());
    assert_eq!(
        form.errors().get(UNIQUE_FIELD),
        Some(&["Entry with this Unique value already exists.".to_string()][..])
    );
    assert!(form.errors().non_field_errors().is_empty());
    assert_eq!(store.count().await?, 1);
    Ok(())
}

/// A constraint violation part way through a save discards the earlier
/// writes of that save.
pub async fn test_failed_save_rolls_back<S: EntryStore>(store: &S) -> SaveResult<()> {
    store.reset().await?;
    let result = store
        .manager()
        .execute(&TransactionDefinition::default(), |ctx| async move {
            store.insert(ctx, 5).await?;
            store.insert(ctx, 5).await
        })
        .await;
    match result {
        Err(SaveError::Integrity(e)) => assert_eq!(e.kind(), ConstraintKind::Unique),
        other => panic!("expected an integrity error, got {:?}", other),
    }
    assert_eq!(store.count().await?, 0);
    Ok(())
}

/// A default save inside an open transaction rolls back only its own writes:
/// the caller's earlier write survives and the caller can keep writing.
pub async fn test_nested_save_discards_only_its_own_writes<S: EntryStore>(
    store: &S,
) -> SaveResult<()> {
    store.reset().await?;
    let manager = store.manager();
    let mut errors = FormErrors::new();
    let errors_ref = &mut errors;
    manager
        .execute(&TransactionDefinition::default(), |ctx| async move {
            store.insert(ctx, 1).await?;
            let inner = transactional_save(
                manager,
                &TransactionDefinition::default(),
                errors_ref,
                &[],
                |ctx| async move {
                    store.insert(ctx, 2).await?;
                    store.insert(ctx, 1).await
                },
            )
            .await;
            assert!(
                matches!(inner, Err(SaveError::Validation(_))),
                "expected a validation error, got {:?}",
                inner
            );
            store.insert(ctx, 3).await?;
            Ok(())
        })
        .await?;
    assert_eq!(errors.non_field_errors().len(), 1);
    assert_eq!(store.count().await?, 2, "only the outer writes (1 and 3) commit");
    Ok(())
}


#[cfg(test)]
mod in_memory_store_tests {
    use super::*;
    use dbconstraints_core::transactions::DefaultTransactionManager;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemState {
        rows: Vec<Entry>,
        next_id: i64,
    }

    /// Unique-checking store without real transactions, so no rollback.
    #[derive(Default)]
    struct MemStore {
        state: Mutex<MemState>,
        manager: DefaultTransactionManager,
    }

    fn duplicate() -> SaveError {
        IntegrityError::unique("UNIQUE constraint failed: entries.unique_value")
            .with_table("entries")
            .with_columns([UNIQUE_FIELD])
            .into()
    }

    #[async_trait]
    impl EntryStore for MemStore {
        type Manager = DefaultTransactionManager;

        fn manager(&self) -> &Self::Manager {
            &self.manager
        }

        async fn reset(&self) -> SaveResult<()> {
            let mut g = self.state.lock().unwrap();
            g.rows.clear();
            Ok(())
        }

        async fn insert(
            &self,
            _ctx: TransactionContext<'_>,
            unique_value: i64,
        ) -> SaveResult<Entry> {
            let mut g = self.state.lock().unwrap();
            if g.rows.iter().any(|e| e.unique_value == unique_value) {
                return Err(duplicate());
            }
            g.next_id += 1;
            let entry = Entry {
                id: g.next_id,
                unique_value,
            };
            g.rows.push(entry.clone());
            Ok(entry)
        }

        async fn update(
            &self,
            _ctx: TransactionContext<'_>,
            id: i64,
            unique_value: i64,
        ) -> SaveResult<Entry> {
            let mut g = self.state.lock().unwrap();
            if g
                .rows
                .iter()
                .any(|e| e.id != id && e.unique_value == unique_value)
            {
                return Err(duplicate());
            }
            let row = g
                .rows
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(SaveError::NotFound)?;
            row.unique_value = unique_value;
            Ok(row.clone())
        }

        async fn get(&self, id: i64) -> SaveResult<Option<Entry>> {
            let g = self.state.lock().unwrap();
            Ok(g.rows.iter().find(|e| e.id == id).cloned())
        }

        async fn count(&self) -> SaveResult<i64> {
            Ok(self.state.lock().unwrap().rows.len() as i64)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_scenarios_run_with_in_memory_store() -> SaveResult<()> {
        test_concurrent_create_converts_loser(Arc::new(MemStore::default())).await?;
        test_concurrent_update_keeps_loser_unchanged(Arc::new(MemStore::default())).await?;
        test_view_override_redisplays_loser(Arc::new(MemStore::default())).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn form_scenarios_run_with_in_memory_store() -> SaveResult<()> {
        let store = MemStore::default();
        test_invalid_input_is_not_saved(&store).await?;
        test_unique_convertor_targets_field(&store).await?;
        Ok(())
    }

    #[tokio::test]
    async fn update_of_missing_entry_is_not_found() {
        let store = MemStore::default();
        let mut form = EntryForm::update(&store, Entry { id: 42, unique_value: 1 }, "2");
        assert!(form.is_valid());
        let err = transactional_save_form(
            store.manager(),
            &TransactionDefinition::default(),
            &mut form,
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SaveError::NotFound));
        assert!(form.errors().is_empty());
    }
}
