#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "postgres-backend"),
    doc = "Enable feature `postgres-backend` to use this adapter."
)]

use dbconstraints_core::{ConstraintKind, IntegrityError};

/// Map an SQLSTATE to a constraint kind. Only class 23 (integrity
/// constraint violation) codes are recognised.
pub fn constraint_kind(sqlstate: &str) -> Option<ConstraintKind> {
    let kind = match sqlstate {
        "23505" => ConstraintKind::Unique,
        "23503" | "23001" => ConstraintKind::ForeignKey,
        "23502" => ConstraintKind::NotNull,
        "23514" => ConstraintKind::Check,
        "23P01" => ConstraintKind::Exclusion,
        s if s.starts_with("23") => ConstraintKind::Other,
        _ => return None,
    };
    Some(kind)
}

/// Column names from a server DETAIL line such as
/// `Key (a, b)=(1, 2) already exists.`
pub fn parse_key_detail(detail: &str) -> Vec<String> {
    let Some(rest) = detail.trim().strip_prefix("Key (") else {
        return Vec::new();
    };
    let Some(end) = rest.find(")=(") else {
        return Vec::new();
    };
    rest[..end]
        .split(',')
        .map(|c| c.trim().trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Build an [`IntegrityError`] from the fields of a server error report.
///
/// The message reads like the server's, with the DETAIL line appended.
/// Unique violations on a `*_pkey` constraint are reported as
/// [`ConstraintKind::PrimaryKey`].
pub fn classify_sqlstate(
    sqlstate: &str,
    message: &str,
    detail: Option<&str>,
    table: Option<&str>,
    column: Option<&str>,
    constraint: Option<&str>,
) -> Option<IntegrityError> {
    let mut kind = constraint_kind(sqlstate)?;
    if kind == ConstraintKind::Unique && constraint.is_some_and(|c| c.ends_with("_pkey")) {
        kind = ConstraintKind::PrimaryKey;
    }
    let text = match detail {
        Some(d) => format!("{message}\nDETAIL:  {d}"),
        None => message.to_string(),
    };
    let mut error = IntegrityError::new(kind, text);
    if let Some(t) = table {
        error = error.with_table(t);
    }
    if let Some(c) = constraint {
        error = error.with_constraint(c);
    }
    let columns = match column {
        Some(c) => vec![c.to_string()],
        None => detail.map(parse_key_detail).unwrap_or_default(),
    };
    Some(error.with_columns(columns))
}

#[cfg(feature = "postgres-backend")]
mod backend {
    use super::classify_sqlstate;
    use async_trait::async_trait;
    use dbconstraints_core::transactions::{
        Isolation, Propagation, TransactionContext, TransactionDefinition, TransactionManager,
    };
    use dbconstraints_core::{SaveError, SaveResult};
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio_postgres::{Client, NoTls};

    #[cfg(feature = "tracing")]
    use tracing::{info, warn};

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                backend = "postgres",
                op = op,
                elapsed_ms = elapsed,
                success = success,
                "tx op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("tx_ops_total", 1, "backend" => "postgres", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("tx_op_duration_ms", elapsed as f64, "backend" => "postgres", "op" => op.to_string());
        }
    }

    /// Map a tokio-postgres error to a [`SaveError`]: class 23 server errors
    /// become `SaveError::Integrity`, everything else `SaveError::Backend`.
    pub fn classify_error(e: tokio_postgres::Error) -> SaveError {
        let found = e.as_db_error().and_then(|db| {
            classify_sqlstate(
                db.code().code(),
                db.message(),
                db.detail(),
                db.table(),
                db.column(),
                db.constraint(),
            )
        });
        match found {
            Some(ierror) => SaveError::Integrity(ierror.with_source(e)),
            None => SaveError::backend(e),
        }
    }

    // Task-local state for current transaction client and savepoint depth.
    tokio::task_local! {
        static PG_TX_STACK: RefCell<Vec<Arc<Client>>>;
        static PG_SP_DEPTH: RefCell<usize>;
    }

    fn isolation_sql(isolation: Isolation) -> Option<&'static str> {
        match isolation {
            Isolation::Default => None,
            Isolation::ReadCommitted => Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            Isolation::RepeatableRead => Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            Isolation::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        }
    }

    /// Concrete TransactionManager for Postgres.
    #[derive(Clone, Debug)]
    pub struct TokioPostgresTransactionManager {
        conn_str: String,
    }

    impl TokioPostgresTransactionManager {
        pub fn new<S: Into<String>>(conn_str: S) -> Self {
            Self {
                conn_str: conn_str.into(),
            }
        }

        async fn connect(&self) -> SaveResult<Client> {
            let (client, connection) = tokio_postgres::connect(&self.conn_str, NoTls)
                .await
                .map_err(SaveError::backend)?;
            tokio::spawn(async move {
                if let Err(_e) = connection.await {
                    #[cfg(feature = "tracing")]
                    {
                        warn!(error = %_e, "postgres connection error");
                    }
                }
            });
            Ok(client)
        }

        /// The client bound to the current transaction if one is active,
        /// otherwise a freshly connected autocommit client.
        pub async fn client(&self, _ctx: TransactionContext<'_>) -> SaveResult<Arc<Client>> {
            if let Ok(Some(client)) = PG_TX_STACK.try_with(|cell| cell.borrow().last().cloned()) {
                return Ok(client);
            }
            Ok(Arc::new(self.connect().await?))
        }
    }

    #[async_trait]
    impl TransactionManager for TokioPostgresTransactionManager {
        fn in_transaction(&self) -> bool {
            PG_TX_STACK
                .try_with(|cell| !cell.borrow().is_empty())
                .unwrap_or(false)
        }

        async fn execute<'a, R, F, Fut>(
            &'a self,
            def: &TransactionDefinition,
            f: F,
        ) -> SaveResult<R>
        where
            F: FnOnce(TransactionContext<'a>) -> Fut + Send + 'a,
            Fut: core::future::Future<Output = SaveResult<R>> + Send + 'a,
            R: Send + 'a,
        {
            // Core logic in async block, executed within task-local scopes if necessary
            let fut = async {
                let start = Instant::now();
                let mut created_tx = false;
                let mut used_savepoint = false;
                let current = PG_TX_STACK
                    .try_with(|cell| cell.borrow().last().cloned())
                    .ok()
                    .flatten();
                let active = current.is_some();

                if !def.starts_transaction() && !active {
                    return f(TransactionContext::new()).await;
                }
                if matches!(def.propagation, Propagation::Never) && active {
                    return Err(SaveError::backend_msg(
                        "Transaction exists but Propagation::Never requested",
                    ));
                }

                let client = match current {
                    Some(c) => c,
                    None => Arc::new(self.connect().await?),
                };

                if !active {
                    client
                        .batch_execute("BEGIN")
                        .await
                        .map_err(classify_error)?;
                    if let Some(sql) = isolation_sql(def.isolation) {
                        client.batch_execute(sql).await.ok();
                    }
                    if def.read_only {
                        client
                            .batch_execute("SET TRANSACTION READ ONLY")
                            .await
                            .ok();
                    }
                    if let Some(to) = def.timeout {
                        // Bounds both lock waits and statement runtime.
                        client
                            .batch_execute(&format!(
                                "SET LOCAL statement_timeout = '{}ms'",
                                to.as_millis()
                            ))
                            .await
                            .ok();
                    }
                    PG_TX_STACK.with(|cell| cell.borrow_mut().push(client.clone()));
                    PG_SP_DEPTH.with(|d| *d.borrow_mut() = 0);
                    created_tx = true;
                } else if matches!(
                    def.propagation,
                    Propagation::RequiresNew | Propagation::Nested
                ) {
                    let depth = PG_SP_DEPTH.with(|d| *d.borrow());
                    let name = format!("sp{}", depth + 1);
                    client
                        .batch_execute(&format!("SAVEPOINT {}", name))
                        .await
                        .map_err(classify_error)?;
                    PG_SP_DEPTH.with(|d| *d.borrow_mut() += 1);
                    used_savepoint = true;
                }

                let mut result = f(TransactionContext::new()).await;

                if created_tx {
                    if result.is_ok() {
                        // Deferred constraints fire here; the server rolls back on failure.
                        if let Err(e) = client.batch_execute("COMMIT").await {
                            result = Err(classify_error(e));
                        }
                    } else if let Err(_e) = client.batch_execute("ROLLBACK").await {
                        #[cfg(feature = "tracing")]
                        {
                            warn!(error = %_e, "rollback failed");
                        }
                    }
                    PG_TX_STACK.with(|cell| {
                        let _ = cell.borrow_mut().pop();
                    });
                } else if used_savepoint {
                    let name = PG_SP_DEPTH.with(|d| format!("sp{}", *d.borrow()));
                    if result.is_ok() {
                        client
                            .batch_execute(&format!("RELEASE SAVEPOINT {}", name))
                            .await
                            .ok();
                    } else {
                        client
                            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
                            .await
                            .ok();
                    }
                    PG_SP_DEPTH.with(|d| {
                        let mut b = d.borrow_mut();
                        if *b > 0 {
                            *b -= 1;
                        }
                    });
                }

                obs_record("execute", start, result.is_ok());
                result
            };

            // Initialize task-local scopes if needed
            let not_initialized = PG_TX_STACK.try_with(|_| ()).is_err();
            if not_initialized {
                PG_TX_STACK
                    .scope(RefCell::new(Vec::new()), async move {
                        PG_SP_DEPTH.scope(RefCell::new(0usize), fut).await
                    })
                    .await
            } else {
                fut.await
            }
        }
    }
}

#[cfg(feature = "postgres-backend")]
pub use backend::{classify_error, TokioPostgresTransactionManager};
