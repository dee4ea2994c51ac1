#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "libsql-backend"),
    doc = "Enable feature `libsql-backend` to use this adapter."
)]

use dbconstraints_core::{ConstraintKind, IntegrityError};

/// Primary SQLite result code for constraint violations.
pub const SQLITE_CONSTRAINT: i32 = 19;

// Extended result codes: (code, kind).
const EXTENDED_CODES: &[(i32, ConstraintKind)] = &[
    (275, ConstraintKind::Check),
    (787, ConstraintKind::ForeignKey),
    (1299, ConstraintKind::NotNull),
    (1555, ConstraintKind::PrimaryKey),
    (2067, ConstraintKind::Unique),
    (2579, ConstraintKind::PrimaryKey),
];

// Message prefixes SQLite uses, checked in order.
const MESSAGE_KINDS: &[(&str, ConstraintKind)] = &[
    ("UNIQUE constraint failed", ConstraintKind::Unique),
    ("NOT NULL constraint failed", ConstraintKind::NotNull),
    ("FOREIGN KEY constraint failed", ConstraintKind::ForeignKey),
    ("CHECK constraint failed", ConstraintKind::Check),
];

/// Classify a SQLite failure (result code + message) as an integrity error.
///
/// Returns `None` when the code is not `SQLITE_CONSTRAINT` (primary or
/// extended) and the message does not read like a constraint failure.
pub fn classify_sqlite_failure(code: i32, message: &str) -> Option<IntegrityError> {
    let by_code = code & 0xff == SQLITE_CONSTRAINT;
    let by_message = MESSAGE_KINDS
        .iter()
        .find_map(|(needle, kind)| message.find(needle).map(|pos| (pos + needle.len(), *kind)));
    if !by_code && by_message.is_none() {
        return None;
    }

    let kind = EXTENDED_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, k)| *k)
        .or(by_message.map(|(_, k)| k))
        .unwrap_or(ConstraintKind::Other);
    let mut error = IntegrityError::new(kind, message.trim().trim_matches('`'));

    let Some((detail_at, _)) = by_message else {
        return Some(error);
    };
    let detail = message[detail_at..]
        .trim_start_matches(':')
        .trim()
        .trim_end_matches('`')
        .trim();
    if detail.is_empty() {
        return Some(error);
    }
    if matches!(kind, ConstraintKind::Check) {
        return Some(error.with_constraint(detail));
    }
    // "table.col" or "table.a, table.b"
    let mut table = None;
    let mut columns = Vec::new();
    for part in detail.split(',').map(str::trim) {
        match part.split_once('.') {
            Some((t, c)) => {
                table.get_or_insert_with(|| t.to_string());
                columns.push(c.to_string());
            }
            None => columns.push(part.to_string()),
        }
    }
    if let Some(t) = table {
        error = error.with_table(t);
    }
    Some(error.with_columns(columns))
}

#[cfg(feature = "libsql-backend")]
mod backend {
    use super::classify_sqlite_failure;
    use dbconstraints_core::transactions::{
        Isolation, Propagation, TransactionContext, TransactionDefinition, TransactionManager,
    };
    use dbconstraints_core::{SaveError, SaveResult};
    use libsql::{Connection, Database};
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::time::Instant;

    #[cfg(feature = "tracing")]
    use tracing::{info, warn};

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                backend = "libsql",
                op = op,
                elapsed_ms = elapsed,
                success = success,
                "tx op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("tx_ops_total", 1, "backend" => "libsql", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("tx_op_duration_ms", elapsed as f64, "backend" => "libsql", "op" => op.to_string());
        }
    }

    /// Map a libsql error to a [`SaveError`]: constraint violations become
    /// `SaveError::Integrity`, everything else `SaveError::Backend`.
    pub fn classify_error(e: libsql::Error) -> SaveError {
        let found = match &e {
            libsql::Error::SqliteFailure(code, msg) => classify_sqlite_failure(*code, msg),
            other => {
                let text = other.to_string();
                if text.contains("constraint failed") {
                    classify_sqlite_failure(super::SQLITE_CONSTRAINT, &text)
                } else {
                    None
                }
            }
        };
        match found {
            Some(ierror) => SaveError::Integrity(ierror.with_source(e)),
            None => SaveError::backend(e),
        }
    }

    // Task-local state for current transaction connection and savepoint depth.
    tokio::task_local! {
        static TX_STACK: RefCell<Vec<Connection>>;
        static SP_DEPTH: RefCell<usize>;
    }

    fn begin_sql(isolation: Isolation) -> &'static str {
        match isolation {
            Isolation::Default | Isolation::ReadCommitted => "BEGIN DEFERRED",
            Isolation::RepeatableRead => "BEGIN IMMEDIATE",
            Isolation::Serializable => "BEGIN EXCLUSIVE",
        }
    }

    /// A concrete TransactionManager for libsql/SQLite.
    #[derive(Clone)]
    pub struct LibsqlTransactionManager {
        db: Arc<Database>,
    }

    impl LibsqlTransactionManager {
        pub fn new(db: Arc<Database>) -> Self {
            Self { db }
        }

        pub fn database(&self) -> &Arc<Database> {
            &self.db
        }

        /// The connection bound to the current transaction if one is active,
        /// otherwise a fresh autocommit connection.
        pub fn connection(&self, _ctx: TransactionContext<'_>) -> SaveResult<Connection> {
            match TX_STACK
                .try_with(|cell| cell.borrow().last().cloned())
                .ok()
                .flatten()
            {
                Some(conn) => Ok(conn),
                None => self.db.connect().map_err(SaveError::backend),
            }
        }
    }

    impl std::fmt::Debug for LibsqlTransactionManager {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LibsqlTransactionManager").finish_non_exhaustive()
        }
    }

    #[async_trait::async_trait]
    impl TransactionManager for LibsqlTransactionManager {
        fn in_transaction(&self) -> bool {
            TX_STACK
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
            let fut = async {
                let start = Instant::now();
                let mut created_tx = false;
                let mut used_savepoint = false;

                let active = TX_STACK
                    .try_with(|cell| !cell.borrow().is_empty())
                    .unwrap_or(false);

                if !def.starts_transaction() && !active {
                    return f(TransactionContext::new()).await;
                }
                if matches!(def.propagation, Propagation::Never) && active {
                    return Err(SaveError::backend_msg(
                        "Transaction exists but Propagation::Never requested",
                    ));
                }

                let conn = match TX_STACK
                    .try_with(|cell| cell.borrow().last().cloned())
                    .ok()
                    .flatten()
                {
                    Some(c) if active => c,
                    _ => self.db.connect().map_err(SaveError::backend)?,
                };

                if !active {
                    if def.read_only {
                        conn.execute("PRAGMA query_only = ON", ()).await.ok();
                    }
                    // Wait for competing writers instead of failing with SQLITE_BUSY right away.
                    let busy_ms = def.timeout.map(|d| d.as_millis() as i64).unwrap_or(1000);
                    conn.query(&format!("PRAGMA busy_timeout = {}", busy_ms), ())
                        .await
                        .ok();
                    conn.execute(begin_sql(def.isolation), ())
                        .await
                        .map_err(classify_error)?;
                    TX_STACK.with(|cell| cell.borrow_mut().push(conn.clone()));
                    SP_DEPTH.with(|d| *d.borrow_mut() = 0);
                    created_tx = true;
                } else if matches!(
                    def.propagation,
                    Propagation::RequiresNew | Propagation::Nested
                ) {
                    let depth = SP_DEPTH.with(|d| *d.borrow());
                    let name = format!("sp{}", depth + 1);
                    conn.execute(&format!("SAVEPOINT {}", name), ())
                        .await
                        .map_err(classify_error)?;
                    SP_DEPTH.with(|d| *d.borrow_mut() += 1);
                    used_savepoint = true;
                }

                let mut result = f(TransactionContext::new()).await;

                if created_tx {
                    if result.is_ok() {
                        // Deferred constraints are checked here; a failed COMMIT
                        // leaves the transaction open, so roll it back.
                        if let Err(e) = conn.execute("COMMIT", ()).await {
                            conn.execute("ROLLBACK", ()).await.ok();
                            result = Err(classify_error(e));
                        }
                    } else if let Err(_e) = conn.execute("ROLLBACK", ()).await {
                        #[cfg(feature = "tracing")]
                        {
                            warn!(error = %_e, "rollback failed");
                        }
                    }
                    if def.read_only {
                        conn.execute("PRAGMA query_only = OFF", ()).await.ok();
                    }
                    TX_STACK.with(|cell| {
                        let _ = cell.borrow_mut().pop();
                    });
                } else if used_savepoint {
                    let name = SP_DEPTH.with(|d| format!("sp{}", *d.borrow()));
                    if result.is_ok() {
                        conn.execute(&format!("RELEASE SAVEPOINT {}", name), ())
                            .await
                            .ok();
                    } else {
                        conn.execute(&format!("ROLLBACK TO SAVEPOINT {}", name), ())
                            .await
                            .ok();
                        conn.execute(&format!("RELEASE SAVEPOINT {}", name), ())
                            .await
                            .ok();
                    }
                    SP_DEPTH.with(|d| {
                        let mut b = d.borrow_mut();
                        if *b > 0 {
                            *b -= 1;
                        }
                    });
                }

                obs_record("execute", start, result.is_ok());
                result
            };

            // If the task-local TX_STACK isn't initialized for this task, set up scopes and run.
            let not_initialized = TX_STACK.try_with(|_| ()).is_err();
            if not_initialized {
                TX_STACK
                    .scope(RefCell::new(Vec::new()), async move {
                        SP_DEPTH.scope(RefCell::new(0usize), fut).await
                    })
                    .await
            } else {
                fut.await
            }
        }
    }
}

#[cfg(feature = "libsql-backend")]
pub use backend::{classify_error, LibsqlTransactionManager};
