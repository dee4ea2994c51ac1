#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "mysql-async"),
    doc = "This crate provides a mysql_async transaction manager. Enable feature `mysql-async` to use it."
)]

use dbconstraints_core::{ConstraintKind, IntegrityError};

/// SQLSTATE shared by all MySQL integrity constraint violations.
pub const INTEGRITY_SQLSTATE: &str = "23000";

fn between<'s>(s: &'s str, start: &str, end: char) -> Option<&'s str> {
    let from = s.find(start)? + start.len();
    let len = s[from..].find(end)?;
    Some(&s[from..from + len])
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches('`')
}

/// The key name in `Duplicate entry '...' for key 'table.key'`, without the
/// table prefix MySQL 8 adds.
fn duplicate_key(message: &str) -> Option<&str> {
    let at = message.rfind("for key '")? + "for key '".len();
    let key = message[at..].trim_end().strip_suffix('\'')?;
    Some(key.rsplit('.').next().unwrap_or(key))
}

/// Classify a MySQL server error (`code`, SQLSTATE, message) as an
/// integrity error.
///
/// Unique violations report the violated index as both constraint and
/// column; single-column `UNIQUE` indexes are named after their column.
pub fn classify_server_error(code: u16, state: &str, message: &str) -> Option<IntegrityError> {
    let error = match code {
        1062 | 1586 => match duplicate_key(message) {
            Some("PRIMARY") => {
                IntegrityError::new(ConstraintKind::PrimaryKey, message).with_constraint("PRIMARY")
            }
            Some(key) => IntegrityError::new(ConstraintKind::Unique, message)
                .with_constraint(key)
                .with_columns([key]),
            None => IntegrityError::new(ConstraintKind::Unique, message),
        },
        1022 | 1169 => IntegrityError::new(ConstraintKind::Unique, message),
        1216 | 1217 | 1451 | 1452 => {
            let mut e = IntegrityError::new(ConstraintKind::ForeignKey, message);
            if let Some(table) = between(message, "fails (", ',') {
                e = e.with_table(unquote(table.rsplit('.').next().unwrap_or(table)));
            }
            if let Some(name) = between(message, "CONSTRAINT `", '`') {
                e = e.with_constraint(name);
            }
            if let Some(cols) = between(message, "FOREIGN KEY (", ')') {
                e = e.with_columns(cols.split(',').map(unquote));
            }
            e
        }
        1048 => {
            let e = IntegrityError::new(ConstraintKind::NotNull, message);
            match between(message, "Column '", '\'') {
                Some(col) => e.with_columns([col]),
                None => e,
            }
        }
        3819 => {
            let e = IntegrityError::new(ConstraintKind::Check, message);
            match between(message, "constraint '", '\'') {
                Some(name) => e.with_constraint(name),
                None => e,
            }
        }
        // MariaDB: CONSTRAINT `name` failed for `db`.`table`
        4025 => {
            let e = IntegrityError::new(ConstraintKind::Check, message);
            match between(message, "CONSTRAINT `", '`') {
                Some(name) => e.with_constraint(name),
                None => e,
            }
        }
        _ if state == INTEGRITY_SQLSTATE => IntegrityError::new(ConstraintKind::Other, message),
        _ => return None,
    };
    Some(error)
}

#[cfg(feature = "mysql-async")]
mod backend {
    use super::classify_server_error;
    use async_trait::async_trait;
    use dbconstraints_core::transactions::{
        Isolation, Propagation, TransactionContext, TransactionDefinition, TransactionManager,
    };
    use dbconstraints_core::{SaveError, SaveResult};
    use mysql_async::{prelude::*, Conn, Pool};
    use std::cell::RefCell;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::Mutex;

    #[cfg(feature = "tracing")]
    use tracing::{info, warn};

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                backend = "mysql",
                op = op,
                elapsed_ms = elapsed,
                success = success,
                "tx op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("tx_ops_total", 1, "backend" => "mysql", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("tx_op_duration_ms", elapsed as f64, "backend" => "mysql", "op" => op.to_string());
        }
    }

    /// Map a mysql_async error to a [`SaveError`]: constraint violations
    /// reported by the server become `SaveError::Integrity`, everything else
    /// `SaveError::Backend`.
    pub fn classify_error(e: mysql_async::Error) -> SaveError {
        let found = match &e {
            mysql_async::Error::Server(server) => {
                classify_server_error(server.code, &server.state, &server.message)
            }
            _ => None,
        };
        match found {
            Some(ierror) => SaveError::Integrity(ierror.with_source(e)),
            None => SaveError::backend(e),
        }
    }

    // Task-local storage for a transaction-bound connection and savepoint depth.
    tokio::task_local! {
        static MY_TX_CONN: RefCell<Option<Arc<Mutex<Conn>>>>;
        static MY_SP_DEPTH: RefCell<usize>;
    }

    fn isolation_sql(isolation: Isolation) -> Option<&'static str> {
        match isolation {
            Isolation::Default => None,
            Isolation::ReadCommitted => Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            Isolation::RepeatableRead => Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            Isolation::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        }
    }

    /// A concrete TransactionManager for mysql_async using a single connection per transaction.
    #[derive(Clone, Debug)]
    pub struct MysqlAsyncTransactionManager {
        pool: Pool,
    }

    impl MysqlAsyncTransactionManager {
        pub fn new(pool: Pool) -> Self {
            Self { pool }
        }

        pub fn from_url(database_url: &str) -> Self {
            Self::new(Pool::new(database_url))
        }

        pub fn pool(&self) -> &Pool {
            &self.pool
        }

        /// The connection bound to the current transaction if one is active,
        /// otherwise a pooled autocommit connection.
        pub async fn connection(
            &self,
            _ctx: TransactionContext<'_>,
        ) -> SaveResult<Arc<Mutex<Conn>>> {
            if let Ok(Some(conn)) = MY_TX_CONN.try_with(|c| c.borrow().as_ref().cloned()) {
                return Ok(conn);
            }
            let conn = self.pool.get_conn().await.map_err(SaveError::backend)?;
            Ok(Arc::new(Mutex::new(conn)))
        }
    }

    #[async_trait]
    impl TransactionManager for MysqlAsyncTransactionManager {
        fn in_transaction(&self) -> bool {
            MY_TX_CONN
                .try_with(|c| c.borrow().is_some())
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
            // Wrap in TLS scopes if needed
            let not_initialized = MY_TX_CONN.try_with(|_| ()).is_err();
            let run = async {
                let start = Instant::now();
                let mut created_tx = false;
                let mut used_savepoint = false;
                let current = MY_TX_CONN
                    .try_with(|c| c.borrow().as_ref().cloned())
                    .ok()
                    .flatten();
                let in_tx = current.is_some();

                if !def.starts_transaction() && !in_tx {
                    return f(TransactionContext::new()).await;
                }
                if matches!(def.propagation, Propagation::Never) && in_tx {
                    return Err(SaveError::backend_msg(
                        "Transaction exists but Propagation::Never requested",
                    ));
                }

                let arc = match current {
                    Some(arc) => arc,
                    None => {
                        let mut conn = self.pool.get_conn().await.map_err(SaveError::backend)?;
                        // SET TRANSACTION applies to the next transaction only.
                        if let Some(sql) = isolation_sql(def.isolation) {
                            conn.query_drop(sql).await.ok();
                        }
                        if let Some(to) = def.timeout {
                            conn.query_drop(format!(
                                "SET SESSION innodb_lock_wait_timeout = {}",
                                to.as_secs().max(1)
                            ))
                            .await
                            .ok();
                        }
                        let begin = if def.read_only {
                            "START TRANSACTION READ ONLY"
                        } else {
                            "START TRANSACTION"
                        };
                        conn.query_drop(begin).await.map_err(classify_error)?;

                        let arc = Arc::new(Mutex::new(conn));
                        MY_TX_CONN.with(|cell| {
                            *cell.borrow_mut() = Some(arc.clone());
                        });
                        MY_SP_DEPTH.with(|d| *d.borrow_mut() = 0);
                        created_tx = true;
                        arc
                    }
                };

                if !created_tx
                    && matches!(
                        def.propagation,
                        Propagation::RequiresNew | Propagation::Nested
                    )
                {
                    let mut conn = arc.lock().await;
                    let depth = MY_SP_DEPTH.with(|d| *d.borrow());
                    let name = format!("sp{}", depth + 1);
                    conn.query_drop(format!("SAVEPOINT {}", name))
                        .await
                        .map_err(classify_error)?;
                    MY_SP_DEPTH.with(|d| *d.borrow_mut() += 1);
                    used_savepoint = true;
                }

                let mut result = f(TransactionContext::new()).await;

                if created_tx {
                    MY_TX_CONN.with(|c| {
                        c.borrow_mut().take();
                    });
                    let mut conn = arc.lock().await;
                    if result.is_ok() {
                        if let Err(e) = conn.query_drop("COMMIT").await {
                            conn.query_drop("ROLLBACK").await.ok();
                            result = Err(classify_error(e));
                        }
                    } else if let Err(_e) = conn.query_drop("ROLLBACK").await {
                        #[cfg(feature = "tracing")]
                        {
                            warn!(error = %_e, "rollback failed");
                        }
                    }
                } else if used_savepoint {
                    let mut conn = arc.lock().await;
                    let name = MY_SP_DEPTH.with(|d| format!("sp{}", *d.borrow()));
                    if result.is_ok() {
                        conn.query_drop(format!("RELEASE SAVEPOINT {}", name))
                            .await
                            .ok();
                    } else {
                        conn.query_drop(format!("ROLLBACK TO SAVEPOINT {}", name))
                            .await
                            .ok();
                    }
                    MY_SP_DEPTH.with(|d| {
                        let mut b = d.borrow_mut();
                        if *b > 0 {
                            *b -= 1;
                        }
                    });
                }

                obs_record("execute", start, result.is_ok());
                result
            };

            if not_initialized {
                MY_TX_CONN
                    .scope(RefCell::new(None), async move {
                        MY_SP_DEPTH.scope(RefCell::new(0usize), run).await
                    })
                    .await
            } else {
                run.await
            }
        }
    }
}

#[cfg(feature = "mysql-async")]
pub use backend::{classify_error, MysqlAsyncTransactionManager};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_entry_names_key_as_column() {
        let e = classify_server_error(
            1062,
            "23000",
            "Duplicate entry '1' for key 'entries.unique_value'",
        )
        .expect("integrity error");
        assert_eq!(e.kind(), ConstraintKind::Unique);
        assert_eq!(e.constraint(), Some("unique_value"));
        assert_eq!(e.columns(), &["unique_value".to_string()]);
        assert_eq!(e.to_string(), "Duplicate entry '1' for key 'entries.unique_value'");
    }

    #[test]
    fn duplicate_entry_without_table_prefix() {
        let e =
            classify_server_error(1062, "23000", "Duplicate entry 'a'b' for key 'code'").unwrap();
        assert_eq!(e.columns(), &["code".to_string()]);
    }

    #[test]
    fn duplicate_primary_key() {
        let e = classify_server_error(
            1062,
            "23000",
            "Duplicate entry '7' for key 'entries.PRIMARY'",
        )
        .unwrap();
        assert_eq!(e.kind(), ConstraintKind::PrimaryKey);
        assert!(e.columns().is_empty());
    }

    #[test]
    fn foreign_key_failure_is_parsed() {
        let msg = "Cannot add or update a child row: a foreign key constraint fails \
                   (`app`.`child`, CONSTRAINT `child_parent_fk` FOREIGN KEY (`parent_id`) \
                   REFERENCES `parent` (`id`))";
        let e = classify_server_error(1452, "23000", msg).unwrap();
        assert_eq!(e.kind(), ConstraintKind::ForeignKey);
        assert_eq!(e.table(), Some("child"));
        assert_eq!(e.constraint(), Some("child_parent_fk"));
        assert_eq!(e.columns(), &["parent_id".to_string()]);
    }

    #[test]
    fn not_null_and_check() {
        let nn =
            classify_server_error(1048, "23000", "Column 'unique_value' cannot be null").unwrap();
        assert_eq!(nn.kind(), ConstraintKind::NotNull);
        assert_eq!(nn.columns(), &["unique_value".to_string()]);

        let ck = classify_server_error(3819, "HY000", "Check constraint 'positive' is violated.")
            .unwrap();
        assert_eq!(ck.kind(), ConstraintKind::Check);
        assert_eq!(ck.constraint(), Some("positive"));

        let maria = classify_server_error(
            4025,
            "23000",
            "CONSTRAINT `positive` failed for `app`.`entries`",
        )
        .unwrap();
        assert_eq!(maria.constraint(), Some("positive"));
    }

    #[test]
    fn integrity_state_without_known_code_is_other() {
        let e = classify_server_error(9999, "23000", "something constrained").unwrap();
        assert_eq!(e.kind(), ConstraintKind::Other);
    }

    #[test]
    fn unrelated_server_errors_pass() {
        assert!(
            classify_server_error(1213, "40001", "Deadlock found when trying to get lock").is_none()
        );
        assert!(classify_server_error(1146, "42S02", "Table 'app.nope' doesn't exist").is_none());
    }
}
