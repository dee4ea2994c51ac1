#![cfg(feature = "mysql-async")]

use dbconstraints_core::transactions::TransactionContext;
use dbconstraints_core::{SaveError, SaveResult};
use dbconstraints_mysql_async::{classify_error, MysqlAsyncTransactionManager};
use mysql_async::prelude::*;
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::mysql::Mysql;
use tests_common::{migrations, Entry, EntryStore};

// Quick check to see if Docker is available; if not, skip container tests gracefully.
fn containers_usable() -> bool {
    if skip_containers() {
        return false;
    }
    std::process::Command::new("docker")
        .arg("version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn skip_containers() -> bool {
    std::env::var("SKIP_CONTAINER_TESTS")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

async fn apply_migration(url: &str) -> SaveResult<()> {
    let pool = mysql_async::Pool::new(url);
    let mut conn = pool.get_conn().await.map_err(SaveError::backend)?;
    conn.query_drop(migrations::MYSQL_ENTRIES_SQL)
        .await
        .map_err(SaveError::backend)?;
    drop(conn);
    pool.disconnect().await.ok();
    Ok(())
}

/// Try to apply migration with small retries to accommodate server startup time.
async fn apply_migration_with_retry(url: &str) -> SaveResult<()> {
    for _ in 0..10 {
        if apply_migration(url).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    }
    Err(SaveError::backend_msg("migration failed after retries"))
}

/// Construct a working MySQL connection URL by trying a few common credential combos
/// used by popular MySQL container images.
async fn mysql_url_from_node(node: &ContainerAsync<Mysql>) -> SaveResult<String> {
    let host = "127.0.0.1";
    let port: u16 = node.get_host_port_ipv4(3306).await;
    // (user, pass, db)
    let candidates: &[(&str, &str, &str)] = &[
        ("mysql", "mysql", "mysql"),
        ("root", "root", "mysql"),
        ("root", "", "mysql"),
        ("test", "test", "mysql"),
    ];
    for (user, pass, db) in candidates {
        let url = if pass.is_empty() {
            format!("mysql://{user}@{host}:{port}/{db}")
        } else {
            format!("mysql://{user}:{pass}@{host}:{port}/{db}")
        };
        // Probe connectivity
        if mysql_async::Pool::new(url.as_str())
            .get_conn()
            .await
            .is_ok()
        {
            return Ok(url);
        }
    }
    Err(SaveError::backend_msg(
        "Unable to connect to MySQL container with known credentials",
    ))
}

/// A database to test against: `DBCONSTRAINTS_MYSQL_URL` when set,
/// otherwise a throwaway container.
struct MyHarness {
    url: String,
    _node: Option<ContainerAsync<Mysql>>,
}

async fn harness() -> SaveResult<Option<MyHarness>> {
    if let Ok(url) = std::env::var("DBCONSTRAINTS_MYSQL_URL") {
        apply_migration_with_retry(&url).await?;
        return Ok(Some(MyHarness { url, _node: None }));
    }
    if !containers_usable() {
        eprintln!("[integration] Skipping: Docker not available");
        return Ok(None);
    }
    let node = Mysql::default().start().await;
    let url = mysql_url_from_node(&node).await?;
    apply_migration_with_retry(&url).await?;
    Ok(Some(MyHarness {
        url,
        _node: Some(node),
    }))
}

struct MyEntryStore {
    manager: MysqlAsyncTransactionManager,
}

impl MyEntryStore {
    fn open(url: &str) -> Self {
        Self {
            manager: MysqlAsyncTransactionManager::from_url(url),
        }
    }

    async fn admin(&self) -> SaveResult<mysql_async::Conn> {
        self.manager
            .pool()
            .get_conn()
            .await
            .map_err(SaveError::backend)
    }
}

#[async_trait::async_trait]
impl EntryStore for MyEntryStore {
    type Manager = MysqlAsyncTransactionManager;

    fn manager(&self) -> &Self::Manager {
        &self.manager
    }

    async fn reset(&self) -> SaveResult<()> {
        let mut conn = self.admin().await?;
        conn.query_drop("DELETE FROM entries")
            .await
            .map_err(SaveError::backend)
    }

    async fn insert(&self, ctx: TransactionContext<'_>, unique_value: i64) -> SaveResult<Entry> {
        let conn = self.manager.connection(ctx).await?;
        let mut conn = conn.lock().await;
        conn.exec_drop(
            "INSERT INTO entries (unique_value) VALUES (?)",
            (unique_value,),
        )
        .await
        .map_err(classify_error)?;
        let id = conn
            .last_insert_id()
            .ok_or_else(|| SaveError::backend_msg("no insert id reported"))?;
        Ok(Entry {
            id: id as i64,
            unique_value,
        })
    }

    async fn update(
        &self,
        ctx: TransactionContext<'_>,
        id: i64,
        unique_value: i64,
    ) -> SaveResult<Entry> {
        let conn = self.manager.connection(ctx).await?;
        let mut conn = conn.lock().await;
        conn.exec_drop(
            "UPDATE entries SET unique_value = ? WHERE id = ?",
            (unique_value, id),
        )
        .await
        .map_err(classify_error)?;
        if conn.affected_rows() == 0 {
            // MySQL reports 0 for an unchanged row too; confirm it exists.
            let found: Option<i64> = conn
                .exec_first("SELECT id FROM entries WHERE id = ?", (id,))
                .await
                .map_err(SaveError::backend)?;
            if found.is_none() {
                return Err(SaveError::NotFound);
            }
        }
        Ok(Entry { id, unique_value })
    }

    async fn get(&self, id: i64) -> SaveResult<Option<Entry>> {
        let mut conn = self.admin().await?;
        let row: Option<(i64, i64)> = conn
            .exec_first("SELECT id, unique_value FROM entries WHERE id = ?", (id,))
            .await
            .map_err(SaveError::backend)?;
        Ok(row.map(|(id, unique_value)| Entry { id, unique_value }))
    }

    async fn count(&self) -> SaveResult<i64> {
        let mut conn = self.admin().await?;
        let n: Option<i64> = conn
            .query_first("SELECT COUNT(*) FROM entries")
            .await
            .map_err(SaveError::backend)?;
        Ok(n.unwrap_or(0))
    }
}

#[ignore]
#[tokio::test(flavor = "multi_thread")]
async fn mysql_concurrent_saves_convert_loser() -> SaveResult<()> {
    let Some(h) = harness().await? else {
        return Ok(());
    };
    let store = Arc::new(MyEntryStore::open(&h.url));
    tests_common::test_concurrent_create_converts_loser(Arc::clone(&store)).await?;
    tests_common::test_concurrent_update_keeps_loser_unchanged(Arc::clone(&store)).await?;
    tests_common::test_view_override_redisplays_loser(store).await?;
    Ok(())
}

#[ignore]
#[tokio::test(flavor = "multi_thread")]
async fn mysql_form_scenarios() -> SaveResult<()> {
    let Some(h) = harness().await? else {
        return Ok(());
    };
    let store = MyEntryStore::open(&h.url);
    tests_common::test_invalid_input_is_not_saved(&store).await?;
    tests_common::test_unique_convertor_targets_field(&store).await?;
    tests_common::test_failed_save_rolls_back(&store).await?;
    Ok(())
}

#[ignore]
#[tokio::test(flavor = "multi_thread")]
async fn mysql_nested_save_discards_only_its_own_writes() -> SaveResult<()> {
    let Some(h) = harness().await? else {
        return Ok(());
    };
    let store = MyEntryStore::open(&h.url);
    tests_common::test_nested_save_discards_only_its_own_writes(&store).await
}
