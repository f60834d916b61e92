//! Integration tests for Transaction (C5) and Query (C6), exercising implicit-transaction
//! inference, explicit begin/commit/rollback, auto-rollback on drop, and the `page()`
//! stash/restore discipline — all against a fake in-memory backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::{Params, Row, Value};

use mysql_rw_pool::connector::{Connection, Exec, Manager, Role};
use mysql_rw_pool::error::Error;
use mysql_rw_pool::pool::Pool;
use mysql_rw_pool::query::Query;
use mysql_rw_pool::task_context::scope;
use mysql_rw_pool::transaction::Transaction;
use mysql_rw_pool::{PoolConfig, SqlBuilder};

/// A single-column row holding a `count(*)` result.
fn count_row(n: u64) -> Row {
    mysql_common::row::new_row(vec![Value::UInt(n)], Arc::from(Vec::<mysql_common::Column>::new()))
}

/// A Connection whose `query` records every statement it was asked to run, for assertions, and
/// answers a canned row count for anything that looks like `count(*)`, plus canned rows for any
/// other `SELECT`.
struct RecordingConnector {
    log: Arc<std::sync::Mutex<Vec<String>>>,
    in_transaction: bool,
    affected: u64,
    canned_count: u64,
    canned_rows: Vec<Row>,
}

#[async_trait]
impl Connection for RecordingConnector {
    fn exec_count(&self) -> u64 {
        self.log.lock().unwrap().len() as u64
    }

    fn seconds_since_last_exec(&self) -> u64 {
        0
    }

    fn has_broken(&self) -> bool {
        false
    }

    async fn close(self) {}

    async fn query(&mut self, sql: &str, _params: Params, _timeout: Duration) -> Result<Exec, Error> {
        self.log.lock().unwrap().push(sql.to_string());
        let upper = sql.trim_start().to_ascii_uppercase();
        if upper.starts_with("BEGIN") {
            self.in_transaction = true;
            return Ok(Exec::Affected(0));
        }
        if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
            self.in_transaction = false;
            return Ok(Exec::Affected(0));
        }
        if upper.contains("COUNT(*)") {
            return Ok(Exec::Rows(if self.canned_count == 0 {
                vec![]
            } else {
                vec![count_row(self.canned_count)]
            }));
        }
        if upper.starts_with("SELECT") {
            self.affected = self.canned_rows.len() as u64;
            return Ok(Exec::Rows(self.canned_rows.clone()));
        }
        self.affected = 1;
        Ok(Exec::Affected(1))
    }

    async fn begin(&mut self, _timeout: Duration) -> Result<(), Error> {
        self.log.lock().unwrap().push("BEGIN".to_string());
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self, _timeout: Duration) -> Result<(), Error> {
        self.log.lock().unwrap().push("COMMIT".to_string());
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self, _timeout: Duration) {
        self.log.lock().unwrap().push("ROLLBACK".to_string());
        self.in_transaction = false;
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn last_insert_id(&self) -> u64 {
        0
    }

    fn affected_rows(&self) -> u64 {
        self.affected
    }

    fn last_error_no(&self) -> u16 {
        0
    }

    fn last_error(&self) -> &str {
        ""
    }
}

struct RecordingManager {
    log: Arc<std::sync::Mutex<Vec<String>>>,
    connects: AtomicU64,
    canned_count: u64,
    canned_rows: Vec<Row>,
}

#[async_trait]
impl Manager for RecordingManager {
    type Connection = RecordingConnector;

    async fn connect(&self, _role: Role) -> Result<RecordingConnector, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(RecordingConnector {
            log: self.log.clone(),
            in_transaction: false,
            affected: 0,
            canned_count: self.canned_count,
            canned_rows: self.canned_rows.clone(),
        })
    }

    fn key(&self) -> String {
        "recording".to_string()
    }
}

fn new_pool() -> (Pool<RecordingManager>, Arc<std::sync::Mutex<Vec<String>>>) {
    new_pool_with_canned_data(0, Vec::new())
}

/// Like [`new_pool`], but every connection minted answers `canned_count` for a `count(*)`
/// query and `canned_rows` for any other `SELECT`.
fn new_pool_with_canned_data(
    canned_count: u64,
    canned_rows: Vec<Row>,
) -> (Pool<RecordingManager>, Arc<std::sync::Mutex<Vec<String>>>) {
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let manager = RecordingManager {
        log: log.clone(),
        connects: AtomicU64::new(0),
        canned_count,
        canned_rows,
    };
    (Pool::new(manager, PoolConfig::new().size(2)), log)
}

#[tokio::test]
async fn implicit_transaction_infers_write_and_commits_on_success() {
    let (pool, log) = new_pool();
    let txn = Transaction::new(pool, Duration::from_secs(1));

    scope(async {
        let result = txn.command("INSERT INTO t VALUES (1)", Params::Empty).await;
        assert!(result.is_ok());
        assert!(!txn.is_running());
    })
    .await;

    let entries = log.lock().unwrap().clone();
    assert_eq!(entries, vec!["INSERT INTO t VALUES (1)".to_string()]);
}

#[tokio::test]
async fn explicit_transaction_holds_the_same_connector_across_commands() {
    let (pool, log) = new_pool();
    let txn = Transaction::new(pool, Duration::from_secs(1));

    scope(async {
        txn.begin(Role::Write, false).await.unwrap();
        txn.command("UPDATE t SET x=1", Params::Empty).await.unwrap();
        txn.command("UPDATE t SET y=2", Params::Empty).await.unwrap();
        txn.commit(false).await.unwrap();
        assert!(!txn.is_running());
    })
    .await;

    let entries = log.lock().unwrap().clone();
    assert_eq!(
        entries,
        vec![
            "BEGIN".to_string(),
            "UPDATE t SET x=1".to_string(),
            "UPDATE t SET y=2".to_string(),
            "COMMIT".to_string(),
        ]
    );
}

#[tokio::test]
async fn dropping_the_guard_mid_transaction_rolls_back() {
    let (pool, log) = new_pool();

    {
        let txn = Arc::new(Transaction::new(pool, Duration::from_secs(1)));
        scope(async {
            txn.begin(Role::Write, false).await.unwrap();
            txn.command("UPDATE t SET x=1", Params::Empty).await.unwrap();
            let _guard = txn.clone().guarded();
            // guard dropped here without an explicit commit/rollback
        })
        .await;
    }

    // the rollback is spawned as a detached task; give it a turn to run
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let entries = log.lock().unwrap().clone();
    assert!(entries.last().map(|s| s.as_str()) == Some("ROLLBACK"));
}

#[tokio::test]
async fn two_tasks_sharing_a_query_never_see_each_others_predicates() {
    let (pool, _log) = new_pool();
    let txn = Arc::new(Transaction::new(pool, Duration::from_secs(1)));
    let builder = Arc::new(SqlBuilder);
    let query = Arc::new(Query::new(txn, builder, "widgets"));

    let q1 = query.clone();
    let t1 = tokio::spawn(scope(async move {
        q1.where_("a=1");
        tokio::task::yield_now().await;
        q1.list().await.unwrap();
    }));

    let q2 = query.clone();
    let t2 = tokio::spawn(scope(async move {
        q2.where_("b=2");
        tokio::task::yield_now().await;
        q2.list().await.unwrap();
    }));

    t1.await.unwrap();
    t2.await.unwrap();
}

#[tokio::test]
async fn two_distinct_queries_in_one_task_never_alias_each_others_builder_state() {
    let (pool, log) = new_pool();
    let txn = Arc::new(Transaction::new(pool, Duration::from_secs(1)));
    let builder = Arc::new(SqlBuilder);
    let widgets = Query::new(txn.clone(), builder.clone(), "widgets");
    let gadgets = Query::new(txn, builder, "gadgets");

    scope(async {
        widgets.where_("a=1");
        gadgets.where_("b=2");

        widgets.list().await.unwrap();
        gadgets.list().await.unwrap();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("FROM widgets") && entries[0].contains("a=1"));
        assert!(entries[1].contains("FROM gadgets") && entries[1].contains("b=2"));
    })
    .await;
}

#[tokio::test]
async fn page_stops_after_a_zero_count() {
    let (pool, log) = new_pool();
    let txn = Arc::new(Transaction::new(pool, Duration::from_secs(1)));
    let builder = Arc::new(SqlBuilder);
    let query = Query::new(txn, builder, "widgets");

    scope(async {
        query.fields(["id", "name"]);
        query.where_("active=1");
        query.limit(5);

        let page = query.page().await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.data.is_empty());

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 1, "zero-row count short-circuits before the page query runs");
        assert!(entries[0].contains("count(*)"));
    })
    .await;
}

#[tokio::test]
async fn page_restores_the_stash_and_runs_the_page_query_on_a_nonzero_count() {
    let rows = vec![count_row(1), count_row(2)];
    let (pool, log) = new_pool_with_canned_data(42, rows.clone());
    let txn = Arc::new(Transaction::new(pool, Duration::from_secs(1)));
    let builder = Arc::new(SqlBuilder);
    let query = Query::new(txn, builder, "widgets");

    scope(async {
        query.fields(["id", "name"]);
        query.where_("active=1");
        query.limit(5);
        query.offset(10);

        let page = query.page().await.unwrap();
        assert_eq!(page.total, 42);
        assert_eq!(page.data.len(), rows.len());

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 2, "count query, then the restored page query");
        assert!(entries[0].contains("count(*)"));
        assert!(!entries[0].contains("LIMIT"));

        let page_sql = &entries[1];
        assert!(page_sql.contains("FROM widgets"));
        assert!(page_sql.contains("active=1"));
        assert!(page_sql.contains("LIMIT 5"));
        assert!(page_sql.contains("OFFSET 10"));
        assert!(!page_sql.contains("count(*)"));
    })
    .await;
}

#[tokio::test]
async fn two_concurrent_pages_restore_their_own_stash_without_interleaving() {
    let rows = vec![count_row(1)];
    let (pool, log) = new_pool_with_canned_data(7, rows);
    let txn = Arc::new(Transaction::new(pool, Duration::from_secs(1)));
    let builder = Arc::new(SqlBuilder);
    let query = Arc::new(Query::new(txn, builder, "widgets"));

    let q1 = query.clone();
    let t1 = tokio::spawn(scope(async move {
        q1.where_("a=1");
        q1.limit(5);
        q1.offset(0);
        tokio::task::yield_now().await;
        let page = q1.page().await.unwrap();
        assert_eq!(page.total, 7);
        page
    }));

    let q2 = query.clone();
    let t2 = tokio::spawn(scope(async move {
        q2.where_("b=2");
        q2.limit(50);
        q2.offset(100);
        tokio::task::yield_now().await;
        let page = q2.page().await.unwrap();
        assert_eq!(page.total, 7);
        page
    }));

    t1.await.unwrap();
    t2.await.unwrap();

    let entries = log.lock().unwrap().clone();
    // Each task ran a count query followed by its own restored page query; neither restored
    // query should ever carry the other task's predicate or LIMIT/OFFSET.
    let page_queries: Vec<&String> = entries.iter().filter(|sql| !sql.contains("count(*)")).collect();
    assert_eq!(page_queries.len(), 2);

    let a_query = page_queries
        .iter()
        .find(|sql| sql.contains("a=1"))
        .expect("task 1's restored predicate must survive the stash/restore");
    assert!(a_query.contains("LIMIT 5"));
    assert!(a_query.contains("OFFSET 0"));
    assert!(!a_query.contains("b=2"));

    let b_query = page_queries
        .iter()
        .find(|sql| sql.contains("b=2"))
        .expect("task 2's restored predicate must survive the stash/restore");
    assert!(b_query.contains("LIMIT 50"));
    assert!(b_query.contains("OFFSET 100"));
    assert!(!b_query.contains("a=1"));
}
