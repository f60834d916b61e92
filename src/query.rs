//! Query (C6): a thin fluent façade over a [`Builder`], offering `list`/`one`/`column`/`page`/
//! `execute` and forwarding transaction control to an owned [`Transaction`].
//!
//! Builder mutations (`where_`, `fields`, `limit`, …) target task-local storage exactly like
//! `Transaction`'s own state, so one shared `Query` instance never lets two concurrent tasks
//! observe each other's predicates.

use std::sync::Arc;

use mysql_async::{Params, Row, Value};

use crate::builder::{Builder, BuilderState, Section};
use crate::connector::{Exec, Manager, Role};
use crate::error::Error;
use crate::task_context::TaskContext;
use crate::transaction::Transaction;

/// Result of [`Query::page`]: the total row count matching the current predicates, and one
/// page of rows.
#[derive(Debug, Clone)]
pub struct Page {
    /// Total rows matching the builder's predicates, ignoring `LIMIT`/`OFFSET`.
    pub total: u64,
    /// One page of rows.
    pub data: Vec<Row>,
}

struct QueryState {
    builder: BuilderState,
    /// Snapshot taken by `page()` before it temporarily rewrites `builder` to run its count
    /// sub-query; restored afterward unless the count came back zero.
    stash: Option<(BuilderState, Option<Role>)>,
}

impl Default for QueryState {
    fn default() -> Self {
        QueryState {
            builder: BuilderState::default(),
            stash: None,
        }
    }
}

/// Fluent query façade over a table, backed by a shared [`Transaction`] and [`Builder`].
///
/// Cheap to share: clone it freely across a task tree, or hold one `Arc<Query<M>>` per logical
/// table and call it from any task — builder state never collides because it lives in
/// [`TaskContext`], not in `self`.
pub struct Query<M: Manager> {
    txn: Arc<Transaction<M>>,
    builder: Arc<dyn Builder>,
    table: String,
    ctx: TaskContext<QueryState>,
}

impl<M: Manager> Clone for Query<M> {
    /// Cloning a `Query` hands out another handle onto the *same* logical façade — same table,
    /// same task-local builder state — not an independent one: the clone keeps the original's
    /// `TaskContext` identity, so `query.clone()` used from a second task still stashes and
    /// restores correctly, and two distinct `Query::new` calls over different tables never
    /// alias each other's state even when both happen to be alive in one task.
    fn clone(&self) -> Self {
        Query {
            txn: self.txn.clone(),
            builder: self.builder.clone(),
            table: self.table.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<M: Manager> Query<M> {
    /// Build a façade over `table`, driven by `txn` and compiled by `builder`.
    pub fn new(txn: Arc<Transaction<M>>, builder: Arc<dyn Builder>, table: impl Into<String>) -> Self {
        Query {
            txn,
            builder,
            table: table.into(),
            ctx: TaskContext::new(),
        }
    }

    /// Append a `WHERE` predicate, ANDed with any already present.
    pub fn where_(&self, clause: impl Into<String>) -> &Self {
        self.ctx.with_mut(|s| s.builder.wheres.push(clause.into()));
        self
    }

    /// Set the projected column list, replacing any already present.
    pub fn fields(&self, exprs: impl IntoIterator<Item = impl Into<String>>) -> &Self {
        self.ctx
            .with_mut(|s| s.builder.fields = exprs.into_iter().map(Into::into).collect());
        self
    }

    /// Set the `ORDER BY` expression.
    pub fn order(&self, clause: impl Into<String>) -> &Self {
        self.ctx.with_mut(|s| s.builder.order = Some(clause.into()));
        self
    }

    /// Set the `GROUP BY` expression.
    pub fn group(&self, clause: impl Into<String>) -> &Self {
        self.ctx.with_mut(|s| s.builder.group = Some(clause.into()));
        self
    }

    /// Set `LIMIT`.
    pub fn limit(&self, n: u64) -> &Self {
        self.ctx.with_mut(|s| s.builder.limit = Some(n));
        self
    }

    /// Set `OFFSET`.
    pub fn offset(&self, n: u64) -> &Self {
        self.ctx.with_mut(|s| s.builder.offset = Some(n));
        self
    }

    /// Clear `section` of this task's builder state.
    pub fn reset(&self, section: Section) -> &Self {
        self.ctx.with_mut(|s| s.builder.reset(section));
        self
    }

    /// Pin the model (read/write) for the transaction this façade drives.
    pub fn set_model(&self, role: Role) -> Result<(), Error> {
        self.txn.set_model(role)
    }

    /// Begin an explicit transaction.
    pub async fn begin(&self, model: Role) -> Result<bool, Error> {
        self.txn.begin(model, false).await
    }

    /// Commit the running explicit transaction.
    pub async fn commit(&self) -> Result<bool, Error> {
        self.txn.commit(false).await
    }

    /// Roll back the running explicit transaction.
    pub async fn rollback(&self) {
        self.txn.rollback().await
    }

    /// `LAST_INSERT_ID()` from the most recent write.
    pub fn last_insert_id(&self) -> u64 {
        self.txn.last_exec_info().insert_id
    }

    /// Affected-row count from the most recent write.
    pub fn affected_rows(&self) -> u64 {
        self.txn.last_exec_info().affected_rows
    }

    /// Driver error number from the most recent failed statement, 0 if none.
    pub fn last_error_no(&self) -> u16 {
        self.txn.last_exec_info().error_no
    }

    /// Driver error message from the most recent failed statement.
    pub fn last_error(&self) -> String {
        self.txn.last_exec_info().error
    }

    /// Compile the current builder state and return every matching row.
    pub async fn list(&self) -> Result<Vec<Row>, Error> {
        let state = self.ctx.with(|s| s.builder.clone());
        self.run_state(&state).await
    }

    /// Like [`Self::list`], but forces `LIMIT 1` and returns the first row (or `None`),
    /// without touching the task's stored `limit`.
    pub async fn one(&self) -> Result<Option<Row>, Error> {
        let mut state = self.ctx.with(|s| s.builder.clone());
        state.limit = Some(1);
        let mut rows = self.run_state(&state).await?;
        Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
    }

    /// The first column of the first row, or an empty string value if there are no rows.
    pub async fn column(&self) -> Result<Value, Error> {
        let row = self.one().await?;
        Ok(row
            .and_then(|mut r| r.take(0))
            .unwrap_or_else(|| Value::Bytes(Vec::new())))
    }

    /// Run the builder's predicates as a count, then as one page of rows.
    ///
    /// Implements the stash/restore algorithm exactly: the count sub-query temporarily
    /// rewrites this task's stored builder state (fields → `count(*)`, limit cleared) rather
    /// than working from a throwaway clone, because the behavior under concurrent callers of
    /// a shared `Query` is itself part of what this method has to get right. When the count
    /// comes back zero, the stash is discarded without restoring the builder — there is no
    /// page query left to run, so the rewritten count-query state is simply left in place for
    /// whatever happens next.
    pub async fn page(&self) -> Result<Page, Error> {
        let original_model = self.txn.model();
        self.ctx.with_mut(|s| {
            let snapshot = s.builder.clone();
            s.builder.fields = vec!["count(*) as cnt".to_string()];
            s.builder.limit = None;
            s.builder.offset = None;
            s.stash = Some((snapshot, original_model));
        });
        if !self.txn.is_running() {
            let _ = self.txn.set_model(Role::Read);
        }

        let count_state = self.ctx.with(|s| s.builder.clone());
        let count_rows = match self.run_state(&count_state).await {
            Ok(rows) => rows,
            Err(e) => {
                self.restore_stash();
                return Err(e);
            }
        };

        let total: u64 = count_rows
            .get(0)
            .and_then(|row| row.get::<u64, _>(0))
            .unwrap_or(0);

        if total == 0 {
            self.ctx.with_mut(|s| s.stash = None);
            return Ok(Page { total: 0, data: Vec::new() });
        }

        self.restore_stash();
        let page_state = self.ctx.with(|s| s.builder.clone());
        let data = self.run_state(&page_state).await?;
        Ok(Page { total, data })
    }

    fn restore_stash(&self) {
        let stash = self.ctx.with_mut(|s| s.stash.take());
        if let Some((saved_builder, saved_model)) = stash {
            self.ctx.with_mut(|s| s.builder = saved_builder);
            if let Some(model) = saved_model {
                if !self.txn.is_running() {
                    let _ = self.txn.set_model(model);
                }
            }
        }
    }

    /// Execute a statement. With no `pre_sql`, compiles from the current builder state;
    /// otherwise runs `pre_sql`/`params` as supplied, passed through [`Builder::prepare_sql`].
    pub async fn execute(&self, pre_sql: Option<&str>, params: Params) -> Result<Exec, Error> {
        let (sql, params) = match pre_sql {
            Some(sql) => self.builder.prepare_sql(sql, params),
            None => {
                let state = self.ctx.with(|s| s.builder.clone());
                self.builder.compile(&self.table, &state)
            }
        };
        self.txn.command(&sql, params).await
    }

    async fn run_state(&self, state: &BuilderState) -> Result<Vec<Row>, Error> {
        let (sql, params) = self.builder.compile(&self.table, state);
        match self.txn.command(&sql, params).await? {
            Exec::Rows(rows) => Ok(rows),
            Exec::Affected(_) => Ok(Vec::new()),
        }
    }
}
