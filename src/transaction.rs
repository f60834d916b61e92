//! Transaction (C5): the per-task state machine mediating `BEGIN`/commit/rollback over a
//! Connector checked out from the Pool, including implicit-transaction inference and
//! auto-rollback on task exit.
//!
//! `TransactionGuard`'s `Drop`-spawns-a-detached-rollback is the direct generalization of a
//! `PooledConnection::drop` that returns a connection to its pool (or discards it) without
//! requiring the holder to call anything explicitly.

use std::sync::Arc;
use std::time::Duration;

use mysql_async::Params;

use crate::connector::{Connection, Exec, Manager, Role};
use crate::error::{Error, TransactionError};
use crate::pool::{Lease, Pool};
use crate::task_context::TaskContext;

/// Keywords that imply a write-role connection when inferring the model of an implicit
/// transaction.
const WRITE_KEYWORDS: [&str; 9] = [
    "update", "replace", "delete", "insert", "drop", "grant", "truncate", "alter", "create",
];

/// Case-insensitive match on the first keyword of `sql` against [`WRITE_KEYWORDS`].
fn infer_role(sql: &str) -> Role {
    let first_word = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    if WRITE_KEYWORDS
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(first_word))
    {
        Role::Write
    } else {
        Role::Read
    }
}

/// Bookkeeping saved from the most recent statement, surfaced to callers after the
/// transaction releases its Connector.
#[derive(Debug, Clone, Default)]
pub struct LastExecInfo {
    /// `LAST_INSERT_ID()` from the most recent write.
    pub insert_id: u64,
    /// Affected-row count from the most recent write.
    pub affected_rows: u64,
    /// Driver error number from the most recent failed statement, 0 if none.
    pub error_no: u16,
    /// Driver error message from the most recent failed statement.
    pub error: String,
}

struct TransactionState<C: Connection> {
    lease: Option<Lease<C>>,
    model: Option<Role>,
    running: bool,
    last_exec_info: LastExecInfo,
}

impl<C: Connection> Default for TransactionState<C> {
    fn default() -> Self {
        TransactionState {
            lease: None,
            model: None,
            running: false,
            last_exec_info: LastExecInfo::default(),
        }
    }
}

/// Task-isolated transaction manager: one BEGIN/COMMIT/ROLLBACK state machine per tokio task,
/// sharing a single Connector for the lifetime of a running transaction.
///
/// State lives in a [`TaskContext`], not in `&mut self`, so a single `Transaction` value (or
/// an `Arc` of one) can be shared by every component of a task — [`crate::query::Query`] reads
/// the same state this type mutates.
pub struct Transaction<M: Manager> {
    pool: Pool<M>,
    timeout: Duration,
    ctx: TaskContext<TransactionState<M::Connection>>,
}

impl<M: Manager> Transaction<M> {
    /// Build a new task-local transaction manager over `pool`, using `timeout` for every
    /// statement it sends (including the implicit `BEGIN`/`COMMIT`/`ROLLBACK`).
    pub fn new(pool: Pool<M>, timeout: Duration) -> Self {
        Transaction {
            pool,
            timeout,
            ctx: TaskContext::new(),
        }
    }

    /// Wrap this transaction in an [`Arc`] and return a [`TransactionGuard`] over it. Dropping
    /// the guard while a transaction is still running spawns a best-effort rollback, so a task
    /// that exits early (panic, early return, cancellation) cannot leave a connection
    /// perpetually checked out mid-transaction.
    pub fn guarded(self: Arc<Self>) -> TransactionGuard<M> {
        TransactionGuard { txn: self }
    }

    /// Whether a transaction is currently running on this task.
    pub fn is_running(&self) -> bool {
        self.ctx.with(|s| s.running)
    }

    /// The model (read/write) a pinned transaction is using, or the explicitly-set model for
    /// the next implicit transaction. `None` means "infer per statement".
    pub fn model(&self) -> Option<Role> {
        self.ctx.with(|s| s.model)
    }

    /// Pin the model read/write connections are drawn from for the next (or current, if none
    /// is running yet) transaction.
    ///
    /// Fails with [`TransactionError::ModelLocked`] if a transaction is already running: the
    /// Connector has already been chosen for that transaction's lifetime and cannot be swapped
    /// mid-flight.
    pub fn set_model(&self, role: Role) -> Result<(), Error> {
        self.ctx.with_mut(|s| {
            if s.running {
                Err(Error::Transaction(TransactionError::ModelLocked))
            } else {
                s.model = Some(role);
                Ok(())
            }
        })
    }

    /// Bookkeeping from the most recently executed statement.
    pub fn last_exec_info(&self) -> LastExecInfo {
        self.ctx.with(|s| s.last_exec_info.clone())
    }

    /// Begin a transaction against `model`, acquiring a Connector from the Pool.
    ///
    /// Idempotent: a call while already running is a no-op returning `Ok(true)`. When
    /// `implicit` is `true`, no `BEGIN` is sent on the wire — the Connector is simply reserved
    /// for the duration of one statement, matching implicit-transaction semantics.
    pub async fn begin(&self, model: Role, implicit: bool) -> Result<bool, Error> {
        if self.is_running() {
            return Ok(true);
        }

        let lease = match self.pool.get(model).await {
            Ok(lease) => lease,
            Err(e) => {
                return Err(Error::Transaction(TransactionError::AcquireFailed(e.to_string())));
            }
        };

        self.ctx.with_mut(|s| {
            s.lease = Some(lease);
            s.model = Some(model);
            s.running = true;
            s.last_exec_info = LastExecInfo::default();
        });

        if !implicit {
            let lease = self.take_lease();
            let result = lease.begin(self.timeout).await;
            self.restore_lease(lease);
            if let Err(e) = result {
                // Could not even send BEGIN: release the Connector and surface the failure
                // rather than leaving the task stuck "running" with an unusable transaction.
                self.release().await;
                return Err(e);
            }
        }

        Ok(true)
    }

    /// Execute `sql`. If no transaction is running, this is an **implicit transaction**: the
    /// model is inferred from `sql`'s first keyword, a Connector is acquired and released
    /// around exactly this one statement, and a failure rolls back rather than leaving a
    /// half-applied write uncommitted on the wire. If a transaction is already running, `sql`
    /// simply executes on the held Connector and the caller remains responsible for
    /// `commit`/`rollback`.
    pub async fn command(&self, sql: &str, params: Params) -> Result<Exec, Error> {
        if self.is_running() {
            return self.exec(sql, params).await;
        }

        let model = self.model().unwrap_or_else(|| infer_role(sql));
        self.begin(model, true).await?;

        match self.exec(sql, params).await {
            Ok(exec) => {
                self.commit(true).await?;
                Ok(exec)
            }
            Err(e) => {
                self.rollback().await;
                Err(e)
            }
        }
    }

    async fn exec(&self, sql: &str, params: Params) -> Result<Exec, Error> {
        let lease = self.take_lease();
        let result = lease.query(sql, params, self.timeout).await;
        self.restore_lease(lease);
        result
    }

    /// Commit the running transaction and release its Connector back to the Pool.
    ///
    /// A no-op (`Ok(true)`) if nothing is running. When `implicit` is `true`, no `COMMIT` is
    /// sent — the caller (normally [`Self::command`]) already knows the one statement it ran
    /// succeeded. A failed `COMMIT` triggers an automatic best-effort rollback before the
    /// failure is reported.
    pub async fn commit(&self, implicit: bool) -> Result<bool, Error> {
        if !self.is_running() {
            return Ok(true);
        }

        if !implicit {
            let lease = self.take_lease();
            let result = lease.commit(self.timeout).await;
            self.restore_lease(lease);
            if let Err(e) = result {
                self.rollback().await;
                return Err(e);
            }
        }

        self.save_last_exec_info().await;
        self.release().await;
        Ok(true)
    }

    /// Roll back the running transaction, send best-effort, and release its Connector back to
    /// the Pool. Never fails: a failed `ROLLBACK` still releases the Connector.
    pub async fn rollback(&self) {
        if !self.is_running() {
            return;
        }
        let lease = self.take_lease();
        lease.rollback(self.timeout).await;
        self.restore_lease(lease);
        self.save_last_exec_info().await;
        self.release().await;
    }

    async fn save_last_exec_info(&self) {
        let lease = self.take_lease();
        let info = LastExecInfo {
            insert_id: lease.last_insert_id().await,
            affected_rows: lease.affected_rows().await,
            error_no: lease.last_error_no().await,
            error: lease.last_error().await,
        };
        self.restore_lease(lease);
        self.ctx.with_mut(|s| s.last_exec_info = info);
    }

    async fn release(&self) {
        let lease = self.ctx.with_mut(|s| {
            s.running = false;
            s.model = None;
            s.lease.take()
        });
        if let Some(lease) = lease {
            let role = lease.info.role();
            self.pool.put(role, lease).await;
        }
    }

    /// Take the held Connector out of task-local state so it can be driven across an `.await`
    /// without holding the state's borrow. Panics if no transaction is running — callers must
    /// check [`Self::is_running`] (or go through [`Self::begin`]/[`Self::command`]) first.
    fn take_lease(&self) -> Lease<M::Connection> {
        self.ctx
            .with_mut(|s| s.lease.take())
            .expect("take_lease called without a running transaction")
    }

    /// Put a Connector taken via [`Self::take_lease`] back into task-local state.
    fn restore_lease(&self, lease: Lease<M::Connection>) {
        self.ctx.with_mut(|s| s.lease = Some(lease));
    }
}

/// RAII handle over a shared [`Transaction`] that guarantees a forgotten transaction is rolled
/// back when the task drops it, instead of leaking its Connector forever.
pub struct TransactionGuard<M: Manager> {
    txn: Arc<Transaction<M>>,
}

impl<M: Manager> TransactionGuard<M> {
    /// The guarded transaction.
    pub fn transaction(&self) -> &Arc<Transaction<M>> {
        &self.txn
    }
}

impl<M: Manager> Drop for TransactionGuard<M> {
    fn drop(&mut self) {
        // A spawned task does not inherit the current task's task-local state, so the
        // Connector has to be pulled out of it here — synchronously, while `try_with_mut` can
        // still reach the scope this guard was created in — rather than letting the spawned
        // task call back into `Transaction`'s own (task-local-keyed) methods.
        let taken = self
            .txn
            .ctx
            .try_with_mut(|s| {
                if s.running {
                    s.running = false;
                    s.model = None;
                    s.lease.take()
                } else {
                    None
                }
            })
            .flatten();

        if let Some(lease) = taken {
            let pool = self.txn.pool.clone();
            let timeout = self.txn.timeout;
            tokio::spawn(async move {
                lease.rollback(timeout).await;
                let role = lease.info.role();
                pool.put(role, lease).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_write_keywords_case_insensitively() {
        assert_eq!(infer_role("UPDATE users SET x=1"), Role::Write);
        assert_eq!(infer_role("  insert into t values (1)"), Role::Write);
        assert_eq!(infer_role("DELETE FROM t"), Role::Write);
        assert_eq!(infer_role("Create Table t (id int)"), Role::Write);
    }

    #[test]
    fn infers_read_for_everything_else() {
        assert_eq!(infer_role("SELECT * FROM t"), Role::Read);
        assert_eq!(infer_role("  show tables"), Role::Read);
        assert_eq!(infer_role(""), Role::Read);
    }
}
