//! Connector (C1) and ConnectorInfo (C2): one physical MySQL session, and its pool-side
//! bookkeeping record.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Row};
use tracing::{debug, warn};

use crate::config::DsnConfig;
use crate::error::{ConnectError, Error, RECONNECTABLE_ERRNOS};

/// Which half of the cluster a connection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// A read replica.
    Read,
    /// The write primary.
    Write,
}

/// Whether a connection is currently checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Sitting in the pool's channel.
    Idle,
    /// Checked out by a task.
    Busy,
}

/// Result of a successful [`Connector::query`].
#[derive(Debug)]
pub enum Exec {
    /// Rows returned by a `SELECT`-shaped statement.
    Rows(Vec<Row>),
    /// Affected-row count for a write statement.
    Affected(u64),
}

/// Per-connection metadata the Pool attaches to every live Connector (C2).
///
/// Invariant: `status` is `Busy` exactly while a task holds the connection, `Idle` exactly
/// while it sits in the pool's channel.
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    role: Role,
    status: Status,
    push_time: Instant,
    pop_time: Instant,
}

impl ConnectorInfo {
    pub(crate) fn new(role: Role) -> Self {
        let now = Instant::now();
        ConnectorInfo {
            role,
            status: Status::Busy,
            push_time: now,
            pop_time: now,
        }
    }

    /// The role this connection serves.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the connection is currently checked out.
    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn mark_busy(&mut self) {
        self.status = Status::Busy;
        self.pop_time = Instant::now();
    }

    pub(crate) fn mark_idle(&mut self) {
        self.status = Status::Idle;
        self.push_time = Instant::now();
    }
}

/// A trait describing everything the Pool needs to know about a connection in order to
/// admit, track, and reap it, without knowing it is MySQL-specific.
///
/// Generalizes a `ManageConnection::has_broken`-style check, adding the exec-count / idle-age
/// accessors the reaper's health check requires.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Number of statements executed on this connection since it was created.
    fn exec_count(&self) -> u64;

    /// Seconds elapsed since the last statement was executed (or since creation, if none
    /// yet).
    fn seconds_since_last_exec(&self) -> u64;

    /// Synchronously determine if the connection is no longer usable.
    fn has_broken(&self) -> bool;

    /// Release the underlying session. Called by the Pool when discarding a connection.
    async fn close(self);

    /// Execute a statement, per [`Connector::query`].
    async fn query(&mut self, sql: &str, params: Params, timeout: Duration) -> Result<Exec, Error>;

    /// Send `BEGIN`, per [`Connector::begin`].
    async fn begin(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Send `COMMIT`, per [`Connector::commit`].
    async fn commit(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Send `ROLLBACK`, per [`Connector::rollback`].
    async fn rollback(&mut self, timeout: Duration);

    /// Whether a `BEGIN` is outstanding on this session.
    fn in_transaction(&self) -> bool;

    /// Last-insert id from the most recent write.
    fn last_insert_id(&self) -> u64;

    /// Affected-row count from the most recent write.
    fn affected_rows(&self) -> u64;

    /// Driver error number from the most recent failed statement, 0 if none.
    fn last_error_no(&self) -> u16;

    /// Driver error message from the most recent failed statement.
    fn last_error(&self) -> &str;
}

/// A trait providing connection-specific construction, generalizing a `ManageConnection`-style
/// seam to the two-role (read/write) split this pool requires.
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    /// The connection type this manager produces.
    type Connection: Connection;

    /// Attempt to create a new connection for the given role.
    async fn connect(&self, role: Role) -> Result<Self::Connection, Error>;

    /// Stable identity for this manager's target, used to deduplicate pools in
    /// [`crate::pool::PoolRegistry`].
    fn key(&self) -> String;
}

/// One physical MySQL session (C1).
///
/// Created by [`ConnectorBuilder`]; `connect()` must succeed before first use. Reconnects
/// once, automatically, on a transient transport error — but never while `in_transaction`,
/// since a fresh connection would silently lose the open transaction.
pub struct Connector {
    dsn: DsnConfig,
    role: Role,
    conn: Option<Conn>,
    in_transaction: bool,
    exec_count: u64,
    last_exec_at: Instant,
    last_expend: Duration,
    peak_expend: Duration,
    last_insert_id: u64,
    affected_rows: u64,
    last_error_no: u16,
    last_error: String,
}

impl Connector {
    fn opts(dsn: &DsnConfig, role: Role) -> OptsBuilder {
        let (host, port) = match role {
            Role::Write => (dsn.write_host.clone(), dsn.write_port),
            Role::Read => (
                dsn.read_host.clone().unwrap_or_else(|| dsn.write_host.clone()),
                dsn.read_port.unwrap_or(dsn.write_port),
            ),
        };
        OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(dsn.user.clone()))
            .pass(Some(dsn.password.clone()))
            .db_name(Some(dsn.database.clone()))
            .tcp_connect_timeout(Some(dsn.connect_timeout()))
            .init(vec![format!("SET NAMES {}", dsn.charset)])
    }

    /// Establish the underlying session for `role` against `dsn`.
    pub async fn connect(dsn: DsnConfig, role: Role) -> Result<Self, Error> {
        let opts = Self::opts(&dsn, role);
        let conn = Conn::new(opts).await.map_err(|e| map_connect_error(&e))?;
        Ok(Connector {
            dsn,
            role,
            conn: Some(conn),
            in_transaction: false,
            exec_count: 0,
            last_exec_at: Instant::now(),
            last_expend: Duration::ZERO,
            peak_expend: Duration::ZERO,
            last_insert_id: 0,
            affected_rows: 0,
            last_error_no: 0,
            last_error: String::new(),
        })
    }

    /// The role this Connector was created for.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether a `BEGIN` has been sent and no matching `COMMIT`/`ROLLBACK` yet.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Last-insert id from the most recent write.
    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    /// Affected-row count from the most recent write.
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Driver error number from the most recent failed statement, 0 if none.
    pub fn last_error_no(&self) -> u16 {
        self.last_error_no
    }

    /// Driver error message from the most recent failed statement.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// Execute `sql`. If `params` is non-empty, uses the prepare+execute path; otherwise
    /// issues a direct query. Retries exactly once, via a fresh reconnect, when the failure
    /// is a transient transport error and the connection is not mid-transaction.
    pub async fn query(
        &mut self,
        sql: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Exec, Error> {
        match self.try_query(sql, params.clone(), timeout).await {
            Ok(exec) => Ok(exec),
            Err(err) => {
                let errno = driver_errno(&err);
                if !self.in_transaction
                    && errno.map(|e| RECONNECTABLE_ERRNOS.contains(&e)).unwrap_or(false)
                {
                    warn!(errno = errno.unwrap(), "reconnecting after transient error");
                    self.reconnect().await?;
                    self.try_query(sql, params, timeout).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn try_query(&mut self, sql: &str, params: Params, timeout: Duration) -> Result<Exec, Error> {
        let conn = self.conn.as_mut().ok_or_else(|| Error::Db {
            error_no: 0,
            message: "connector is closed".to_string(),
        })?;

        let start = Instant::now();
        let result = tokio::time::timeout(timeout, async {
            if matches!(params, Params::Empty) {
                conn.query_iter(sql).await?.collect::<Row>().await
            } else {
                let stmt = conn.prep(sql).await?;
                conn.exec_iter(&stmt, params).await?.collect::<Row>().await
            }
        })
        .await;

        let elapsed = start.elapsed();
        self.exec_count += 1;
        self.last_exec_at = Instant::now();
        self.last_expend = elapsed;
        if elapsed > self.peak_expend {
            self.peak_expend = elapsed;
        }

        match result {
            Err(_elapsed) => {
                self.last_error_no = 0;
                self.last_error = "query timed out".to_string();
                Err(Error::Db {
                    error_no: 0,
                    message: self.last_error.clone(),
                })
            }
            Ok(Err(driver_err)) => {
                self.record_driver_error(&driver_err);
                Err(Error::from_driver(&driver_err))
            }
            Ok(Ok(rows)) => {
                self.last_error_no = 0;
                self.last_error.clear();
                self.last_insert_id = self.conn.as_ref().map(|c| c.last_insert_id().unwrap_or(0)).unwrap_or(0);
                self.affected_rows = self.conn.as_ref().map(|c| c.affected_rows()).unwrap_or(0);
                if rows.is_empty() && self.affected_rows > 0 {
                    Ok(Exec::Affected(self.affected_rows))
                } else {
                    Ok(Exec::Rows(rows))
                }
            }
        }
    }

    fn record_driver_error(&mut self, err: &mysql_async::Error) {
        self.last_error_no = crate::error::classify_errno(err);
        self.last_error = err.to_string();
    }

    async fn reconnect(&mut self) -> Result<(), Error> {
        if let Some(old) = self.conn.take() {
            let _ = old.disconnect().await;
        }
        let opts = Self::opts(&self.dsn, self.role);
        let conn = Conn::new(opts).await.map_err(|e| map_connect_error(&e))?;
        self.conn = Some(conn);
        self.in_transaction = false;
        Ok(())
    }

    /// Send `BEGIN` and mark the session as in-transaction.
    pub async fn begin(&mut self, timeout: Duration) -> Result<(), Error> {
        self.query("BEGIN", Params::Empty, timeout).await?;
        self.in_transaction = true;
        Ok(())
    }

    /// Send `COMMIT` and clear the in-transaction flag.
    pub async fn commit(&mut self, timeout: Duration) -> Result<(), Error> {
        let result = self.query("COMMIT", Params::Empty, timeout).await;
        self.in_transaction = false;
        result.map(|_| ())
    }

    /// Send `ROLLBACK` and clear the in-transaction flag. Errors are not propagated — this
    /// is always a best-effort operation.
    pub async fn rollback(&mut self, timeout: Duration) {
        let _ = self.query("ROLLBACK", Params::Empty, timeout).await;
        self.in_transaction = false;
    }
}

#[async_trait]
impl Connection for Connector {
    fn exec_count(&self) -> u64 {
        self.exec_count
    }

    fn seconds_since_last_exec(&self) -> u64 {
        self.last_exec_at.elapsed().as_secs()
    }

    fn has_broken(&self) -> bool {
        self.conn.is_none()
    }

    async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.disconnect().await;
        }
        debug!(role = ?self.role, exec_count = self.exec_count, "connector closed");
    }

    async fn query(&mut self, sql: &str, params: Params, timeout: Duration) -> Result<Exec, Error> {
        Connector::query(self, sql, params, timeout).await
    }

    async fn begin(&mut self, timeout: Duration) -> Result<(), Error> {
        Connector::begin(self, timeout).await
    }

    async fn commit(&mut self, timeout: Duration) -> Result<(), Error> {
        Connector::commit(self, timeout).await
    }

    async fn rollback(&mut self, timeout: Duration) {
        Connector::rollback(self, timeout).await
    }

    fn in_transaction(&self) -> bool {
        Connector::in_transaction(self)
    }

    fn last_insert_id(&self) -> u64 {
        Connector::last_insert_id(self)
    }

    fn affected_rows(&self) -> u64 {
        Connector::affected_rows(self)
    }

    fn last_error_no(&self) -> u16 {
        Connector::last_error_no(self)
    }

    fn last_error(&self) -> &str {
        Connector::last_error(self)
    }
}

fn driver_errno(err: &Error) -> Option<u16> {
    match err {
        Error::Db { error_no, .. } if *error_no != 0 => Some(*error_no),
        _ => None,
    }
}

fn map_connect_error(err: &mysql_async::Error) -> Error {
    Error::Connect(ConnectError::Driver {
        code: crate::error::classify_errno(err),
        message: err.to_string(),
    })
}

/// Builds [`Connector`]s for a fixed DSN, and provides the Pool-deduplication key.
#[derive(Debug, Clone)]
pub struct ConnectorBuilder {
    dsn: DsnConfig,
}

impl ConnectorBuilder {
    /// Wrap DSN parameters for use as a [`Manager`].
    pub fn new(dsn: DsnConfig) -> Self {
        ConnectorBuilder { dsn }
    }
}

#[async_trait]
impl Manager for ConnectorBuilder {
    type Connection = Connector;

    async fn connect(&self, role: Role) -> Result<Connector, Error> {
        Connector::connect(self.dsn.clone(), role).await
    }

    fn key(&self) -> String {
        self.dsn.key()
    }
}
