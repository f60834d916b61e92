//! A coroutine-aware, read/write-split MySQL connection pool and per-task transaction
//! manager.
//!
//! Three collaborating pieces:
//!
//! - [`pool::Pool`]: a bounded dual-channel (read replica / write primary) connection pool
//!   with admission control, automatic growth up to an overflow ceiling, a reaper that closes
//!   idle or worn-out connections, and a [`pool::PoolRegistry`] deduplicating pools by DSN.
//! - [`transaction::Transaction`]: task-isolated `BEGIN`/`COMMIT`/`ROLLBACK` state, including
//!   inference of the read/write model for implicit (single-statement) transactions and
//!   best-effort auto-rollback if a task exits mid-transaction.
//! - [`query::Query`]: a fluent façade over an external [`builder::Builder`], with a
//!   stash/restore discipline keeping its builder state correct across the two suspension
//!   points inside [`query::Query::page`].
//!
//! Task isolation for both `Transaction` and `Query` is built on [`task_context::TaskContext`],
//! which must be entered once per task via [`task_context::scope`] before either is used.
//!
//! Out of scope: the SQL builder's surface syntax for composing WHERE/JOIN/ORDER clauses (only
//! the [`builder::Builder`] seam is specified; [`builder::SqlBuilder`] is a minimal reference
//! implementation), the low-level MySQL wire protocol (delegated to `mysql_async`), logging
//! configuration, config-file loading, and CLI surface — all host-application concerns.

pub mod builder;
pub mod config;
pub mod connector;
pub mod error;
pub mod pool;
pub mod query;
pub mod task_context;
pub mod transaction;

pub use builder::{Builder, BuilderState, Section, SqlBuilder};
pub use config::{DsnConfig, PoolConfig};
pub use connector::{Connection, Connector, ConnectorBuilder, ConnectorInfo, Exec, Manager, Role, Status};
pub use error::{ConnectError, Error, TransactionError};
pub use pool::{Lease, Pool, PoolRegistry};
pub use query::{Page, Query};
pub use task_context::{scope, TaskContext};
pub use transaction::{LastExecInfo, Transaction, TransactionGuard};
