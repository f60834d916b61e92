//! Typed error hierarchy for the pool, transaction manager and query façade.
//!
//! The source mixes `false` return values with thrown exceptions; this crate picks one
//! convention and sticks to it: every fallible operation returns `Result<T, Error>`.

use std::fmt;

/// Errors produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transient acquisition or transport failure. The caller may retry.
    #[error("connect error: {0}")]
    Connect(ConnectError),

    /// Consecutive acquisition timeouts exceeded `max_wait_timeout_count`. Not recoverable;
    /// the cluster appears to be down.
    #[error("fatal: {0} consecutive connection acquisition timeouts")]
    ConnectFatal(u32),

    /// The pool has been closed and no longer accepts `get`/`put`.
    #[error("pool is closed")]
    PoolClosed,

    /// A transaction could not be started, or a state transition was rejected.
    #[error("transaction error: {0}")]
    Transaction(TransactionError),

    /// The driver reported a SQL execution failure.
    #[error("db error {error_no}: {message}")]
    Db {
        /// Driver-reported error number (e.g. MySQL errno).
        error_no: u16,
        /// Driver-reported error message.
        message: String,
    },
}

impl Error {
    /// Build a [`Error::Db`] from a driver error, preserving its code and message.
    pub fn from_driver(err: &mysql_async::Error) -> Self {
        Error::Db {
            error_no: classify_errno(err),
            message: err.to_string(),
        }
    }
}

/// Map a driver error to a MySQL client errno, synthesizing one of the
/// [`RECONNECTABLE_ERRNOS`] for the transport-level failures the driver reports as a distinct
/// variant rather than a numbered `Server` error.
///
/// `mysql_async::Error::Server` already carries a real server errno. Everything else —
/// `Error::Io` (the socket dropped) and `Error::Driver(DriverError::PoolDisconnected)` (the
/// underlying connection was torn down) — is how this driver identifies a dead connection, with
/// no numeric code attached. Without this mapping, nothing downstream of a real dropped
/// connection would ever see a code in [`RECONNECTABLE_ERRNOS`], and
/// [`crate::connector::Connector::query`]'s reconnect-once path could never fire.
pub(crate) fn classify_errno(err: &mysql_async::Error) -> u16 {
    match err {
        mysql_async::Error::Server(server_err) => server_err.code,
        mysql_async::Error::Io(_) => 2006,
        mysql_async::Error::Driver(mysql_async::DriverError::PoolDisconnected) => 2013,
        _ => 0,
    }
}

/// A transient failure acquiring or establishing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The driver reported an error while connecting (e.g. protocol failure, too many
    /// connections).
    Driver {
        /// MySQL error code, when known (e.g. 1040, 2002, 2006, 2013).
        code: u16,
        /// Driver-reported message.
        message: String,
    },
    /// Acquisition timed out waiting for a free slot.
    Timeout,
    /// The channel was closed while waiting (pool shutting down).
    Closed,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Driver { code, message } => write!(f, "[{code}] {message}"),
            ConnectError::Timeout => write!(f, "timeout"),
            ConnectError::Closed => write!(f, "closed"),
        }
    }
}

/// Why a transaction operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// `begin` could not acquire a Connector from the Pool.
    AcquireFailed(String),
    /// `set_model`/`model()` was called while a transaction is running.
    ModelLocked,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::AcquireFailed(msg) => write!(f, "could not acquire connection: {msg}"),
            TransactionError::ModelLocked => write!(f, "model cannot change while a transaction is running"),
        }
    }
}

/// The driver error codes this crate treats as transient/reconnectable.
pub const RECONNECTABLE_ERRNOS: [u16; 3] = [2002, 2006, 2013];

/// The driver error code for "too many connections".
pub const TOO_MANY_CONNECTIONS_ERRNO: u16 = 1040;
