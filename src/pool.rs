//! Pool (C3): the bounded, dual-channel (read/write) connection pool, its admission
//! algorithm, reaper, and singleton registry.
//!
//! Structurally this generalizes a `SharedPool`/`PoolInternals`/`IdleConn` design
//! (one `Mutex`-guarded `VecDeque` of idle connections plus a `VecDeque` of oneshot waiters)
//! into one such structure per role, and replaces a "grow up to `max_size`, then
//! wait forever" policy with a three-tier admission algorithm: immediate
//! pop, bounded growth up to `overflow_factor * size`, then a timed wait with a fatal
//! threshold on consecutive timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mysql_async::Params;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::connector::{Connection, ConnectorBuilder, ConnectorInfo, Exec, Manager, Role};
use crate::error::{ConnectError, Error, TOO_MANY_CONNECTIONS_ERRNO};

/// A connection checked out of the pool, paired with its bookkeeping record.
///
/// Callers (chiefly [`crate::transaction::Transaction`]) receive this from [`Pool::get`] and
/// must return it via [`Pool::put`] exactly once.
///
/// The connection itself lives behind a shared `Arc<Mutex<Option<C>>>`, with the pool holding
/// its own clone in `RoleInternals::checked_out` for exactly as long as this lease is alive.
/// That's what lets [`Pool::close`] reach in and shut a connection down even while a task still
/// holds the `Lease` for it — every call through this handle checks for that and reports
/// [`Error::PoolClosed`] instead of panicking on a connection that's no longer there.
pub struct Lease<C: Connection> {
    id: u64,
    conn: Arc<Mutex<Option<C>>>,
    /// Its C2 bookkeeping record.
    pub info: ConnectorInfo,
}

impl<C: Connection> Lease<C> {
    /// Run a statement on the held connection.
    pub async fn query(&self, sql: &str, params: Params, timeout: Duration) -> Result<Exec, Error> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::PoolClosed)?;
        conn.query(sql, params, timeout).await
    }

    /// Send `BEGIN` on the held connection.
    pub async fn begin(&self, timeout: Duration) -> Result<(), Error> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::PoolClosed)?;
        conn.begin(timeout).await
    }

    /// Send `COMMIT` on the held connection.
    pub async fn commit(&self, timeout: Duration) -> Result<(), Error> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::PoolClosed)?;
        conn.commit(timeout).await
    }

    /// Send `ROLLBACK` on the held connection, best-effort. A no-op if the connection was
    /// force-closed out from under this lease by [`Pool::close`].
    pub async fn rollback(&self, timeout: Duration) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            conn.rollback(timeout).await;
        }
    }

    /// `LAST_INSERT_ID()` from the most recent write, 0 if the connection is gone.
    pub async fn last_insert_id(&self) -> u64 {
        self.conn.lock().await.as_ref().map(Connection::last_insert_id).unwrap_or(0)
    }

    /// Affected-row count from the most recent write, 0 if the connection is gone.
    pub async fn affected_rows(&self) -> u64 {
        self.conn.lock().await.as_ref().map(Connection::affected_rows).unwrap_or(0)
    }

    /// Driver error number from the most recent failed statement, 0 if none or the connection
    /// is gone.
    pub async fn last_error_no(&self) -> u16 {
        self.conn.lock().await.as_ref().map(Connection::last_error_no).unwrap_or(0)
    }

    /// Driver error message from the most recent failed statement, empty if none or the
    /// connection is gone.
    pub async fn last_error(&self) -> String {
        self.conn
            .lock()
            .await
            .as_ref()
            .map(Connection::last_error)
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// Statements sent so far on the held connection, 0 if the connection is gone.
    pub async fn exec_count(&self) -> u64 {
        self.conn.lock().await.as_ref().map(Connection::exec_count).unwrap_or(0)
    }
}

struct RoleInternals<C: Connection> {
    conns: VecDeque<(C, ConnectorInfo)>,
    /// Every connection currently checked out, keyed by lease id, so [`Pool::close`] can reach
    /// in and close them even though ownership of the `C` itself sits inside the task holding
    /// the matching [`Lease`].
    checked_out: HashMap<u64, Arc<Mutex<Option<C>>>>,
    waiters: VecDeque<oneshot::Sender<Lease<C>>>,
    live: u32,
    next_id: u64,
}

impl<C: Connection> RoleInternals<C> {
    fn new() -> Self {
        RoleInternals {
            conns: VecDeque::new(),
            checked_out: HashMap::new(),
            waiters: VecDeque::new(),
            live: 0,
            next_id: 0,
        }
    }

    /// Wrap `conn` as a freshly checked-out lease, registering it in `checked_out`.
    fn checkout(&mut self, conn: C, info: ConnectorInfo) -> Lease<C> {
        self.next_id += 1;
        let id = self.next_id;
        let shared = Arc::new(Mutex::new(Some(conn)));
        self.checked_out.insert(id, shared.clone());
        Lease { id, conn: shared, info }
    }

    /// Hand `conn`/`info` to the oldest waiter if any; otherwise queue it as idle, as long as
    /// the channel isn't already at capacity. Returns the connection back (unwrapped) if
    /// neither was possible (channel full, no waiters) so the caller can close it instead.
    fn release(&mut self, mut conn: C, mut info: ConnectorInfo, capacity: u32) -> Option<(C, ConnectorInfo)> {
        loop {
            if let Some(waiter) = self.waiters.pop_front() {
                let lease = self.checkout(conn, info);
                let id = lease.id;
                let shared = lease.conn.clone();
                match waiter.send(lease) {
                    Ok(()) => return None,
                    Err(returned) => {
                        // Waiter's receiver was dropped; reclaim the connection and try the
                        // next waiter (or the idle channel) instead.
                        drop(returned);
                        self.checked_out.remove(&id);
                        conn = Arc::try_unwrap(shared)
                            .ok()
                            .expect("sole owner once the dropped lease is gone")
                            .into_inner()
                            .expect("just checked out, must still hold a connection");
                        continue;
                    }
                }
            }
            if (self.conns.len() as u32) < capacity {
                info.mark_idle();
                self.conns.push_back((conn, info));
                return None;
            }
            return Some((conn, info));
        }
    }
}

struct Shared<M: Manager> {
    manager: M,
    config: PoolConfig,
    read: Mutex<RoleInternals<M::Connection>>,
    write: Mutex<RoleInternals<M::Connection>>,
    wait_timeout_count: AtomicU32,
    closed: AtomicBool,
}

impl<M: Manager> Shared<M> {
    fn role_internals(&self, role: Role) -> &Mutex<RoleInternals<M::Connection>> {
        match role {
            Role::Read => &self.read,
            Role::Write => &self.write,
        }
    }
}

/// A bounded, dual-channel (read/write) MySQL connection pool.
///
/// Cheaply `Clone`-able; clones share the same underlying channels, counters and reaper task.
pub struct Pool<M: Manager> {
    inner: Arc<Shared<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Manager> Pool<M> {
    /// Build a new pool for `manager`, and spawn its reaper task.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let inner = Arc::new(Shared {
            manager,
            config,
            read: Mutex::new(RoleInternals::new()),
            write: Mutex::new(RoleInternals::new()),
            wait_timeout_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        spawn_reaper(Arc::downgrade(&inner));

        Pool { inner }
    }

    /// Current pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection for `role`, following the three-tier admission algorithm.
    pub async fn get(&self, role: Role) -> Result<Lease<M::Connection>, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        // Fast path: an idle connection is already sitting in the channel.
        let immediate = {
            let mut internals = self.inner.role_internals(role).lock().await;
            internals.conns.pop_front()
        };
        if let Some((conn, mut info)) = immediate {
            info.mark_busy();
            let lease = {
                let mut internals = self.inner.role_internals(role).lock().await;
                internals.checkout(conn, info)
            };
            self.inner.wait_timeout_count.store(0, Ordering::Release);
            return Ok(lease);
        }

        let ceiling = self.inner.config.overflow_ceiling();

        // Tick-then-check: grow if there's still headroom under the ceiling, otherwise fall
        // into the bounded wait. The tick happens while still holding the role lock so two
        // concurrent growers can never both observe headroom and both push `live` past the
        // ceiling.
        let grew = {
            let mut internals = self.inner.role_internals(role).lock().await;
            if internals.live < ceiling {
                internals.live += 1;
                true
            } else {
                false
            }
        };

        if grew {
            match self.inner.manager.connect(role).await {
                Ok(conn) => {
                    self.inner.wait_timeout_count.store(0, Ordering::Release);
                    debug!(?role, "grew pool connection");
                    let lease = {
                        let mut internals = self.inner.role_internals(role).lock().await;
                        internals.checkout(conn, ConnectorInfo::new(role))
                    };
                    return Ok(lease);
                }
                Err(Error::Connect(ConnectError::Driver { code, .. }))
                    if code == TOO_MANY_CONNECTIONS_ERRNO =>
                {
                    // The server is full even though our own ceiling had headroom; fall back
                    // to waiting for a release instead, but roll back our tick first.
                    {
                        let mut internals = self.inner.role_internals(role).lock().await;
                        internals.live -= 1;
                    }
                    let original = Error::Connect(ConnectError::Driver {
                        code,
                        message: "too many connections".to_string(),
                    });
                    if self.wait_for_release(role).await.is_err() {
                        self.inner.wait_timeout_count.fetch_add(1, Ordering::AcqRel);
                    }
                    return Err(original);
                }
                Err(e) => {
                    let mut internals = self.inner.role_internals(role).lock().await;
                    internals.live -= 1;
                    return Err(e);
                }
            }
        }

        // Ceiling already reached: wait for a release, subject to the fatal threshold.
        if self.inner.wait_timeout_count.load(Ordering::Acquire) > self.inner.config.max_wait_timeout_count {
            return Err(Error::ConnectFatal(self.inner.wait_timeout_count.load(Ordering::Acquire)));
        }

        match self.wait_for_release(role).await {
            Ok(lease) => {
                self.inner.wait_timeout_count.store(0, Ordering::Release);
                Ok(lease)
            }
            Err(e) => {
                self.inner.wait_timeout_count.fetch_add(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    async fn wait_for_release(&self, role: Role) -> Result<Lease<M::Connection>, Error> {
        let (tx, rx) = oneshot::channel();
        {
            let mut internals = self.inner.role_internals(role).lock().await;
            internals.waiters.push_back(tx);
        }
        match tokio::time::timeout(Duration::from_secs(4), rx).await {
            Ok(Ok(mut lease)) => {
                lease.info.mark_busy();
                Ok(lease)
            }
            Ok(Err(_)) => Err(Error::Connect(ConnectError::Closed)),
            Err(_) => Err(Error::Connect(ConnectError::Timeout)),
        }
    }

    /// Return `lease` to the pool. Closes it instead of queueing it if the pool is closed,
    /// the channel is already at capacity, or it is no longer healthy. A no-op if
    /// [`Self::close`] already reached in and force-closed this connection while it was
    /// checked out.
    pub async fn put(&self, role: Role, lease: Lease<M::Connection>) {
        let closed = self.inner.closed.load(Ordering::Acquire);
        let Lease { id, conn: shared, mut info } = lease;

        {
            let mut internals = self.inner.role_internals(role).lock().await;
            internals.checked_out.remove(&id);
        }

        let Some(conn) = shared.lock().await.take() else {
            // Pool::close already force-closed this connection; the decrement already
            // happened there, so there's nothing left to account for.
            return;
        };

        if closed || !is_healthy(&conn, &self.inner.config) {
            let mut internals = self.inner.role_internals(role).lock().await;
            internals.live = internals.live.saturating_sub(1);
            drop(internals);
            conn.close().await;
            return;
        }

        info.mark_idle();
        let leftover = {
            let mut internals = self.inner.role_internals(role).lock().await;
            internals.release(conn, info, self.inner.config.size)
        };

        if let Some((conn, _info)) = leftover {
            // Channel was already full and there were no waiters: this connection is surplus
            // idle capacity, so it is closed rather than queued.
            let mut internals = self.inner.role_internals(role).lock().await;
            internals.live = internals.live.saturating_sub(1);
            drop(internals);
            conn.close().await;
        }
    }

    /// Close the pool: further `get`s fail with [`Error::PoolClosed`], every idle connection is
    /// closed immediately, and every connection currently checked out by a task is reached
    /// through its shared `checked_out` handle and closed too — not just left to the holding
    /// task to notice eventually. Any in-flight or subsequent call through that task's `Lease`
    /// then fails with [`Error::PoolClosed`] instead of silently reusing a connection that's
    /// gone.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for role in [Role::Read, Role::Write] {
            let (idle, checked_out): (Vec<_>, Vec<_>) = {
                let mut internals = self.inner.role_internals(role).lock().await;
                internals.waiters.clear();
                let idle = internals.conns.drain(..).collect();
                let checked_out = internals.checked_out.values().cloned().collect();
                (idle, checked_out)
            };
            for (conn, _info) in idle {
                conn.close().await;
            }
            for shared in checked_out {
                if let Some(conn) = shared.lock().await.take() {
                    conn.close().await;
                }
            }
        }
        info!("pool closed");
    }
}

fn is_healthy<C: Connection>(conn: &C, config: &PoolConfig) -> bool {
    if conn.exec_count() >= config.max_exec_count {
        return false;
    }
    if conn.seconds_since_last_exec() >= config.max_idle_seconds {
        return false;
    }
    true
}

fn spawn_reaper<M: Manager>(weak: std::sync::Weak<Shared<M>>) {
    tokio::spawn(async move {
        loop {
            let interval = match weak.upgrade() {
                Some(shared) => shared.config.reaper_interval(),
                None => return,
            };
            tokio::time::sleep(interval).await;
            let Some(shared) = weak.upgrade() else { return };
            if shared.closed.load(Ordering::Acquire) {
                return;
            }
            for role in [Role::Read, Role::Write] {
                reap_role(&shared, role).await;
            }
        }
    });
}

/// Sweep at most the channel's current length once, closing anything idle past
/// `max_idle_seconds`. Holding the role lock for the whole sweep (rather than popping one at a
/// time with a short timeout) removes the race where the reaper's pop could snatch a
/// connection a concurrent acquirer had just been handed.
async fn reap_role<M: Manager>(shared: &Shared<M>, role: Role) {
    let mut internals = shared.role_internals(role).lock().await;
    let before = internals.conns.len();
    let mut kept = VecDeque::with_capacity(before);
    let mut reaped = Vec::new();

    for (conn, info) in internals.conns.drain(..) {
        if conn.seconds_since_last_exec() >= shared.config.max_idle_seconds {
            reaped.push(conn);
        } else {
            kept.push_back((conn, info));
        }
    }
    internals.live = internals.live.saturating_sub(reaped.len() as u32);
    internals.conns = kept;
    drop(internals);

    if !reaped.is_empty() {
        debug!(?role, reaped = reaped.len(), "reaper closed idle connections");
    }
    for conn in reaped {
        conn.close().await;
    }
}

/// An explicit, constructible registry deduplicating [`Pool`]s by their manager's
/// [`Manager::key`]. This replaces a hidden process-wide singleton so tests can build
/// isolated registries instead of sharing global state.
pub struct PoolRegistry<M: Manager> {
    pools: Mutex<HashMap<String, Pool<M>>>,
}

impl<M: Manager> Default for PoolRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Manager> PoolRegistry<M> {
    /// An empty registry.
    pub fn new() -> Self {
        PoolRegistry {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Return the pool registered under `manager.key()`, creating it with `config` if this is
    /// the first request for that key. `config` is ignored on a cache hit.
    pub async fn get_or_create(&self, manager: M, config: PoolConfig) -> Pool<M>
    where
        M: Clone,
    {
        let key = manager.key();
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&key) {
            return pool.clone();
        }
        let pool = Pool::new(manager, config);
        pools.insert(key, pool.clone());
        pool
    }

    /// Remove and close the pool registered under `key`, if any.
    pub async fn remove(&self, key: &str) {
        let pool = {
            let mut pools = self.pools.lock().await;
            pools.remove(key)
        };
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

impl PoolRegistry<ConnectorBuilder> {
    /// A process-wide registry for the concrete MySQL manager, for callers that want
    /// DSN-keyed sharing without wiring their own registry through the call stack.
    pub fn global() -> &'static PoolRegistry<ConnectorBuilder> {
        static GLOBAL: OnceLock<PoolRegistry<ConnectorBuilder>> = OnceLock::new();
        GLOBAL.get_or_init(PoolRegistry::new)
    }
}
