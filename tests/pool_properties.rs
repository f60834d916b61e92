//! Property-based checks for the Pool's admission algorithm, run over randomly generated
//! `get`/`put` sequences against a fake, zero-I/O backend.

use std::time::Duration;

use async_trait::async_trait;
use mysql_async::Params;
use proptest::prelude::*;

use mysql_rw_pool::connector::{Connection, Exec, Manager, Role};
use mysql_rw_pool::error::Error;
use mysql_rw_pool::pool::{Lease, Pool};
use mysql_rw_pool::PoolConfig;

struct NullConnector;

#[async_trait]
impl Connection for NullConnector {
    fn exec_count(&self) -> u64 {
        0
    }

    fn seconds_since_last_exec(&self) -> u64 {
        0
    }

    fn has_broken(&self) -> bool {
        false
    }

    async fn close(self) {}

    async fn query(&mut self, _sql: &str, _params: Params, _timeout: Duration) -> Result<Exec, Error> {
        Ok(Exec::Affected(0))
    }

    async fn begin(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    async fn commit(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    async fn rollback(&mut self, _timeout: Duration) {}

    fn in_transaction(&self) -> bool {
        false
    }

    fn last_insert_id(&self) -> u64 {
        0
    }

    fn affected_rows(&self) -> u64 {
        0
    }

    fn last_error_no(&self) -> u16 {
        0
    }

    fn last_error(&self) -> &str {
        ""
    }
}

#[derive(Clone)]
struct NullManager;

#[async_trait]
impl Manager for NullManager {
    type Connection = NullConnector;

    async fn connect(&self, _role: Role) -> Result<NullConnector, Error> {
        Ok(NullConnector)
    }

    fn key(&self) -> String {
        "null".to_string()
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Get,
    /// Put back the held lease at this index, modulo the number currently held.
    Put(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Get),
        2 => (0usize..8).prop_map(Op::Put),
    ]
}

proptest! {
    /// Testable Property 1: for any sequence of concurrent get/put on a pool of size S with
    /// overflow factor F, live connections per role never exceed F*S — and, since every get
    /// either reuses an idle connection or grows under the same role lock, `get` never blocks
    /// past the ceiling either (a synthetic `get` that _would_ block is simply left un-put).
    #[test]
    fn live_connections_never_exceed_the_overflow_ceiling(ops in proptest::collection::vec(op_strategy(), 0..40)) {
        let size = 2u32;
        let overflow_factor = 2u32;
        let ceiling = size * overflow_factor;

        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async move {
            let pool = Pool::new(NullManager, PoolConfig::new().size(size).overflow_factor(overflow_factor));
            let mut held: Vec<Lease<NullConnector>> = Vec::new();

            for op in ops {
                match op {
                    Op::Get => {
                        // Bound the wait so a full-ceiling Get doesn't stall the test; a timeout
                        // here just means this op contributed nothing to `held`.
                        if let Ok(Ok(lease)) = tokio::time::timeout(Duration::from_millis(50), pool.get(Role::Read)).await {
                            held.push(lease);
                        }
                    }
                    Op::Put(idx) => {
                        if !held.is_empty() {
                            let lease = held.remove(idx % held.len());
                            pool.put(Role::Read, lease).await;
                        }
                    }
                }
                prop_assert!(held.len() as u32 <= ceiling);
            }

            // drain whatever is still held so the runtime can shut down cleanly
            for lease in held {
                pool.put(Role::Read, lease).await;
            }
            Ok(())
        })?;
    }
}
