//! Worker threads that drain filled blocks from the [`BlockPool`] and insert them into
//! ClickHouse, reconnecting and rotating endpoints on failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::{validate_schema, ClickHouseClient};
use crate::pool::{BlockPool, FilledItem};

/// Back-off between a failed insert and the next retry attempt.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// One inserter worker's view of the pool it drains and the client it drives.
///
/// Built once per worker thread; [`Inserter::run`] blocks the calling thread until it receives
/// the shutdown sentinel or `stop` is observed set.
pub struct Inserter {
    pool: Arc<BlockPool>,
    client: Box<dyn ClickHouseClient>,
    table: String,
    stop: Arc<AtomicBool>,
    last_error: Arc<Mutex<Option<String>>>,
    worker_id: usize,
}

impl Inserter {
    /// Builds a worker. `last_error` is a per-worker slot the driver can poll for the most
    /// recent transient failure, surfaced without ever aborting the retry loop itself.
    pub fn new(
        worker_id: usize,
        pool: Arc<BlockPool>,
        client: Box<dyn ClickHouseClient>,
        table: String,
        stop: Arc<AtomicBool>,
        last_error: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Inserter {
            pool,
            client,
            table,
            stop,
            last_error,
            worker_id,
        }
    }

    /// Runs this worker's drain loop until it pops the shutdown sentinel.
    ///
    /// `InsertFailed` never escapes this loop: a failed insert is retried forever (1s back-off,
    /// rotating to the next configured endpoint and re-validating schema each attempt) unless
    /// `stop` has been requested, in which case the worker exits without re-queueing its block.
    pub fn run(&mut self) {
        loop {
            match self.pool.pop_filled() {
                FilledItem::Shutdown => {
                    debug!(worker = self.worker_id, "inserter received shutdown sentinel");
                    return;
                }
                FilledItem::Block(mut block) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }
                    self.insert_with_retry(&mut block);
                    block.clear();
                    self.pool.push_empty(block);
                }
            }
        }
    }

    fn insert_with_retry(&mut self, block: &mut crate::block::Block) {
        loop {
            match self.client.insert(&self.table, block) {
                Ok(()) => {
                    *self.last_error.lock() = None;
                    debug!(
                        worker = self.worker_id,
                        rows = block.row_count(),
                        endpoint = %self.client.current_endpoint(),
                        "inserted block"
                    );
                    return;
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!(
                        worker = self.worker_id,
                        endpoint = %self.client.current_endpoint(),
                        error = %message,
                        "insert failed, reconnecting and retrying"
                    );
                    *self.last_error.lock() = Some(message);

                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }
                    std::thread::sleep(RETRY_BACKOFF);
                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }

                    if let Err(reconnect_err) = self.client.reset_connection_endpoint() {
                        warn!(
                            worker = self.worker_id,
                            error = %reconnect_err,
                            "failed to rotate endpoint, retrying from current one"
                        );
                        continue;
                    }
                    if let Err(schema_err) =
                        validate_schema(self.client.as_mut(), &self.table, self.pool.specs())
                    {
                        // A schema mismatch after rotating endpoints means the new endpoint
                        // disagrees with the old one; surface it like any other transient
                        // failure and keep retrying rather than wedging the worker.
                        *self.last_error.lock() = Some(schema_err.to_string());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::parse_column_type;
    use crate::{Block, BlockPool, ChSinkError, ColumnSpec};
    use flowforge_record::FieldId;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    fn specs() -> Vec<ColumnSpec> {
        vec![ColumnSpec {
            name: "dst_port".to_string(),
            field_id: FieldId(0),
            db_type: parse_column_type("uint16").unwrap(),
        }]
    }

    struct FlakyClient {
        fail_times: usize,
        endpoint: usize,
        insert_calls: Arc<StdMutex<usize>>,
    }

    impl ClickHouseClient for FlakyClient {
        fn describe_table(&mut self, _table: &str) -> Result<Vec<(String, String)>, ChSinkError> {
            Ok(vec![("dst_port".to_string(), "Nullable(UInt16)".to_string())])
        }
        fn insert(&mut self, _table: &str, _block: &Block) -> Result<(), ChSinkError> {
            let mut calls = self.insert_calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_times {
                Err(ChSinkError::InsertFailed("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
        fn reset_connection_endpoint(&mut self) -> Result<(), ChSinkError> {
            self.endpoint += 1;
            Ok(())
        }
        fn current_endpoint(&self) -> String {
            format!("endpoint-{}", self.endpoint)
        }
    }

    #[test]
    fn retries_until_success_then_returns_block_to_empty_pool() {
        let pool = Arc::new(BlockPool::new(1, specs()).unwrap());
        let block = pool.pop_empty();
        pool.push_filled(crate::FilledItem::Block(block));
        pool.push_filled(crate::FilledItem::Shutdown);

        let calls = Arc::new(StdMutex::new(0));
        let client = Box::new(FlakyClient {
            fail_times: 1,
            endpoint: 0,
            insert_calls: Arc::clone(&calls),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));

        let mut inserter = Inserter::new(0, Arc::clone(&pool), client, "flows".to_string(), stop, last_error);
        inserter.run();

        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn shutdown_sentinel_exits_without_blocking() {
        let pool = Arc::new(BlockPool::new(1, specs()).unwrap());
        pool.push_filled(crate::FilledItem::Shutdown);

        let client = Box::new(FlakyClient {
            fail_times: 0,
            endpoint: 0,
            insert_calls: Arc::new(StdMutex::new(0)),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let last_error = Arc::new(Mutex::new(None));
        let mut inserter = Inserter::new(0, pool, client, "flows".to_string(), stop, last_error);
        inserter.run();
    }
}
