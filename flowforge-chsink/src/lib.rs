//! ClickHouse sink driver: a single producer thread converts an incoming record stream into
//! column blocks, and a pool of inserter worker threads drains them into ClickHouse, retrying
//! and rotating endpoints on failure.

mod clickhouse_client;
mod config;

pub use clickhouse_client::{Endpoint, LiveClickHouseClient};
pub use config::SinkConfig;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowforge_chsink_core::{BlockPool, ChSinkError, ClickHouseClient, FilledItem, Inserter, Producer};
use flowforge_transport::{ReceiveEvent, Transport};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while loading configuration or running the sink driver. Per-record and
/// per-insert failures never reach this type: those are handled (skipped, or retried forever)
/// inside the core pipeline and only ever surface as log lines.
#[derive(Debug, Error)]
pub enum SinkDriverError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid sink configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error(transparent)]
    Core(#[from] ChSinkError),
}

/// Spawns `inserter_threads` [`Inserter`] workers, each built from its own client (via
/// `make_client`, typically one [`LiveClickHouseClient`] per worker so they don't share a
/// connection) and draining `pool`'s filled queue until it sees its shutdown sentinel.
///
/// Returns each worker's join handle alongside a `last_error` slot the caller can poll.
pub fn spawn_inserters(
    pool: Arc<BlockPool>,
    table: String,
    inserter_threads: usize,
    stop: Arc<AtomicBool>,
    make_client: impl Fn(usize) -> Box<dyn ClickHouseClient>,
) -> (Vec<thread::JoinHandle<()>>, Vec<Arc<Mutex<Option<String>>>>) {
    let mut handles = Vec::with_capacity(inserter_threads);
    let mut error_slots = Vec::with_capacity(inserter_threads);

    for worker_id in 0..inserter_threads {
        let pool = Arc::clone(&pool);
        let table = table.clone();
        let stop = Arc::clone(&stop);
        let last_error = Arc::new(Mutex::new(None));
        error_slots.push(Arc::clone(&last_error));
        let client = make_client(worker_id);

        handles.push(thread::spawn(move || {
            let mut inserter = Inserter::new(worker_id, pool, client, table, stop, last_error);
            inserter.run();
        }));
    }

    (handles, error_slots)
}

/// Drives the producer side of the pipeline: waits for the first `FormatChange` to build a
/// [`Producer`] against the pool, converts every record that follows, and flushes on shutdown.
///
/// A record arriving before any `FormatChange` is dropped with a warning; every driver in this
/// repository treats an unresolved schema the same way.
///
/// The receive loop is bounded by `delay_threshold`: per SPEC_FULL/spec §4.7 step 3, a partially
/// filled block must flush once `delay_threshold` has elapsed since the last flush even if no
/// further records arrive, so idling on a plain blocking `receive()` would never fire that
/// timer. Every timeout gives the producer a chance to flush on its own clock.
pub fn run_producer<T: Transport>(
    transport: &mut T,
    pool: Arc<BlockPool>,
    inserter_threads: usize,
    size_threshold: usize,
    delay_threshold: Duration,
) {
    let mut producer: Option<Producer> = None;

    loop {
        match transport.receive_timeout(delay_threshold) {
            None => {
                if let Some(producer) = producer.as_mut() {
                    producer.flush_if_due();
                }
            }
            Some(ReceiveEvent::EndOfStream) => {
                match producer {
                    Some(mut producer) => {
                        producer.flush_partial();
                        producer.send_shutdown_sentinels(inserter_threads);
                    }
                    None => {
                        for _ in 0..inserter_threads {
                            pool.push_filled(FilledItem::Shutdown);
                        }
                    }
                }
                debug!("transport closed, exiting cleanly");
                return;
            }
            Some(ReceiveEvent::FormatChange(_schema)) => {
                producer = Some(Producer::new(Arc::clone(&pool), size_threshold, delay_threshold));
                info!("upstream schema confirmed, producer ready");
            }
            Some(ReceiveEvent::Record(record)) => match producer.as_mut() {
                Some(producer) => {
                    if let Err(err) = producer.push(&record) {
                        warn!(error = %err, "skipping record that failed block conversion");
                    }
                }
                None => warn!("dropping record received before any format change"),
            },
        }
    }
}
