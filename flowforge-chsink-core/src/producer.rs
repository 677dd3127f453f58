//! Single-threaded record-to-block conversion, flushing on a size or time threshold.

use std::time::{Duration, Instant};

use flowforge_record::TypedRecord;
use tracing::debug;

use crate::pool::{BlockPool, FilledItem};
use crate::ChSinkError;

/// Converts incoming records into the pool's blocks, flushing to the filled queue once a block
/// reaches `size_threshold` rows or `delay_threshold` has elapsed since the last flush.
pub struct Producer {
    pool: std::sync::Arc<BlockPool>,
    current: crate::block::Block,
    size_threshold: usize,
    delay_threshold: Duration,
    last_flush: Instant,
}

impl Producer {
    /// Pops an initial block from `pool` and starts the flush-delay clock.
    pub fn new(
        pool: std::sync::Arc<BlockPool>,
        size_threshold: usize,
        delay_threshold: Duration,
    ) -> Self {
        let current = pool.pop_empty();
        Producer {
            pool,
            current,
            size_threshold,
            delay_threshold,
            last_flush: Instant::now(),
        }
    }

    /// Appends one record to the current block and flushes if either threshold is crossed.
    pub fn push(&mut self, record: &TypedRecord) -> Result<(), ChSinkError> {
        self.current.append_record(record)?;
        self.flush_if_due();
        Ok(())
    }

    /// Flushes the current block if its row count or the elapsed delay since the last flush has
    /// crossed the configured threshold. A no-op on an empty block (nothing to send, and an
    /// empty flush would otherwise reset the delay clock for no reason).
    pub fn flush_if_due(&mut self) {
        if self.current.row_count() == 0 {
            return;
        }
        let due_by_size = self.current.row_count() >= self.size_threshold;
        let due_by_delay = self.last_flush.elapsed() >= self.delay_threshold;
        if due_by_size || due_by_delay {
            self.flush();
        }
    }

    /// Unconditionally flushes the current block (even if partially filled), used on shutdown.
    pub fn flush_partial(&mut self) {
        if self.current.row_count() > 0 {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let next = self.pool.pop_empty();
        let filled = std::mem::replace(&mut self.current, next);
        let rows = filled.row_count();
        self.pool.push_filled(FilledItem::Block(filled));
        self.last_flush = Instant::now();
        debug!(rows, "flushed block to inserter queue");
    }

    /// Sends one shutdown sentinel per inserter worker, to be called after a final
    /// [`Self::flush_partial`].
    pub fn send_shutdown_sentinels(&self, worker_count: usize) {
        for _ in 0..worker_count {
            self.pool.push_filled(FilledItem::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::parse_column_type;
    use crate::{BlockPool, ColumnSpec, FilledItem};
    use flowforge_record::{FieldId, Schema, TypedValue};
    use std::sync::Arc;

    fn specs() -> Vec<ColumnSpec> {
        vec![ColumnSpec {
            name: "dst_port".to_string(),
            field_id: FieldId(0),
            db_type: parse_column_type("uint16").unwrap(),
        }]
    }

    fn record(port: u16) -> TypedRecord {
        let schema = Schema::new(vec![("dst_port".to_string(), flowforge_record::FieldKind::U16)]);
        let mut r = TypedRecord::new(schema.len());
        r.set(FieldId(0), TypedValue::U16(port));
        r
    }

    #[test]
    fn flushes_on_size_threshold() {
        let pool = Arc::new(BlockPool::new(2, specs()).unwrap());
        let mut producer = Producer::new(Arc::clone(&pool), 2, Duration::from_secs(3600));

        producer.push(&record(1)).unwrap();
        producer.push(&record(2)).unwrap();

        assert!(matches!(pool.pop_filled(), FilledItem::Block(b) if b.row_count() == 2));
    }

    #[test]
    fn flushes_on_delay_threshold() {
        let pool = Arc::new(BlockPool::new(2, specs()).unwrap());
        let mut producer = Producer::new(Arc::clone(&pool), 1000, Duration::from_millis(10));

        producer.push(&record(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        producer.flush_if_due();

        assert!(matches!(pool.pop_filled(), FilledItem::Block(b) if b.row_count() == 1));
    }

    #[test]
    fn partial_block_flushes_on_shutdown() {
        let pool = Arc::new(BlockPool::new(2, specs()).unwrap());
        let mut producer = Producer::new(Arc::clone(&pool), 1000, Duration::from_secs(3600));

        producer.push(&record(1)).unwrap();
        producer.flush_partial();
        producer.send_shutdown_sentinels(1);

        assert!(matches!(pool.pop_filled(), FilledItem::Block(b) if b.row_count() == 1));
        assert!(matches!(pool.pop_filled(), FilledItem::Shutdown));
    }

    #[test]
    fn empty_block_never_flushes() {
        let pool = Arc::new(BlockPool::new(1, specs()).unwrap());
        let mut producer = Producer::new(Arc::clone(&pool), 1, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        producer.flush_if_due();
        producer.flush_partial();
        // The single block is still held by the producer; nothing was ever pushed to filled.
        drop(producer);
    }
}
