//! Blocking producer/inserter handoff: an empty-block stack and a filled-block queue shared
//! between the single producer and the N inserter worker threads.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

use crate::block::Block;
use crate::column::ColumnSpec;
use crate::ChSinkError;

/// An item pulled off the filled queue by an inserter worker: either a block to send, or the
/// one-per-worker sentinel that tells it to exit its loop.
pub enum FilledItem {
    Block(Block),
    Shutdown,
}

/// Owns every block for the lifetime of the sink. Blocks move between `empty` (a LIFO, so a
/// recently-used block's allocation stays hot) and `filled` (a FIFO, so inserts happen roughly
/// in arrival order) and are never freed until the pool itself is dropped.
pub struct BlockPool {
    empty: Mutex<Vec<Block>>,
    empty_cv: Condvar,
    filled: Mutex<VecDeque<FilledItem>>,
    filled_cv: Condvar,
    specs: Vec<ColumnSpec>,
}

impl BlockPool {
    /// Allocates `block_count` empty blocks for the given column layout.
    pub fn new(block_count: usize, specs: Vec<ColumnSpec>) -> Result<Self, ChSinkError> {
        if block_count == 0 {
            return Err(ChSinkError::BadCapacity(0));
        }
        let empty = (0..block_count).map(|_| Block::new(specs.clone())).collect();
        Ok(BlockPool {
            empty: Mutex::new(empty),
            empty_cv: Condvar::new(),
            filled: Mutex::new(VecDeque::new()),
            filled_cv: Condvar::new(),
            specs,
        })
    }

    /// The column layout every block in this pool was built for.
    pub fn specs(&self) -> &[ColumnSpec] {
        &self.specs
    }

    /// Pops an empty block, blocking until the inserters return one.
    pub fn pop_empty(&self) -> Block {
        let mut guard = self.empty.lock();
        loop {
            if let Some(block) = guard.pop() {
                return block;
            }
            self.empty_cv.wait(&mut guard);
        }
    }

    /// Returns a cleared block to the empty pool.
    pub fn push_empty(&self, block: Block) {
        let mut guard = self.empty.lock();
        guard.push(block);
        self.empty_cv.notify_one();
    }

    /// Queues a filled block, or a shutdown sentinel, for an inserter worker to pick up.
    pub fn push_filled(&self, item: FilledItem) {
        let mut guard = self.filled.lock();
        guard.push_back(item);
        self.filled_cv.notify_one();
    }

    /// Pops the next filled item, blocking until one is available.
    pub fn pop_filled(&self) -> FilledItem {
        let mut guard = self.filled.lock();
        loop {
            if let Some(item) = guard.pop_front() {
                return item;
            }
            self.filled_cv.wait(&mut guard);
        }
    }
}
