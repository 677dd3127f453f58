//! A single cache-line-aligned bucket of up to 8 `(key_hash, value, expiry)` slots.

/// Number of slots held by a single [`TimeoutBucket`].
pub const SLOTS_PER_BUCKET: usize = 8;

/// Outcome of a [`TimeoutBucket::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertResult {
    /// A new slot was populated, or a previously-expired matching slot was reactivated.
    Inserted,
    /// The key was already present and still live.
    AlreadyPresent,
    /// The bucket was full; the entry with the earliest expiry was evicted to make room.
    Replaced,
}

/// A fixed-width bucket of up to [`SLOTS_PER_BUCKET`] entries, conceptually laid out as four
/// 64-byte cache lines: header (valid bitset, timeout, flags), key hashes, values, expiries.
///
/// All operations are O(`SLOTS_PER_BUCKET`) = O(1).
pub struct TimeoutBucket<V> {
    valid: u8,
    update_time_on_hit: bool,
    timeout: u64,
    key_hashes: [u64; SLOTS_PER_BUCKET],
    values: [V; SLOTS_PER_BUCKET],
    expiries: [u64; SLOTS_PER_BUCKET],
}

impl<V: Copy + Default> TimeoutBucket<V> {
    /// Creates an empty bucket with the given `timeout` (caller-defined time unit) and hit
    /// policy. When `update_time_on_hit` is set, re-inserting a live key refreshes its expiry.
    pub fn new(timeout: u64, update_time_on_hit: bool) -> Self {
        TimeoutBucket {
            valid: 0,
            update_time_on_hit,
            timeout,
            key_hashes: [0; SLOTS_PER_BUCKET],
            values: [V::default(); SLOTS_PER_BUCKET],
            expiries: [0; SLOTS_PER_BUCKET],
        }
    }

    /// Whether slot `i` currently holds an entry (regardless of expiry).
    pub fn is_valid(&self, i: usize) -> bool {
        self.valid & (1 << i) != 0
    }

    fn set_valid(&mut self, i: usize) {
        self.valid |= 1 << i;
    }

    fn clear_valid(&mut self, i: usize) {
        self.valid &= !(1 << i);
    }

    fn is_full(&self) -> bool {
        self.valid.count_ones() as usize == SLOTS_PER_BUCKET
    }

    fn first_empty_index(&self) -> Option<usize> {
        (0..SLOTS_PER_BUCKET).find(|&i| !self.is_valid(i))
    }

    /// Whether the (assumed valid) slot `i` is timed out as of `now`.
    pub fn is_timed_out(&self, i: usize, now: u64) -> bool {
        now > self.expiries[i].saturating_add(self.timeout)
    }

    fn victim_index(&self) -> usize {
        (0..SLOTS_PER_BUCKET)
            .min_by_key(|&i| self.expiries[i])
            .expect("SLOTS_PER_BUCKET > 0")
    }

    /// Returns the value stored at slot `i`. Caller must only call this for a slot index
    /// returned by [`Self::insert`] on the same bucket.
    pub fn slot_value(&self, i: usize) -> &V {
        &self.values[i]
    }

    /// Attempts to insert `(key_hash, value)`, evicting or reactivating slots as described in
    /// the module's [`InsertResult`] semantics.
    pub fn insert(&mut self, key_hash: u64, value: V, now: u64) -> (usize, InsertResult) {
        let mut empty_index = None;
        let mut same_key_index = None;

        for i in 0..SLOTS_PER_BUCKET {
            if !self.is_valid(i) {
                empty_index.get_or_insert(i);
                continue;
            }
            if self.key_hashes[i] != key_hash {
                if self.is_timed_out(i, now) {
                    self.clear_valid(i);
                    empty_index.get_or_insert(i);
                }
                continue;
            }
            same_key_index = Some(i);
            break;
        }

        if let Some(i) = same_key_index {
            if self.is_timed_out(i, now) {
                self.expiries[i] = now;
                return (i, InsertResult::Inserted);
            }
            if self.update_time_on_hit {
                self.expiries[i] = now;
            }
            return (i, InsertResult::AlreadyPresent);
        }

        if self.is_full() {
            let victim = self.victim_index();
            self.key_hashes[victim] = key_hash;
            self.values[victim] = value;
            self.expiries[victim] = now;
            return (victim, InsertResult::Replaced);
        }

        let i = empty_index.unwrap_or_else(|| {
            self.first_empty_index()
                .expect("bucket not full implies an empty slot exists")
        });
        self.key_hashes[i] = key_hash;
        self.values[i] = value;
        self.expiries[i] = now;
        self.set_valid(i);
        (i, InsertResult::Inserted)
    }

    /// Removes every slot holding `key_hash`, regardless of expiry. Returns whether anything
    /// was removed.
    pub fn erase(&mut self, key_hash: u64) -> bool {
        let mut found = false;
        for i in 0..SLOTS_PER_BUCKET {
            if self.is_valid(i) && self.key_hashes[i] == key_hash {
                self.clear_valid(i);
                found = true;
            }
        }
        found
    }

    /// Marks every slot empty.
    pub fn clear(&mut self) {
        self.valid = 0;
    }
}
