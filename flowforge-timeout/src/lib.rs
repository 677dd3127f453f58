//! Cache-line-aware, timeout-evicting hash-sharded map.
//!
//! A [`TimeoutMap`] shards keys across a power-of-two array of
//! [`TimeoutBucket`](bucket::TimeoutBucket)s, each holding up to 8 entries. Capacity is fixed
//! at construction; once a shard's 8 slots are full, the entry with the earliest expiry is
//! evicted to make room rather than growing the map.

mod bucket;

use thiserror::Error;

pub use bucket::{InsertResult, TimeoutBucket, SLOTS_PER_BUCKET};

/// Errors raised while constructing a [`TimeoutMap`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeoutMapError {
    /// `bucket_count_exponent` must be at least 3 (one bucket holds 8 = 2^3 slots).
    #[error("bucket count exponent {0} is below the minimum of 3 (8 slots per bucket)")]
    BadCapacity(u32),
}

/// Identifies a specific slot within a [`TimeoutMap`], as returned by [`TimeoutMap::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotRef {
    bucket: usize,
    slot: usize,
}

/// A fixed-capacity map from arbitrary keys to values, sharded by a 64-bit hash of the key and
/// evicting by expiry rather than growing past its configured bucket count.
///
/// `H` is a caller-supplied function mapping `&K` to a 64-bit hash; this mirrors the
/// original design's use of an externally supplied hasher rather than [`std::hash::Hash`], so
/// callers can reuse a hash already computed for other purposes (e.g. flow-key hashing shared
/// between deduplication and rule matching).
pub struct TimeoutMap<K, V, H> {
    buckets: Vec<TimeoutBucket<V>>,
    bucket_mask: usize,
    hasher: H,
    _key: std::marker::PhantomData<fn(&K)>,
}

impl<K, V, H> TimeoutMap<K, V, H>
where
    V: Copy + Default,
    H: Fn(&K) -> u64,
{
    /// Creates a map with `2^bucket_count_exponent / 8` buckets (so `bucket_count_exponent` is
    /// the total slot-count exponent, matching the original parameter name). Each bucket
    /// entry expires `timeout` time units (caller-defined unit, consistently a monotonic
    /// counter) after its last (re)insertion.
    pub fn new(
        bucket_count_exponent: u32,
        timeout: u64,
        update_time_on_hit: bool,
        hasher: H,
    ) -> Result<Self, TimeoutMapError> {
        if bucket_count_exponent < 3 {
            return Err(TimeoutMapError::BadCapacity(bucket_count_exponent));
        }
        let bucket_count = 1usize << (bucket_count_exponent - 3);
        let buckets = (0..bucket_count)
            .map(|_| TimeoutBucket::new(timeout, update_time_on_hit))
            .collect();
        Ok(TimeoutMap {
            buckets,
            bucket_mask: bucket_count - 1,
            hasher,
            _key: std::marker::PhantomData,
        })
    }

    /// Number of buckets (shards) backing this map.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, key_hash: u64) -> usize {
        (key_hash as usize) & self.bucket_mask
    }

    /// Inserts `(key, value)`, returning the slot it now occupies and the outcome.
    pub fn insert(&mut self, key: &K, value: V, now: u64) -> (SlotRef, InsertResult) {
        let key_hash = (self.hasher)(key);
        let bucket = self.bucket_index(key_hash);
        let (slot, result) = self.buckets[bucket].insert(key_hash, value, now);
        (SlotRef { bucket, slot }, result)
    }

    /// Reads the value stored at a slot previously returned by [`Self::insert`].
    pub fn value_at(&self, slot: SlotRef) -> &V {
        self.buckets[slot.bucket].slot_value(slot.slot)
    }

    /// Removes `key` if present. Returns whether anything was removed.
    pub fn erase(&mut self, key: &K) -> bool {
        let key_hash = (self.hasher)(key);
        let bucket = self.bucket_index(key_hash);
        self.buckets[bucket].erase(key_hash)
    }

    /// Empties every bucket.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Iterates over every live (non-expired) value as of `now`, in bucket-then-slot order.
    pub fn iter(&self, now: u64) -> impl Iterator<Item = &V> {
        self.buckets.iter().flat_map(move |bucket| {
            (0..SLOTS_PER_BUCKET).filter_map(move |i| {
                if bucket.is_valid(i) && !bucket.is_timed_out(i, now) {
                    Some(bucket.slot_value(i))
                } else {
                    None
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_hasher(key: &u64) -> u64 {
        *key
    }

    #[test]
    fn rejects_small_capacity() {
        let err = TimeoutMap::<u64, u64, _>::new(2, 1000, true, identity_hasher).unwrap_err();
        assert_eq!(err, TimeoutMapError::BadCapacity(2));
    }

    #[test]
    fn insert_then_lookup_roundtrips() {
        let mut map = TimeoutMap::<u64, u64, _>::new(4, 1000, true, identity_hasher).unwrap();
        let (slot, result) = map.insert(&42, 4242, 0);
        assert_eq!(result, InsertResult::Inserted);
        assert_eq!(*map.value_at(slot), 4242);
    }

    #[test]
    fn duplicate_insert_within_timeout_is_already_present() {
        let mut map = TimeoutMap::<u64, u64, _>::new(4, 1000, true, identity_hasher).unwrap();
        map.insert(&42, 1, 0);
        let (_, result) = map.insert(&42, 2, 100);
        assert_eq!(result, InsertResult::AlreadyPresent);
    }

    #[test]
    fn erase_then_reinsert_is_fresh() {
        let mut map = TimeoutMap::<u64, u64, _>::new(4, 1000, true, identity_hasher).unwrap();
        map.insert(&42, 1, 0);
        assert!(map.erase(&42));
        let (_, result) = map.insert(&42, 2, 1);
        assert_eq!(result, InsertResult::Inserted);
    }

    #[test]
    fn iter_skips_expired_entries() {
        let mut map = TimeoutMap::<u64, u64, _>::new(4, 100, true, identity_hasher).unwrap();
        map.insert(&1, 10, 0);
        map.insert(&2, 20, 0);
        let live: Vec<_> = map.iter(50).copied().collect();
        assert_eq!(live.len(), 2);
        let live: Vec<_> = map.iter(10_000).copied().collect();
        assert!(live.is_empty());
    }

    #[test]
    fn clear_empties_every_bucket() {
        let mut map = TimeoutMap::<u64, u64, _>::new(4, 1000, true, identity_hasher).unwrap();
        for k in 0..20u64 {
            map.insert(&k, k, 0);
        }
        map.clear();
        assert_eq!(map.iter(0).count(), 0);
    }
}
