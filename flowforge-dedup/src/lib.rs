//! Deduplicator core: classifies each incoming flow record as a fresh insert, a replacement, or
//! a cross-collector duplicate, backed by a timeout-evicting [`FlowKey`] map.
//!
//! The same flow observed by two different collection points (different `link_bitfield`) is a
//! duplicate; the same flow observed twice by the same collector is a distinct event (e.g. one
//! long flow split into several records by the collector's own export interval).

use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHasher;
use flowforge_record::{FieldId, FieldKind, RecordError, Schema, TypedRecord, TypedValue};
use flowforge_timeout::{InsertResult, TimeoutMap, TimeoutMapError};
use flowforge_transport::{ReceiveEvent, Transport};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while constructing a [`Deduplicator`] or extracting a [`FlowKey`] from a record.
#[derive(Debug, Error)]
pub enum DedupError {
    /// The configured capacity exponent is below the `TimeoutMap` minimum of 3.
    #[error(transparent)]
    BadCapacity(#[from] TimeoutMapError),
    /// A configured field name is absent from the current schema.
    #[error(transparent)]
    FieldUnknown(#[from] RecordError),
}

/// Either address family a flow key's IP fields may hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpKey {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

/// The 5-tuple subset of a flow record used as an equivalence key. Equality and hashing ignore
/// every other field, including timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpKey,
    pub dst_ip: IpKey,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
}

fn hash_flow_key(key: &FlowKey) -> u64 {
    let mut hasher = AHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Field ids for the 5-tuple and the link bitfield, resolved once per schema and re-resolved on
/// every format-change event.
#[derive(Clone, Copy, Debug)]
pub struct DedupFieldIds {
    pub src_ip: FieldId,
    pub dst_ip: FieldId,
    pub src_port: FieldId,
    pub dst_port: FieldId,
    pub proto: FieldId,
    pub link_bitfield: FieldId,
}

/// Names of the schema fields the deduplicator reads, configurable since no wire format fixes
/// these column names.
#[derive(Clone, Debug)]
pub struct DedupFieldNames {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: String,
    pub dst_port: String,
    pub proto: String,
    pub link_bitfield: String,
}

impl Default for DedupFieldNames {
    fn default() -> Self {
        DedupFieldNames {
            src_ip: "SRC_IP".to_string(),
            dst_ip: "DST_IP".to_string(),
            src_port: "SRC_PORT".to_string(),
            dst_port: "DST_PORT".to_string(),
            proto: "PROTOCOL".to_string(),
            link_bitfield: "LINK_BITFIELD".to_string(),
        }
    }
}

impl DedupFieldIds {
    /// Resolves every configured field name against `schema`.
    pub fn resolve(schema: &Schema, names: &DedupFieldNames) -> Result<Self, RecordError> {
        Ok(DedupFieldIds {
            src_ip: schema.resolve(&names.src_ip)?,
            dst_ip: schema.resolve(&names.dst_ip)?,
            src_port: schema.resolve(&names.src_port)?,
            dst_port: schema.resolve(&names.dst_port)?,
            proto: schema.resolve(&names.proto)?,
            link_bitfield: schema.resolve(&names.link_bitfield)?,
        })
    }
}

fn ip_key(value: Option<&TypedValue>, field: &str) -> Result<IpKey, RecordError> {
    match value {
        Some(TypedValue::IpV4 { addr, .. }) => Ok(IpKey::V4(*addr)),
        Some(TypedValue::IpV6 { addr, .. }) => Ok(IpKey::V6(*addr)),
        _ => Err(RecordError::TypeMismatch {
            name: field.to_string(),
            declared: FieldKind::IpV4,
            requested: FieldKind::IpV4,
        }),
    }
}

fn u16_field(value: Option<&TypedValue>, field: &str) -> Result<u16, RecordError> {
    match value {
        Some(TypedValue::U16(v)) => Ok(*v),
        _ => Err(RecordError::TypeMismatch {
            name: field.to_string(),
            declared: FieldKind::U16,
            requested: FieldKind::U16,
        }),
    }
}

fn u8_field(value: Option<&TypedValue>, field: &str) -> Result<u8, RecordError> {
    match value {
        Some(TypedValue::U8(v)) => Ok(*v),
        _ => Err(RecordError::TypeMismatch {
            name: field.to_string(),
            declared: FieldKind::U8,
            requested: FieldKind::U8,
        }),
    }
}

fn u64_field(value: Option<&TypedValue>, field: &str) -> Result<u64, RecordError> {
    match value {
        Some(TypedValue::U64(v)) => Ok(*v),
        Some(TypedValue::U32(v)) => Ok(*v as u64),
        _ => Err(RecordError::TypeMismatch {
            name: field.to_string(),
            declared: FieldKind::U64,
            requested: FieldKind::U64,
        }),
    }
}

/// Extracts a [`FlowKey`] and link bitfield from `record` using previously resolved field ids.
pub fn extract_flow_key(
    record: &TypedRecord,
    ids: &DedupFieldIds,
    names: &DedupFieldNames,
) -> Result<(FlowKey, u64), RecordError> {
    let key = FlowKey {
        src_ip: ip_key(record.get(ids.src_ip), &names.src_ip)?,
        dst_ip: ip_key(record.get(ids.dst_ip), &names.dst_ip)?,
        src_port: u16_field(record.get(ids.src_port), &names.src_port)?,
        dst_port: u16_field(record.get(ids.dst_port), &names.dst_port)?,
        proto: u8_field(record.get(ids.proto), &names.proto)?,
    };
    let link_bitfield = u64_field(record.get(ids.link_bitfield), &names.link_bitfield)?;
    Ok((key, link_bitfield))
}

/// Running totals exposed to telemetry, one counter per [`Deduplicator::is_duplicate`] outcome.
#[derive(Default)]
pub struct DedupCounters {
    pub inserted: AtomicU64,
    pub replaced: AtomicU64,
    pub deduplicated: AtomicU64,
}

/// The deduplicator core: a timeout-evicting map from [`FlowKey`] to the link bitfield that last
/// claimed it.
pub struct Deduplicator {
    map: TimeoutMap<FlowKey, u64, fn(&FlowKey) -> u64>,
    pub counters: DedupCounters,
}

impl Deduplicator {
    /// Builds a deduplicator with `2^capacity_exponent` slots and an eviction/duplicate-decision
    /// window of `timeout` (caller-defined time unit, consistently a monotonic counter).
    pub fn new(capacity_exponent: u32, timeout: u64) -> Result<Self, DedupError> {
        let map = TimeoutMap::new(capacity_exponent, timeout, true, hash_flow_key as fn(&FlowKey) -> u64)?;
        Ok(Deduplicator {
            map,
            counters: DedupCounters::default(),
        })
    }

    /// Classifies `(key, link_bitfield)` observed at `now`, returning whether it's a duplicate.
    pub fn is_duplicate(&mut self, key: &FlowKey, link_bitfield: u64, now: u64) -> bool {
        let (slot, result) = self.map.insert(key, link_bitfield, now);
        match result {
            InsertResult::Inserted => {
                self.counters.inserted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("flowforge_dedup_inserted_total").increment(1);
                false
            }
            InsertResult::Replaced => {
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("flowforge_dedup_replaced_total").increment(1);
                false
            }
            InsertResult::AlreadyPresent => {
                let stored = *self.map.value_at(slot);
                if stored != link_bitfield {
                    self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("flowforge_dedup_deduplicated_total").increment(1);
                    true
                } else {
                    self.counters.inserted.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("flowforge_dedup_inserted_total").increment(1);
                    false
                }
            }
        }
    }
}

/// Drives a transport's receive loop against a [`Deduplicator`], forwarding every
/// non-duplicate record to output 0 and dropping duplicates. Re-resolves [`DedupFieldIds`] on
/// every `FormatChange` and exits cleanly on `EndOfStream`.
///
/// `FieldUnknown`/`TypeMismatch` while extracting a flow key aborts only the current record
/// (logged at `warn`); the loop continues with the next one, per this repository's runtime error
/// propagation policy.
pub fn run_loop<T: Transport>(
    transport: &mut T,
    dedup: &mut Deduplicator,
    names: &DedupFieldNames,
    mut clock: impl FnMut() -> u64,
) {
    let mut ids: Option<DedupFieldIds> = None;

    loop {
        match transport.receive() {
            ReceiveEvent::EndOfStream => {
                debug!("transport closed, exiting cleanly");
                return;
            }
            ReceiveEvent::FormatChange(schema) => match DedupFieldIds::resolve(&schema, names) {
                Ok(resolved) => ids = Some(resolved),
                Err(err) => {
                    warn!(error = %err, "format change left required fields unresolved");
                    ids = None;
                }
            },
            ReceiveEvent::Record(record) => {
                let Some(field_ids) = ids else {
                    warn!("dropping record received before any format change resolved field ids");
                    continue;
                };
                match extract_flow_key(&record, &field_ids, names) {
                    Ok((key, link_bitfield)) => {
                        let now = clock();
                        if !dedup.is_duplicate(&key, link_bitfield, now) {
                            if let Err(err) = transport.send(0, record) {
                                warn!(error = %err, "failed to forward record downstream");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "skipping record with unreadable flow-key fields");
                    }
                }
            }
        }
    }
}
