//! Schema-indexed typed view over flow records.
//!
//! A [`Schema`] names and types the columns of a record stream. A
//! [`TypedRecord`] is a single row validated against a schema; [`FieldId`]s
//! are stable only until the schema's next format change, at which point
//! callers must [`Schema::resolve`] names again.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use enum_kinds::EnumKind;
use smallvec::SmallVec;
use thiserror::Error;

/// Errors raised while resolving or reading/writing typed fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// A field name is not present in the current schema.
    #[error("field `{0}` is not present in the current schema")]
    FieldUnknown(String),
    /// A field was read or written with a type that doesn't match its schema declaration.
    #[error("field `{name}` is declared as {declared:?} but was accessed as {requested:?}")]
    TypeMismatch {
        /// Name of the offending field.
        name: String,
        /// The kind the schema declares for this field.
        declared: FieldKind,
        /// The kind the caller requested.
        requested: FieldKind,
    },
}

/// A tagged union over every value a flow record field can hold.
///
/// `time_ns` is nanoseconds since the Unix epoch, represented as [`TimeNs`](TypedValue::TimeNs).
#[derive(Clone, Debug, PartialEq, EnumKind)]
#[enum_kind(FieldKind)]
pub enum TypedValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Char(char),
    F32(f32),
    F64(f64),
    /// IPv4 address with an associated prefix length (/32 for a host address).
    IpV4 { addr: Ipv4Addr, prefix: u8 },
    /// IPv6 address with an associated prefix length (/128 for a host address).
    IpV6 { addr: Ipv6Addr, prefix: u8 },
    Mac([u8; 6]),
    /// Nanoseconds since the Unix epoch.
    TimeNs(u64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<TypedValue>),
}

impl TypedValue {
    /// The [`FieldKind`] this value belongs to.
    pub fn kind(&self) -> FieldKind {
        self.into()
    }

    /// Interprets this value as a plain, unsigned "is this field nonzero" test, as used by
    /// the scatter DSL's branch guards. Returns `None` for non-numeric kinds.
    pub fn is_nonzero(&self) -> Option<bool> {
        Some(match self {
            TypedValue::I8(v) => *v != 0,
            TypedValue::I16(v) => *v != 0,
            TypedValue::I32(v) => *v != 0,
            TypedValue::I64(v) => *v != 0,
            TypedValue::U8(v) => *v != 0,
            TypedValue::U16(v) => *v != 0,
            TypedValue::U32(v) => *v != 0,
            TypedValue::U64(v) => *v != 0,
            TypedValue::F32(v) => *v != 0.0,
            TypedValue::F64(v) => *v != 0.0,
            TypedValue::TimeNs(v) => *v != 0,
            _ => return None,
        })
    }

    /// Appends the little-endian binary representation of this value to `out`, as used by the
    /// scatter DSL's hash input construction. Strings/bytes are appended as-is; arrays are
    /// appended element-by-element.
    pub fn append_bytes(&self, out: &mut Vec<u8>) {
        match self {
            TypedValue::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::U8(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::U16(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::Char(c) => out.extend_from_slice(&(*c as u32).to_le_bytes()),
            TypedValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::IpV4 { addr, .. } => out.extend_from_slice(&addr.octets()),
            TypedValue::IpV6 { addr, .. } => out.extend_from_slice(&addr.octets()),
            TypedValue::Mac(m) => out.extend_from_slice(m),
            TypedValue::TimeNs(v) => out.extend_from_slice(&v.to_le_bytes()),
            TypedValue::String(s) => out.extend_from_slice(s.as_bytes()),
            TypedValue::Bytes(b) => out.extend_from_slice(b),
            TypedValue::Array(items) => {
                for item in items {
                    item.append_bytes(out);
                }
            }
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A stable index into a [`Schema`]'s field list. Valid until the schema's next format change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub usize);

/// Ordered list of `(name, kind)` pairs describing a record stream's columns.
///
/// Every record received on a channel is validated against the channel's current schema. A
/// schema change invalidates previously [`resolve`](Schema::resolve)d [`FieldId`]s.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    fields: Vec<(String, FieldKind)>,
}

impl Schema {
    /// Builds a schema from an ordered list of `(name, kind)` pairs.
    pub fn new(fields: Vec<(String, FieldKind)>) -> Self {
        Schema { fields }
    }

    /// Number of columns in this schema.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether this schema has no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Maps a field name to its current [`FieldId`].
    pub fn resolve(&self, name: &str) -> Result<FieldId, RecordError> {
        self.fields
            .iter()
            .position(|(n, _)| n == name)
            .map(FieldId)
            .ok_or_else(|| RecordError::FieldUnknown(name.to_string()))
    }

    /// Returns the declared kind of a field, if present.
    pub fn kind_of(&self, id: FieldId) -> Option<FieldKind> {
        self.fields.get(id.0).map(|(_, k)| *k)
    }

    /// Returns the declared name of a field, if present.
    pub fn name_of(&self, id: FieldId) -> Option<&str> {
        self.fields.get(id.0).map(|(n, _)| n.as_str())
    }

    /// Iterates over `(name, kind)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(n, k)| (n.as_str(), *k))
    }
}

/// A single record validated against a [`Schema`].
///
/// Fields are stored densely by [`FieldId`]; a field absent from a particular record (but
/// present in the schema) reads back as `None`.
#[derive(Clone, Debug, Default)]
pub struct TypedRecord {
    fields: SmallVec<[Option<TypedValue>; 16]>,
}

impl TypedRecord {
    /// Creates an empty record with `len` absent fields, matching a schema of that length.
    pub fn new(len: usize) -> Self {
        TypedRecord {
            fields: smallvec::smallvec![None; len],
        }
    }

    /// Reads the typed value at `id`, or `None` if the field is absent on this record.
    pub fn get(&self, id: FieldId) -> Option<&TypedValue> {
        self.fields.get(id.0).and_then(|v| v.as_ref())
    }

    /// Reads the typed value at `id`, enforcing that it matches `expected` or no value is
    /// declared for this field at all (absent fields never trigger `TypeMismatch`).
    pub fn get_typed<'a>(
        &'a self,
        schema: &Schema,
        id: FieldId,
        expected: FieldKind,
    ) -> Result<Option<&'a TypedValue>, RecordError> {
        if let Some(declared) = schema.kind_of(id) {
            if declared != expected {
                return Err(RecordError::TypeMismatch {
                    name: schema.name_of(id).unwrap_or("<unknown>").to_string(),
                    declared,
                    requested: expected,
                });
            }
        }
        Ok(self.get(id))
    }

    /// Writes a typed value at `id`, growing the record if necessary.
    pub fn set(&mut self, id: FieldId, value: TypedValue) {
        if id.0 >= self.fields.len() {
            self.fields.resize(id.0 + 1, None);
        }
        self.fields[id.0] = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            ("SRC_PORT".to_string(), FieldKind::U16),
            ("DST_PORT".to_string(), FieldKind::U16),
            ("HTTP_URL".to_string(), FieldKind::String),
        ])
    }

    #[test]
    fn resolve_roundtrips_declared_names() {
        let schema = schema();
        let id = schema.resolve("DST_PORT").unwrap();
        assert_eq!(schema.name_of(id), Some("DST_PORT"));
        assert_eq!(schema.kind_of(id), Some(FieldKind::U16));
    }

    #[test]
    fn resolve_unknown_field_errors() {
        let schema = schema();
        assert_eq!(
            schema.resolve("NOPE"),
            Err(RecordError::FieldUnknown("NOPE".to_string()))
        );
    }

    #[test]
    fn get_set_roundtrip() {
        let schema = schema();
        let mut record = TypedRecord::new(schema.len());
        let id = schema.resolve("DST_PORT").unwrap();
        record.set(id, TypedValue::U16(443));
        assert_eq!(record.get(id), Some(&TypedValue::U16(443)));
    }

    #[test]
    fn absent_field_reads_as_none() {
        let schema = schema();
        let record = TypedRecord::new(schema.len());
        let id = schema.resolve("HTTP_URL").unwrap();
        assert_eq!(record.get(id), None);
    }

    #[test]
    fn type_mismatch_on_wrong_declared_kind() {
        let schema = schema();
        let record = TypedRecord::new(schema.len());
        let id = schema.resolve("DST_PORT").unwrap();
        let err = record.get_typed(&schema, id, FieldKind::String).unwrap_err();
        assert!(matches!(err, RecordError::TypeMismatch { .. }));
    }

    #[test]
    fn append_bytes_is_deterministic_for_scalars() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        TypedValue::U32(12345).append_bytes(&mut a);
        TypedValue::U32(12345).append_bytes(&mut b);
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
    }
}
