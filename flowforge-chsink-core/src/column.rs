//! Per-column type mapping between [`TypedValue`] and the ClickHouse wire types used by the
//! sink's blocks.

use std::net::Ipv4Addr;

use flowforge_record::{FieldId, TypedValue};

use crate::ChSinkError;

/// A ClickHouse column type, as named in `DESCRIBE TABLE` output and `CREATE TABLE` hints.
///
/// Scalar, non-array variants are always written wrapped in `Nullable(...)`; arrays (including
/// `macaddr` and `bytes`, which are array-shaped even when declared as a single config entry)
/// never are, since ClickHouse does not allow `Nullable(Array(...))`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DbColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    IpV6,
    DateTime64Nanos9,
    Str,
    Array(Box<DbColumnType>),
}

impl DbColumnType {
    /// Whether this column is array-shaped (never `Nullable`-wrapped).
    pub fn is_array(&self) -> bool {
        matches!(self, DbColumnType::Array(_))
    }

    fn bare_name(&self) -> String {
        match self {
            DbColumnType::Int8 => "Int8".to_string(),
            DbColumnType::Int16 => "Int16".to_string(),
            DbColumnType::Int32 => "Int32".to_string(),
            DbColumnType::Int64 => "Int64".to_string(),
            DbColumnType::UInt8 => "UInt8".to_string(),
            DbColumnType::UInt16 => "UInt16".to_string(),
            DbColumnType::UInt32 => "UInt32".to_string(),
            DbColumnType::UInt64 => "UInt64".to_string(),
            DbColumnType::Float32 => "Float32".to_string(),
            DbColumnType::Float64 => "Float64".to_string(),
            DbColumnType::IpV6 => "IPv6".to_string(),
            DbColumnType::DateTime64Nanos9 => "DateTime64(9)".to_string(),
            DbColumnType::Str => "String".to_string(),
            DbColumnType::Array(inner) => format!("Array({})", inner.bare_name()),
        }
    }

    /// The type name as it must appear in `DESCRIBE TABLE` / `CREATE TABLE`.
    pub fn declared_name(&self) -> String {
        if self.is_array() {
            self.bare_name()
        } else {
            format!("Nullable({})", self.bare_name())
        }
    }
}

fn base_type(type_str: &str) -> Result<DbColumnType, ChSinkError> {
    Ok(match type_str {
        "int8" => DbColumnType::Int8,
        "int16" => DbColumnType::Int16,
        "int32" => DbColumnType::Int32,
        "int64" => DbColumnType::Int64,
        "uint8" => DbColumnType::UInt8,
        "uint16" => DbColumnType::UInt16,
        "uint32" => DbColumnType::UInt32,
        "uint64" => DbColumnType::UInt64,
        "char" => DbColumnType::UInt8,
        "float" => DbColumnType::Float32,
        "double" => DbColumnType::Float64,
        "ipaddr" => DbColumnType::IpV6,
        "macaddr" => DbColumnType::Array(Box::new(DbColumnType::UInt8)),
        "time" => DbColumnType::DateTime64Nanos9,
        "string" => DbColumnType::Str,
        "bytes" => DbColumnType::Array(Box::new(DbColumnType::UInt8)),
        other => {
            return Err(ChSinkError::ConfigInvalid(format!(
                "unrecognized column type `{other}`"
            )))
        }
    })
}

/// Parses a config type string (`int8`, `macaddr`, `string*`, ...) into its [`DbColumnType`].
pub fn parse_column_type(type_str: &str) -> Result<DbColumnType, ChSinkError> {
    match type_str.strip_suffix('*') {
        Some(base) => Ok(DbColumnType::Array(Box::new(base_type(base)?))),
        None => base_type(type_str),
    }
}

/// One column of the sink's target table: its name, the record field it is read from, and its
/// declared ClickHouse type.
#[derive(Clone, Debug)]
pub struct ColumnSpec {
    pub name: String,
    pub field_id: FieldId,
    pub db_type: DbColumnType,
}

/// A single converted cell value, shaped for the wire types in [`DbColumnType`].
#[derive(Clone, Debug, PartialEq)]
pub enum DbValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    IpV6(std::net::Ipv6Addr),
    DateTime64Nanos(u64),
    String(String),
    Array(Vec<DbValue>),
}

fn type_mismatch(column: &str) -> ChSinkError {
    ChSinkError::TypeMismatch {
        column: column.to_string(),
    }
}

fn extract_scalar(value: &TypedValue, db_type: &DbColumnType, column: &str) -> Result<DbValue, ChSinkError> {
    Ok(match (db_type, value) {
        (DbColumnType::Int8, TypedValue::I8(v)) => DbValue::Int8(*v),
        (DbColumnType::Int16, TypedValue::I16(v)) => DbValue::Int16(*v),
        (DbColumnType::Int32, TypedValue::I32(v)) => DbValue::Int32(*v),
        (DbColumnType::Int64, TypedValue::I64(v)) => DbValue::Int64(*v),
        (DbColumnType::UInt8, TypedValue::U8(v)) => DbValue::UInt8(*v),
        (DbColumnType::UInt8, TypedValue::Char(c)) => {
            let code = *c as u32;
            if code > u8::MAX as u32 {
                return Err(type_mismatch(column));
            }
            DbValue::UInt8(code as u8)
        }
        (DbColumnType::UInt16, TypedValue::U16(v)) => DbValue::UInt16(*v),
        (DbColumnType::UInt32, TypedValue::U32(v)) => DbValue::UInt32(*v),
        (DbColumnType::UInt64, TypedValue::U64(v)) => DbValue::UInt64(*v),
        (DbColumnType::Float32, TypedValue::F32(v)) => DbValue::Float32(*v),
        (DbColumnType::Float64, TypedValue::F64(v)) => DbValue::Float64(*v),
        (DbColumnType::IpV6, TypedValue::IpV6 { addr, .. }) => DbValue::IpV6(*addr),
        (DbColumnType::IpV6, TypedValue::IpV4 { addr, .. }) => {
            DbValue::IpV6(ipv4_to_mapped_ipv6(*addr))
        }
        (DbColumnType::DateTime64Nanos9, TypedValue::TimeNs(v)) => DbValue::DateTime64Nanos(*v),
        (DbColumnType::Str, TypedValue::String(s)) => DbValue::String(s.clone()),
        _ => return Err(type_mismatch(column)),
    })
}

/// Embeds an IPv4 address into IPv6 per RFC 4291 section 2.5.5.2 (`::ffff:a.b.c.d`).
fn ipv4_to_mapped_ipv6(addr: Ipv4Addr) -> std::net::Ipv6Addr {
    addr.to_ipv6_mapped()
}

/// Converts a single record field's value into the [`DbValue`] shape its declared column type
/// expects, recursing through array nesting (`macaddr`, `bytes`, and any `T*` column).
pub fn extract_cell(value: &TypedValue, db_type: &DbColumnType, column: &str) -> Result<DbValue, ChSinkError> {
    match db_type {
        DbColumnType::Array(inner) => match value {
            TypedValue::Array(items) => {
                let cells = items
                    .iter()
                    .map(|item| extract_cell(item, inner, column))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(DbValue::Array(cells))
            }
            TypedValue::Mac(bytes) if matches!(**inner, DbColumnType::UInt8) => Ok(DbValue::Array(
                bytes.iter().map(|b| DbValue::UInt8(*b)).collect(),
            )),
            TypedValue::Bytes(bytes) if matches!(**inner, DbColumnType::UInt8) => Ok(DbValue::Array(
                bytes.iter().map(|b| DbValue::UInt8(*b)).collect(),
            )),
            _ => Err(type_mismatch(column)),
        },
        scalar => extract_scalar(value, scalar, column),
    }
}

/// A column's accumulated, block-local values: `Nullable` scalars keep per-row presence,
/// array-shaped columns (never nullable) hold one array per row.
#[derive(Clone, Debug)]
pub enum ColumnBuffer {
    Scalar(Vec<Option<DbValue>>),
    Array(Vec<DbValue>),
}

impl ColumnBuffer {
    pub fn new_for(db_type: &DbColumnType) -> Self {
        if db_type.is_array() {
            ColumnBuffer::Array(Vec::new())
        } else {
            ColumnBuffer::Scalar(Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnBuffer::Scalar(v) => v.len(),
            ColumnBuffer::Array(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            ColumnBuffer::Scalar(v) => v.clear(),
            ColumnBuffer::Array(v) => v.clear(),
        }
    }
}
