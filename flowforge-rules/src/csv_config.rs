//! Loads a rule list from the CSV format: a `"<type> <name>"` header row followed by one row
//! per rule. Comment lines (`#`) and empty lines are skipped.

use std::path::Path;

use flowforge_record::{FieldKind, Schema};

use crate::pattern::{parse_cell, FieldPattern};
use crate::RuleError;

fn kind_from_type_str(type_str: &str) -> Result<FieldKind, RuleError> {
    let base = type_str.strip_suffix('*').unwrap_or(type_str);
    Ok(match base {
        "int8" => FieldKind::I8,
        "int16" => FieldKind::I16,
        "int32" => FieldKind::I32,
        "int64" => FieldKind::I64,
        "uint8" => FieldKind::U8,
        "uint16" => FieldKind::U16,
        "uint32" => FieldKind::U32,
        "uint64" => FieldKind::U64,
        "char" => FieldKind::Char,
        "float" => FieldKind::F32,
        "double" => FieldKind::F64,
        // A single family-agnostic `ipaddr` type (spec §3's `ip_addr_t`) always resolves to
        // FieldKind::IpV6 here, matching the sink's own `ipaddr -> IPv6` column mapping
        // (flowforge-chsink/src/config.rs); a v4 literal in such a column is embedded into its
        // IPv4-mapped IPv6 form rather than rejected (see pattern::parse_ip_prefix).
        "ipaddr" => FieldKind::IpV6,
        "macaddr" => FieldKind::Mac,
        "time" => FieldKind::TimeNs,
        "string" => FieldKind::String,
        "bytes" => FieldKind::Bytes,
        other => {
            return Err(RuleError::ConfigInvalid(format!(
                "unrecognized field type `{other}`"
            )))
        }
    })
}

/// A parsed header column: its name, its schema-level [`FieldKind`], and (for a `T*` array
/// column) the declared element kind `T` that cells of this column must parse each item as.
struct HeaderColumn {
    name: String,
    kind: FieldKind,
    elem_kind: Option<FieldKind>,
}

fn parse_header_cell(cell: &str) -> Result<HeaderColumn, RuleError> {
    let (type_str, name) = cell.trim().split_once(' ').ok_or_else(|| {
        RuleError::ConfigInvalid(format!("header column `{cell}` is not `<type> <name>`"))
    })?;
    let is_array = type_str.ends_with('*');
    let (kind, elem_kind) = if is_array {
        (FieldKind::Array, Some(kind_from_type_str(type_str)?))
    } else {
        (kind_from_type_str(type_str)?, None)
    };
    Ok(HeaderColumn {
        name: name.to_string(),
        kind,
        elem_kind,
    })
}

/// Parses a rule-list CSV file into its schema and, for each rule, the parsed pattern of every
/// field in schema order.
pub fn load_rules_csv<P: AsRef<Path>>(
    path: P,
) -> Result<(Schema, Vec<Vec<FieldPattern>>), RuleError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(false)
        .from_path(path.as_ref())
        .map_err(|e| RuleError::ConfigInvalid(e.to_string()))?;

    let header = reader
        .headers()
        .map_err(|e| RuleError::ConfigInvalid(e.to_string()))?
        .clone();

    let columns = header
        .iter()
        .map(parse_header_cell)
        .collect::<Result<Vec<_>, _>>()?;
    let elem_kinds: Vec<Option<FieldKind>> = columns.iter().map(|c| c.elem_kind).collect();
    let fields = columns.into_iter().map(|c| (c.name, c.kind)).collect();
    let schema = Schema::new(fields);

    let mut patterns = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| RuleError::ConfigInvalid(e.to_string()))?;
        if record.len() != schema.len() {
            return Err(RuleError::ConfigInvalid(format!(
                "rule has {} columns, expected {}",
                record.len(),
                schema.len()
            )));
        }
        let mut row = Vec::with_capacity(schema.len());
        for ((cell, (name, kind)), elem_kind) in record.iter().zip(schema.iter()).zip(&elem_kinds) {
            row.push(parse_cell(cell, kind, *elem_kind, name)?);
        }
        patterns.push(row);
    }

    Ok((schema, patterns))
}
