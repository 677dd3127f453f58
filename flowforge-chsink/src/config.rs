//! YAML sink configuration: connection endpoints, target table, column layout, and the
//! producer/inserter tuning knobs.

use std::path::Path;

use flowforge_chsink_core::{parse_column_type, ChSinkError, ColumnSpec};
use flowforge_record::{FieldKind, Schema};
use serde::Deserialize;

use crate::SinkDriverError;

#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub username: String,
    pub password: String,
    pub database: String,
    pub table: String,
}

/// Top-level sink configuration, loaded from the path passed via `--config`.
#[derive(Debug, Deserialize)]
pub struct SinkConfig {
    pub connection: ConnectionConfig,
    /// Each entry is `"<type> <name>"`, in the order columns are inserted.
    pub columns: Vec<String>,
    pub blocks: usize,
    #[serde(rename = "inserterThreads")]
    pub inserter_threads: usize,
    #[serde(rename = "blockInsertThreshold")]
    pub block_insert_threshold: usize,
    #[serde(rename = "blockInsertMaxDelaySecs")]
    pub block_insert_max_delay_secs: u64,
}

fn kind_from_type_str(type_str: &str) -> Option<FieldKind> {
    Some(match type_str.strip_suffix('*').unwrap_or(type_str) {
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
        // Matches the list-detector CSV loader's treatment of the same type token
        // (flowforge-rules/src/csv_config.rs): `ipaddr` is one family-agnostic type that always
        // resolves to FieldKind::IpV6 at the schema level, with v4 values embedded per RFC 4291.
        "ipaddr" => FieldKind::IpV6,
        "macaddr" => FieldKind::Mac,
        "time" => FieldKind::TimeNs,
        "string" => FieldKind::String,
        "bytes" => FieldKind::Bytes,
        _ => return None,
    })
}

fn split_column(column: &str) -> Result<(&str, &str), SinkDriverError> {
    column.split_once(' ').ok_or_else(|| {
        SinkDriverError::Core(ChSinkError::ConfigInvalid(format!(
            "column `{column}` is not `<type> <name>`"
        )))
    })
}

impl SinkConfig {
    /// Loads and validates a sink configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SinkDriverError> {
        let text = std::fs::read_to_string(path)?;
        let config: SinkConfig = serde_yaml_ng::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), SinkDriverError> {
        if self.connection.endpoints.is_empty() {
            return Err(SinkDriverError::Core(ChSinkError::ConfigInvalid(
                "connection.endpoints must not be empty".to_string(),
            )));
        }
        if self.columns.is_empty() {
            return Err(SinkDriverError::Core(ChSinkError::ConfigInvalid(
                "columns must not be empty".to_string(),
            )));
        }
        if self.inserter_threads == 0 {
            return Err(SinkDriverError::Core(ChSinkError::ConfigInvalid(
                "inserterThreads must be at least 1".to_string(),
            )));
        }
        for column in &self.columns {
            let (type_str, _name) = split_column(column)?;
            parse_column_type(type_str)?;
            if kind_from_type_str(type_str).is_none() {
                return Err(SinkDriverError::Core(ChSinkError::ConfigInvalid(format!(
                    "column `{column}` has no equivalent record field kind"
                ))));
            }
        }
        Ok(())
    }

    /// Builds the schema this sink's synthetic input stream declares: one field per configured
    /// column, in declaration order. A real deployment's transport would supply its own schema
    /// over the wire; this one exists to give the columns field ids to resolve against.
    pub fn input_schema(&self) -> Schema {
        let fields = self
            .columns
            .iter()
            .map(|column| {
                let (type_str, name) = split_column(column).expect("validated at load time");
                (name.to_string(), kind_from_type_str(type_str).expect("validated at load time"))
            })
            .collect();
        Schema::new(fields)
    }

    /// Resolves every configured column against `schema` into a [`ColumnSpec`].
    pub fn column_specs(&self, schema: &Schema) -> Result<Vec<ColumnSpec>, SinkDriverError> {
        self.columns
            .iter()
            .map(|column| {
                let (type_str, name) = split_column(column)?;
                let field_id = schema.resolve(name).map_err(|e| {
                    SinkDriverError::Core(ChSinkError::ConfigInvalid(e.to_string()))
                })?;
                let db_type = parse_column_type(type_str)?;
                Ok(ColumnSpec {
                    name: name.to_string(),
                    field_id,
                    db_type,
                })
            })
            .collect()
    }
}
