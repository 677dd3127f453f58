//! The external ClickHouse collaborator this crate drives, and schema validation against it.
//!
//! A concrete [`ClickHouseClient`] backed by a real connection is supplied by the binary that
//! wires this crate up; tests and the rest of this crate only depend on the trait.

use crate::column::ColumnSpec;
use crate::ChSinkError;

/// The subset of a ClickHouse client's surface the sink pipeline needs.
pub trait ClickHouseClient: Send {
    /// Runs `DESCRIBE TABLE <table>`, returning `(name, type)` pairs in column order.
    fn describe_table(&mut self, table: &str) -> Result<Vec<(String, String)>, ChSinkError>;

    /// Inserts a filled block into `table`.
    fn insert(&mut self, table: &str, block: &crate::block::Block) -> Result<(), ChSinkError>;

    /// Drops the current connection and opens a new one to the next endpoint in the
    /// configured list, round-robin.
    fn reset_connection_endpoint(&mut self) -> Result<(), ChSinkError>;

    /// The endpoint (`host:port`) currently in use, for logging.
    fn current_endpoint(&self) -> String;
}

/// Renders a `CREATE TABLE` statement matching `specs`, shown alongside schema mismatch errors.
pub fn create_table_hint(table: &str, specs: &[ColumnSpec]) -> String {
    let mut hint = format!("hint:\nCREATE TABLE {table}(\n");
    for (i, spec) in specs.iter().enumerate() {
        hint.push_str(&format!("    \"{}\" {}", spec.name, spec.db_type.declared_name()));
        if i + 1 < specs.len() {
            hint.push(',');
        }
        hint.push('\n');
    }
    hint.push_str(");");
    hint
}

/// Compares the configured column layout against the table's actual schema, as reported by
/// `DESCRIBE TABLE`. A mismatch (column count, name, or type) is fatal: retrying an insert
/// against the wrong schema would silently corrupt or reject data.
pub fn validate_schema(
    client: &mut dyn ClickHouseClient,
    table: &str,
    specs: &[ColumnSpec],
) -> Result<(), ChSinkError> {
    let db_columns = client.describe_table(table)?;

    if db_columns.len() != specs.len() {
        return Err(ChSinkError::SchemaMismatch(format!(
            "config has {} columns but table \"{table}\" has {}\n{}",
            specs.len(),
            db_columns.len(),
            create_table_hint(table, specs)
        )));
    }

    for (spec, (actual_name, actual_type)) in specs.iter().zip(db_columns.iter()) {
        if &spec.name != actual_name {
            return Err(ChSinkError::SchemaMismatch(format!(
                "expected column \"{}\" in table \"{table}\" but found \"{actual_name}\"\n{}",
                spec.name,
                create_table_hint(table, specs)
            )));
        }
        let expected_type = spec.db_type.declared_name();
        if expected_type != *actual_type {
            return Err(ChSinkError::SchemaMismatch(format!(
                "expected column \"{}\" in table \"{table}\" to be of type \"{expected_type}\" but it is \"{actual_type}\"\n{}",
                spec.name,
                create_table_hint(table, specs)
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::parse_column_type;
    use flowforge_record::FieldId;
    use std::collections::VecDeque;

    struct StubClient {
        responses: VecDeque<Vec<(String, String)>>,
    }

    impl ClickHouseClient for StubClient {
        fn describe_table(&mut self, _table: &str) -> Result<Vec<(String, String)>, ChSinkError> {
            Ok(self.responses.pop_front().unwrap_or_default())
        }
        fn insert(&mut self, _table: &str, _block: &crate::block::Block) -> Result<(), ChSinkError> {
            Ok(())
        }
        fn reset_connection_endpoint(&mut self) -> Result<(), ChSinkError> {
            Ok(())
        }
        fn current_endpoint(&self) -> String {
            "stub:0".to_string()
        }
    }

    fn specs() -> Vec<ColumnSpec> {
        vec![ColumnSpec {
            name: "dst_port".to_string(),
            field_id: FieldId(0),
            db_type: parse_column_type("uint16").unwrap(),
        }]
    }

    #[test]
    fn matching_schema_validates() {
        let mut client = StubClient {
            responses: VecDeque::from([vec![("dst_port".to_string(), "Nullable(UInt16)".to_string())]]),
        };
        assert!(validate_schema(&mut client, "flows", &specs()).is_ok());
    }

    #[test]
    fn column_count_mismatch_is_reported() {
        let mut client = StubClient {
            responses: VecDeque::from([vec![]]),
        };
        let err = validate_schema(&mut client, "flows", &specs()).unwrap_err();
        assert!(matches!(err, ChSinkError::SchemaMismatch(_)));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut client = StubClient {
            responses: VecDeque::from([vec![("dst_port".to_string(), "Nullable(UInt32)".to_string())]]),
        };
        let err = validate_schema(&mut client, "flows", &specs()).unwrap_err();
        assert!(matches!(err, ChSinkError::SchemaMismatch(_)));
    }
}
