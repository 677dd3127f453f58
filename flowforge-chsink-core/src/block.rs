//! A block of buffered columns ready to send to ClickHouse, or being refilled by the producer.

use flowforge_record::TypedRecord;

use crate::column::{extract_cell, ColumnBuffer, ColumnSpec};
use crate::ChSinkError;

/// One batch of rows, one buffer per configured column. Reused for the lifetime of the sink:
/// inserted, cleared, and handed back to the producer rather than reallocated per flush.
#[derive(Clone, Debug)]
pub struct Block {
    specs: Vec<ColumnSpec>,
    columns: Vec<ColumnBuffer>,
}

impl Block {
    /// Allocates an empty block for the given column layout.
    pub fn new(specs: Vec<ColumnSpec>) -> Self {
        let columns = specs.iter().map(|s| ColumnBuffer::new_for(&s.db_type)).collect();
        Block { specs, columns }
    }

    /// The column layout this block was built for.
    pub fn specs(&self) -> &[ColumnSpec] {
        &self.specs
    }

    /// Number of rows currently buffered.
    pub fn row_count(&self) -> usize {
        self.columns.first().map(ColumnBuffer::len).unwrap_or(0)
    }

    /// Appends one row, reading each configured column's field out of `record`.
    ///
    /// Absent fields become `NULL` for scalar columns; an array-shaped column (`macaddr`,
    /// `bytes`, any `T*` column) has no `NULL` representation, so an absent value there is a
    /// configuration error rather than a gap the row can carry.
    pub fn append_record(&mut self, record: &TypedRecord) -> Result<(), ChSinkError> {
        for (spec, column) in self.specs.iter().zip(self.columns.iter_mut()) {
            let value = record.get(spec.field_id);
            match (column, value) {
                (ColumnBuffer::Scalar(rows), Some(v)) => {
                    rows.push(Some(extract_cell(v, &spec.db_type, &spec.name)?));
                }
                (ColumnBuffer::Scalar(rows), None) => rows.push(None),
                (ColumnBuffer::Array(rows), Some(v)) => {
                    match extract_cell(v, &spec.db_type, &spec.name)? {
                        cell @ crate::column::DbValue::Array(_) => rows.push(cell),
                        _ => unreachable!("array column's extractor always returns DbValue::Array"),
                    }
                }
                (ColumnBuffer::Array(_), None) => {
                    return Err(ChSinkError::ConfigInvalid(format!(
                        "column `{}` is array-shaped and has no NULL representation, but field is absent on this record",
                        spec.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Empties every column buffer, keeping the allocation for reuse.
    pub fn clear(&mut self) {
        for column in &mut self.columns {
            column.clear();
        }
    }

    /// Iterates `(spec, buffer)` pairs in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = (&ColumnSpec, &ColumnBuffer)> {
        self.specs.iter().zip(self.columns.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::parse_column_type;
    use flowforge_record::{FieldId, Schema, TypedValue};

    fn specs() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec {
                name: "dst_port".to_string(),
                field_id: FieldId(0),
                db_type: parse_column_type("uint16").unwrap(),
            },
            ColumnSpec {
                name: "src_mac".to_string(),
                field_id: FieldId(1),
                db_type: parse_column_type("macaddr").unwrap(),
            },
        ]
    }

    fn schema() -> Schema {
        Schema::new(vec![
            ("dst_port".to_string(), flowforge_record::FieldKind::U16),
            ("src_mac".to_string(), flowforge_record::FieldKind::Mac),
        ])
    }

    #[test]
    fn appends_and_clears_rows() {
        let mut block = Block::new(specs());
        let schema = schema();
        let mut record = TypedRecord::new(schema.len());
        record.set(FieldId(0), TypedValue::U16(443));
        record.set(FieldId(1), TypedValue::Mac([1, 2, 3, 4, 5, 6]));

        block.append_record(&record).unwrap();
        assert_eq!(block.row_count(), 1);

        block.clear();
        assert_eq!(block.row_count(), 0);
    }

    #[test]
    fn absent_scalar_field_becomes_null() {
        let mut block = Block::new(specs());
        let schema = schema();
        let mut record = TypedRecord::new(schema.len());
        record.set(FieldId(1), TypedValue::Mac([0; 6]));

        block.append_record(&record).unwrap();
        match &block.columns().next().unwrap().1 {
            ColumnBuffer::Scalar(rows) => assert_eq!(rows[0], None),
            ColumnBuffer::Array(_) => panic!("expected scalar buffer"),
        }
    }

    #[test]
    fn absent_array_field_is_an_error() {
        let mut block = Block::new(specs());
        let schema = schema();
        let mut record = TypedRecord::new(schema.len());
        record.set(FieldId(0), TypedValue::U16(1));

        assert!(block.append_record(&record).is_err());
    }
}
