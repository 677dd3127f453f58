//! Column-block buffering and worker-pool insertion for the ClickHouse sink.
//!
//! A single producer ([`Producer`]) converts incoming [`TypedRecord`](flowforge_record::TypedRecord)s
//! into column-oriented [`Block`]s drawn from a shared [`BlockPool`], flushing on a row-count or
//! time threshold. A pool of [`Inserter`] workers drains filled blocks and inserts them through a
//! [`ClickHouseClient`], reconnecting and rotating endpoints on failure.

mod block;
mod client;
mod column;
mod inserter;
mod pool;
mod producer;

pub use block::Block;
pub use client::{create_table_hint, validate_schema, ClickHouseClient};
pub use column::{parse_column_type, ColumnBuffer, ColumnSpec, DbColumnType, DbValue};
pub use inserter::Inserter;
pub use pool::{BlockPool, FilledItem};
pub use producer::Producer;

use thiserror::Error;

/// Errors raised while buffering, converting, or inserting flow records into ClickHouse.
#[derive(Debug, Error)]
pub enum ChSinkError {
    /// Malformed YAML sink configuration, or an unrecognized column type token.
    #[error("invalid sink configuration: {0}")]
    ConfigInvalid(String),
    /// The table's actual schema, per `DESCRIBE TABLE`, doesn't match the configured columns.
    #[error("clickhouse schema mismatch: {0}")]
    SchemaMismatch(String),
    /// A record field's typed value didn't convert to the column's declared DB type.
    #[error("column `{column}` received a value of the wrong type")]
    TypeMismatch {
        /// Name of the offending column.
        column: String,
    },
    /// `blocks` (the pool size) was configured as zero.
    #[error("block pool capacity must be at least 1, got {0}")]
    BadCapacity(usize),
    /// A transient failure while talking to ClickHouse; retried by the inserter worker and
    /// never surfaced past it except as a log line, per the sink's retry policy.
    #[error("insert failed: {0}")]
    InsertFailed(String),
}
