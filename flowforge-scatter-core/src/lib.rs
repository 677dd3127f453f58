//! Parses the flow-scatter rule DSL and routes records to one of N outputs by hashing the
//! fields named by the first matching branch, falling back to round-robin.

mod dsl;
mod engine;

pub use dsl::{parse_rule, Branch, ScatterRule};
pub use engine::{CompiledRule, FlowScatter};

use thiserror::Error;

/// Errors raised while parsing or compiling a scatter rule.
#[derive(Debug, Error)]
pub enum ScatterError {
    /// The rule string is malformed, or a branch references an unsuitable field.
    #[error("invalid scatter rule: {0}")]
    BadRule(String),
    /// A branch names a field absent from the record schema.
    #[error(transparent)]
    FieldUnknown(#[from] flowforge_record::RecordError),
}
