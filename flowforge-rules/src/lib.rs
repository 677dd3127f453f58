//! Rule-set construction and evaluation for field-pattern-based record matching.
//!
//! A rule file declares a schema (one `"<type> <name>"` column per field) and a set of rows,
//! each row giving a pattern per field: empty for wildcard, `R"(...)"` for a regex on a string
//! field, an `addr[/len]` form for an IP field, or a literal value otherwise. [`RulesEngine`]
//! compiles these rows into per-field matchers and evaluates records against all of them at
//! once, returning the bitset of rules that matched.

mod bitset;
mod csv_config;
mod engine;
mod pattern;

pub use bitset::RuleMatchSet;
pub use csv_config::load_rules_csv;
pub use engine::RulesEngine;
pub use flowforge_record::{FieldKind, RecordError, Schema};
pub use pattern::FieldPattern;

use thiserror::Error;

/// Errors raised while parsing a rule file or building an engine from it.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rule file itself is malformed (bad header, wrong column count, I/O failure).
    #[error("invalid rule configuration: {0}")]
    ConfigInvalid(String),
    /// A single rule cell could not be parsed into a pattern.
    #[error("invalid rule: {0}")]
    BadRule(String),
    /// A field name referenced outside the declared schema.
    #[error(transparent)]
    FieldUnknown(#[from] RecordError),
}

/// Whether the list detector passes a record when rules match or when none do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListMode {
    /// A record passes iff at least one rule matched.
    Whitelist,
    /// A record passes iff no rule matched.
    Blacklist,
}

impl ListMode {
    /// Applies this mode's pass/fail decision to a match result.
    pub fn passes(&self, matched: &RuleMatchSet) -> bool {
        match self {
            ListMode::Whitelist => matched.any(),
            ListMode::Blacklist => !matched.any(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_passes_iff_some_rule_matched() {
        let mut set = RuleMatchSet::empty(4);
        assert!(!ListMode::Whitelist.passes(&set));
        set.set(2);
        assert!(ListMode::Whitelist.passes(&set));
    }

    #[test]
    fn blacklist_passes_iff_no_rule_matched() {
        let mut set = RuleMatchSet::empty(4);
        assert!(ListMode::Blacklist.passes(&set));
        set.set(0);
        assert!(!ListMode::Blacklist.passes(&set));
    }
}
