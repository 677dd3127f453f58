//! Compiled rule evaluation: resolves the DSL's field names once against a schema, then routes
//! records to an output index on every call.

use flowforge_record::{FieldId, FieldKind, Schema, TypedRecord};
use xxhash_rust::xxh64::xxh64;

use crate::dsl::ScatterRule;
use crate::ScatterError;

/// Seed used by the original implementation's hash-based output routing.
const SCATTER_HASH_SEED: u64 = 0xdead_d00de;

fn is_numeric_guard_kind(kind: FieldKind) -> bool {
    matches!(
        kind,
        FieldKind::I8
            | FieldKind::I16
            | FieldKind::I32
            | FieldKind::I64
            | FieldKind::U8
            | FieldKind::U16
            | FieldKind::U32
            | FieldKind::U64
            | FieldKind::F32
            | FieldKind::F64
            | FieldKind::TimeNs
    )
}

struct CompiledBranch {
    guard: Option<FieldId>,
    fields: Vec<FieldId>,
}

/// A [`ScatterRule`] with every field name resolved to a [`FieldId`] against a fixed schema.
pub struct CompiledRule {
    branches: Vec<CompiledBranch>,
}

impl CompiledRule {
    /// Resolves every branch's field names against `schema`. Fails if a name is unknown or a
    /// guard names a non-numeric field.
    pub fn compile(rule: &ScatterRule, schema: &Schema) -> Result<CompiledRule, ScatterError> {
        let branches = rule
            .branches
            .iter()
            .map(|branch| {
                let guard = match &branch.guard {
                    Some(name) => {
                        let id = schema.resolve(name)?;
                        let kind = schema.kind_of(id).expect("resolve succeeded");
                        if !is_numeric_guard_kind(kind) {
                            return Err(ScatterError::BadRule(format!(
                                "field `{name}` cannot be used as a branch guard (not numeric)"
                            )));
                        }
                        Some(id)
                    }
                    None => None,
                };
                let fields = branch
                    .fields
                    .iter()
                    .map(|name| schema.resolve(name))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CompiledBranch { guard, fields })
            })
            .collect::<Result<Vec<_>, ScatterError>>()?;
        Ok(CompiledRule { branches })
    }
}

/// Routes records to one of `output_count` outputs: by hashing the fields of the first
/// matching branch, or by round-robin when no branch fires (including when the rule is empty).
pub struct FlowScatter {
    rule: CompiledRule,
    output_count: usize,
    total_records: u64,
    sent_per_output: Vec<u64>,
}

impl FlowScatter {
    /// Creates a scatter instance for `output_count` outputs (must be at least 1).
    pub fn new(rule: CompiledRule, output_count: usize) -> Result<Self, ScatterError> {
        if output_count == 0 {
            return Err(ScatterError::BadRule(
                "output count must be at least 1".to_string(),
            ));
        }
        Ok(FlowScatter {
            rule,
            output_count,
            total_records: 0,
            sent_per_output: vec![0; output_count],
        })
    }

    /// Routes `record`, returning its output index and updating the running counters.
    pub fn route(&mut self, record: &TypedRecord) -> usize {
        self.total_records += 1;
        let index = self.compute_index(record);
        self.sent_per_output[index] += 1;
        index
    }

    fn round_robin_index(&self) -> usize {
        ((self.total_records - 1) as usize) % self.output_count
    }

    fn compute_index(&self, record: &TypedRecord) -> usize {
        for branch in &self.rule.branches {
            let fires = match branch.guard {
                None => true,
                Some(id) => record
                    .get(id)
                    .and_then(|v| v.is_nonzero())
                    .unwrap_or(false),
            };
            if !fires {
                continue;
            }

            let mut hash_input = Vec::new();
            for field_id in &branch.fields {
                if let Some(value) = record.get(*field_id) {
                    value.append_bytes(&mut hash_input);
                }
            }
            if hash_input.is_empty() {
                break;
            }
            let hash = xxh64(&hash_input, SCATTER_HASH_SEED);
            return (hash % self.output_count as u64) as usize;
        }
        self.round_robin_index()
    }

    /// Total records routed so far.
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Per-output record counts, indexed by output.
    pub fn sent_per_output(&self) -> &[u64] {
        &self.sent_per_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_record::TypedValue;

    fn schema() -> Schema {
        Schema::new(vec![
            ("VLAN_ID".to_string(), FieldKind::U16),
            ("SRC_IP".to_string(), FieldKind::IpV4),
            ("DST_IP".to_string(), FieldKind::IpV4),
        ])
    }

    fn record(vlan: u16, src: [u8; 4], dst: [u8; 4]) -> TypedRecord {
        let mut r = TypedRecord::new(3);
        r.set(FieldId(0), TypedValue::U16(vlan));
        r.set(
            FieldId(1),
            TypedValue::IpV4 {
                addr: src.into(),
                prefix: 32,
            },
        );
        r.set(
            FieldId(2),
            TypedValue::IpV4 {
                addr: dst.into(),
                prefix: 32,
            },
        );
        r
    }

    #[test]
    fn empty_rule_round_robins() {
        let rule = crate::dsl::parse_rule("").unwrap();
        let compiled = CompiledRule::compile(&rule, &schema()).unwrap();
        let mut scatter = FlowScatter::new(compiled, 3).unwrap();
        let r = record(0, [1, 2, 3, 4], [5, 6, 7, 8]);
        assert_eq!(scatter.route(&r), 0);
        assert_eq!(scatter.route(&r), 1);
        assert_eq!(scatter.route(&r), 2);
        assert_eq!(scatter.route(&r), 0);
    }

    #[test]
    fn guarded_branch_skipped_when_zero() {
        let rule = crate::dsl::parse_rule("<VLAN_ID>:(VLAN_ID)|<>:(SRC_IP,DST_IP)").unwrap();
        let compiled = CompiledRule::compile(&rule, &schema()).unwrap();
        let mut scatter = FlowScatter::new(compiled, 4).unwrap();

        let no_vlan = record(0, [1, 2, 3, 4], [5, 6, 7, 8]);
        let first = scatter.route(&no_vlan);

        let mut scatter2 = FlowScatter::new(
            CompiledRule::compile(
                &crate::dsl::parse_rule("<>:(SRC_IP,DST_IP)").unwrap(),
                &schema(),
            )
            .unwrap(),
            4,
        )
        .unwrap();
        let second = scatter2.route(&no_vlan);
        assert_eq!(first, second);
    }

    #[test]
    fn hash_routing_is_deterministic() {
        let rule = crate::dsl::parse_rule("<>:(SRC_IP,DST_IP)").unwrap();
        let compiled = CompiledRule::compile(&rule, &schema()).unwrap();
        let mut a = FlowScatter::new(compiled, 8).unwrap();
        let compiled2 = CompiledRule::compile(
            &crate::dsl::parse_rule("<>:(SRC_IP,DST_IP)").unwrap(),
            &schema(),
        )
        .unwrap();
        let mut b = FlowScatter::new(compiled2, 8).unwrap();

        let r = record(0, [10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(a.route(&r), b.route(&r));
    }

    #[test]
    fn rejects_non_numeric_guard() {
        let schema = Schema::new(vec![("HTTP_URL".to_string(), FieldKind::String)]);
        let rule = crate::dsl::parse_rule("<HTTP_URL>:(HTTP_URL)").unwrap();
        assert!(CompiledRule::compile(&rule, &schema).is_err());
    }
}
