//! Construction and evaluation of the per-field rule match engine.

use ahash::RandomState;
use flowforge_record::{FieldId, FieldKind, Schema, TypedRecord, TypedValue};
use flowforge_trie::{ipv4_key, ipv6_key, PrefixTrieV4, PrefixTrieV6};
use indexmap::IndexMap;
use regex::Regex;
use smallvec::SmallVec;

use crate::bitset::RuleMatchSet;
use crate::pattern::FieldPattern;

fn byte_key(value: &TypedValue) -> Vec<u8> {
    let mut out = Vec::new();
    value.append_bytes(&mut out);
    out
}

fn string_key(value: &TypedValue) -> Option<&str> {
    match value {
        TypedValue::String(s) => Some(s.as_str()),
        _ => None,
    }
}

struct NumericFieldMatcher {
    field_id: FieldId,
    wildcard: RuleMatchSet,
    table: Vec<(Vec<u8>, SmallVec<[u32; 4]>)>,
}

impl NumericFieldMatcher {
    fn lookup(&self, record: &TypedRecord) -> RuleMatchSet {
        let mut local = self.wildcard.clone();
        if let Some(value) = record.get(self.field_id) {
            let key = byte_key(value);
            if let Ok(idx) = self.table.binary_search_by(|(k, _)| k.as_slice().cmp(&key)) {
                for &rule_id in &self.table[idx].1 {
                    local.set(rule_id as usize);
                }
            }
        }
        local
    }
}

/// `wildcard` doubles as "tentatively passes" for rules whose pattern on this field is a regex:
/// the authoritative check happens in the engine's regex pass, once `matched` has already been
/// narrowed by every other field.
struct StringFieldMatcher {
    field_id: FieldId,
    wildcard: RuleMatchSet,
    table: IndexMap<String, SmallVec<[u32; 4]>, RandomState>,
}

impl StringFieldMatcher {
    fn lookup(&self, record: &TypedRecord) -> RuleMatchSet {
        let mut local = self.wildcard.clone();
        if let Some(value) = record.get(self.field_id) {
            if let Some(s) = string_key(value) {
                if let Some(rule_ids) = self.table.get(s) {
                    for &rule_id in rule_ids {
                        local.set(rule_id as usize);
                    }
                }
            }
        }
        local
    }
}

enum IpFieldMatcher {
    V4 {
        field_id: FieldId,
        wildcard: RuleMatchSet,
        trie: PrefixTrieV4,
    },
    V6 {
        field_id: FieldId,
        wildcard: RuleMatchSet,
        trie: PrefixTrieV6,
    },
}

impl IpFieldMatcher {
    fn lookup(&self, record: &TypedRecord) -> RuleMatchSet {
        match self {
            IpFieldMatcher::V4 {
                field_id,
                wildcard,
                trie,
            } => {
                let mut local = wildcard.clone();
                if let Some(TypedValue::IpV4 { addr, .. }) = record.get(*field_id) {
                    for rule_id in trie.search(ipv4_key(*addr)) {
                        local.set(rule_id as usize);
                    }
                }
                local
            }
            IpFieldMatcher::V6 {
                field_id,
                wildcard,
                trie,
            } => {
                let mut local = wildcard.clone();
                // A field declared `ipaddr` (FieldKind::IpV6) carries either address family at
                // the record level; a plain IPv4 value is looked up via its IPv4-mapped IPv6
                // form so it still matches prefixes the CSV loader embedded the same way.
                let key = match record.get(*field_id) {
                    Some(TypedValue::IpV6 { addr, .. }) => Some(ipv6_key(*addr)),
                    Some(TypedValue::IpV4 { addr, .. }) => Some(ipv6_key(addr.to_ipv6_mapped())),
                    _ => None,
                };
                if let Some(key) = key {
                    for rule_id in trie.search(key) {
                        local.set(rule_id as usize);
                    }
                }
                local
            }
        }
    }
}

struct RegexFieldMatcher {
    field_id: FieldId,
    entries: Vec<(u32, Regex)>,
}

/// A built rule-set ready to evaluate records against. Immutable once constructed; reload
/// builds a fresh engine and swaps it in rather than mutating this one in place.
pub struct RulesEngine {
    rule_count: usize,
    numeric: Vec<NumericFieldMatcher>,
    strings: Vec<StringFieldMatcher>,
    ip: Vec<IpFieldMatcher>,
    regex: Vec<RegexFieldMatcher>,
}

impl RulesEngine {
    /// Number of rules held by this engine.
    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    /// Computes the bitset of rule ids whose field patterns all match `record`.
    pub fn matches(&self, record: &TypedRecord) -> RuleMatchSet {
        let mut matched = RuleMatchSet::all_ones(self.rule_count);

        for matcher in &self.numeric {
            matched.intersect_with(&matcher.lookup(record));
            if !matched.any() {
                return matched;
            }
        }
        for matcher in &self.strings {
            matched.intersect_with(&matcher.lookup(record));
            if !matched.any() {
                return matched;
            }
        }
        for matcher in &self.ip {
            matched.intersect_with(&matcher.lookup(record));
            if !matched.any() {
                return matched;
            }
        }
        for matcher in &self.regex {
            if let Some(value) = record.get(matcher.field_id) {
                if let Some(text) = string_key(value) {
                    for (rule_id, regex) in &matcher.entries {
                        let rule_id = *rule_id as usize;
                        if matched.get(rule_id) && !regex.is_match(text) {
                            matched.clear_bit(rule_id);
                        }
                    }
                }
            } else {
                for (rule_id, _) in &matcher.entries {
                    matched.clear_bit(*rule_id as usize);
                }
            }
        }

        matched
    }

    /// Builds an engine from a schema and, for every rule, the parsed pattern of each of its
    /// fields (`patterns[rule_index][field_index]`).
    pub fn build(schema: &Schema, patterns: &[Vec<FieldPattern>]) -> RulesEngine {
        let rule_count = patterns.len();

        let mut numeric: Vec<NumericFieldMatcher> = Vec::new();
        let mut strings: Vec<StringFieldMatcher> = Vec::new();
        let mut ip: Vec<IpFieldMatcher> = Vec::new();
        let mut regex: Vec<RegexFieldMatcher> = Vec::new();

        for (field_index, (_, kind)) in schema.iter().enumerate() {
            let field_id = FieldId(field_index);

            match kind {
                FieldKind::String => {
                    let mut wildcard = RuleMatchSet::empty(rule_count);
                    let mut table: IndexMap<String, SmallVec<[u32; 4]>, RandomState> =
                        IndexMap::default();
                    let mut regex_entries = Vec::new();

                    for (rule_id, rule) in patterns.iter().enumerate() {
                        match &rule[field_index] {
                            FieldPattern::Wildcard => wildcard.set(rule_id),
                            FieldPattern::Exact(TypedValue::String(s)) => {
                                table.entry(s.clone()).or_default().push(rule_id as u32);
                            }
                            FieldPattern::Regex(r) => {
                                wildcard.set(rule_id);
                                regex_entries.push((rule_id as u32, r.clone()));
                            }
                            _ => unreachable!("string field produced a non-string pattern"),
                        }
                    }

                    strings.push(StringFieldMatcher {
                        field_id,
                        wildcard,
                        table,
                    });
                    if !regex_entries.is_empty() {
                        regex.push(RegexFieldMatcher {
                            field_id,
                            entries: regex_entries,
                        });
                    }
                }
                FieldKind::IpV4 => {
                    let mut wildcard = RuleMatchSet::empty(rule_count);
                    let mut trie = PrefixTrieV4::new();
                    for (rule_id, rule) in patterns.iter().enumerate() {
                        match &rule[field_index] {
                            FieldPattern::Wildcard => wildcard.set(rule_id),
                            FieldPattern::IpPrefix {
                                addr: TypedValue::IpV4 { addr, prefix },
                            } => {
                                trie.insert(ipv4_key(*addr), *prefix, rule_id as u32);
                            }
                            _ => unreachable!("ipv4 field produced a non-ipv4 pattern"),
                        }
                    }
                    ip.push(IpFieldMatcher::V4 {
                        field_id,
                        wildcard,
                        trie,
                    });
                }
                FieldKind::IpV6 => {
                    let mut wildcard = RuleMatchSet::empty(rule_count);
                    let mut trie = PrefixTrieV6::new();
                    for (rule_id, rule) in patterns.iter().enumerate() {
                        match &rule[field_index] {
                            FieldPattern::Wildcard => wildcard.set(rule_id),
                            FieldPattern::IpPrefix {
                                addr: TypedValue::IpV6 { addr, prefix },
                            } => {
                                trie.insert(ipv6_key(*addr), *prefix, rule_id as u32);
                            }
                            _ => unreachable!("ipv6 field produced a non-ipv6 pattern"),
                        }
                    }
                    ip.push(IpFieldMatcher::V6 {
                        field_id,
                        wildcard,
                        trie,
                    });
                }
                _ => {
                    let mut wildcard = RuleMatchSet::empty(rule_count);
                    let mut raw_table: Vec<(Vec<u8>, SmallVec<[u32; 4]>)> = Vec::new();
                    for (rule_id, rule) in patterns.iter().enumerate() {
                        match &rule[field_index] {
                            FieldPattern::Wildcard => wildcard.set(rule_id),
                            FieldPattern::Exact(value) => {
                                let key = byte_key(value);
                                match raw_table.iter_mut().find(|(k, _)| *k == key) {
                                    Some((_, ids)) => ids.push(rule_id as u32),
                                    None => raw_table.push((key, smallvec::smallvec![rule_id as u32])),
                                }
                            }
                            _ => unreachable!("scalar field produced a non-scalar pattern"),
                        }
                    }
                    raw_table.sort_unstable_by(|a, b| a.0.cmp(&b.0));
                    numeric.push(NumericFieldMatcher {
                        field_id,
                        wildcard,
                        table: raw_table,
                    });
                }
            }
        }

        RulesEngine {
            rule_count,
            numeric,
            strings,
            ip,
            regex,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            ("DST_PORT".to_string(), FieldKind::U16),
            ("HTTP_URL".to_string(), FieldKind::String),
            ("SRC_IP".to_string(), FieldKind::IpV4),
        ])
    }

    fn record(port: u16, url: &str, ip: std::net::Ipv4Addr) -> TypedRecord {
        let mut r = TypedRecord::new(3);
        r.set(FieldId(0), TypedValue::U16(port));
        r.set(FieldId(1), TypedValue::String(url.to_string()));
        r.set(FieldId(2), TypedValue::IpV4 { addr: ip, prefix: 32 });
        r
    }

    #[test]
    fn exact_match_across_all_fields() {
        let schema = schema();
        let patterns = vec![vec![
            FieldPattern::Exact(TypedValue::U16(443)),
            FieldPattern::Exact(TypedValue::String("/login".to_string())),
            FieldPattern::IpPrefix {
                addr: TypedValue::IpV4 {
                    addr: "10.0.0.0".parse().unwrap(),
                    prefix: 8,
                },
            },
        ]];
        let engine = RulesEngine::build(&schema, &patterns);

        let hit = record(443, "/login", "10.1.2.3".parse().unwrap());
        assert!(engine.matches(&hit).any());

        let miss = record(80, "/login", "10.1.2.3".parse().unwrap());
        assert!(!engine.matches(&miss).any());
    }

    #[test]
    fn wildcard_field_never_excludes() {
        let schema = schema();
        let patterns = vec![vec![
            FieldPattern::Wildcard,
            FieldPattern::Wildcard,
            FieldPattern::Wildcard,
        ]];
        let engine = RulesEngine::build(&schema, &patterns);
        let record = record(1, "anything", "1.2.3.4".parse().unwrap());
        assert!(engine.matches(&record).any());
    }

    #[test]
    fn ipaddr_field_matches_both_address_families_without_panicking() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"ipaddr SRC_IP\n10.0.0.0/8\n2001:db8::/32\n").unwrap();
        let (schema, patterns) = crate::csv_config::load_rules_csv(file.path()).unwrap();
        assert_eq!(schema.kind_of(FieldId(0)), Some(FieldKind::IpV6));

        let engine = RulesEngine::build(&schema, &patterns);

        let mut v4_record = TypedRecord::new(1);
        v4_record.set(
            FieldId(0),
            TypedValue::IpV4 { addr: "10.1.2.3".parse().unwrap(), prefix: 32 },
        );
        let matched = engine.matches(&v4_record);
        assert!(matched.get(0));
        assert!(!matched.get(1));

        let mut v6_record = TypedRecord::new(1);
        v6_record.set(
            FieldId(0),
            TypedValue::IpV6 { addr: "2001:db8::1".parse().unwrap(), prefix: 128 },
        );
        let matched = engine.matches(&v6_record);
        assert!(!matched.get(0));
        assert!(matched.get(1));
    }

    #[test]
    fn regex_pattern_is_authoritative() {
        let schema = schema();
        let patterns = vec![vec![
            FieldPattern::Wildcard,
            FieldPattern::Regex(Regex::new("^/admin").unwrap()),
            FieldPattern::Wildcard,
        ]];
        let engine = RulesEngine::build(&schema, &patterns);

        let hit = record(1, "/admin/panel", "1.2.3.4".parse().unwrap());
        assert!(engine.matches(&hit).any());

        let miss = record(1, "/login", "1.2.3.4".parse().unwrap());
        assert!(!engine.matches(&miss).any());
    }
}
