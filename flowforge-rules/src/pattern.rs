//! Parses a single rule-file cell into a typed field pattern.

use std::net::{Ipv4Addr, Ipv6Addr};

use flowforge_record::{FieldKind, TypedValue};
use regex::Regex;

use crate::RuleError;

/// What a single `(rule, field)` cell requires of a matching record.
#[derive(Debug, Clone)]
pub enum FieldPattern {
    /// An empty cell: this field imposes no constraint.
    Wildcard,
    /// An exact scalar/array value, compared byte-for-byte.
    Exact(TypedValue),
    /// A string field wrapped in the `R"(...)"` regex quoting convention.
    Regex(Regex),
    /// An IP prefix; matches any address contained in it.
    IpPrefix { addr: TypedValue },
}

/// Parses the raw CSV cell `raw` for a field declared with kind `kind`. `elem_kind` is the
/// declared element type for an array field (the `T` of a `T*` header column) and is ignored
/// unless `kind` is [`FieldKind::Array`].
pub fn parse_cell(
    raw: &str,
    kind: FieldKind,
    elem_kind: Option<FieldKind>,
    field_name: &str,
) -> Result<FieldPattern, RuleError> {
    if raw.is_empty() {
        return Ok(FieldPattern::Wildcard);
    }

    match kind {
        FieldKind::String => Ok(parse_string_cell(raw, field_name)?),
        FieldKind::IpV4 | FieldKind::IpV6 => Ok(FieldPattern::IpPrefix {
            addr: parse_ip_prefix(raw, kind, field_name)?,
        }),
        FieldKind::Array => {
            let elem_kind = elem_kind.ok_or_else(|| {
                RuleError::ConfigInvalid(format!(
                    "field `{field_name}`: array field has no declared element type"
                ))
            })?;
            let items = raw
                .split(';')
                .map(|item| parse_array_element(item, elem_kind, field_name))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FieldPattern::Exact(TypedValue::Array(items)))
        }
        _ => Ok(FieldPattern::Exact(parse_scalar(raw, kind, field_name)?)),
    }
}

/// Parses one `;`-separated array element as its declared element kind. Elements are compared
/// exactly (an array field has no per-element regex or prefix-match convention), so a string
/// element is taken verbatim and an IP element is parsed as a full-length host address.
fn parse_array_element(raw: &str, kind: FieldKind, field_name: &str) -> Result<TypedValue, RuleError> {
    match kind {
        FieldKind::String => Ok(TypedValue::String(raw.to_string())),
        FieldKind::IpV4 | FieldKind::IpV6 => parse_ip_prefix(raw, kind, field_name),
        FieldKind::Array => Err(RuleError::ConfigInvalid(format!(
            "field `{field_name}`: nested arrays are not supported"
        ))),
        _ => parse_scalar(raw, kind, field_name),
    }
}

fn parse_string_cell(raw: &str, field_name: &str) -> Result<FieldPattern, RuleError> {
    if let Some(body) = strip_regex_quoting(raw) {
        let regex = Regex::new(body)
            .map_err(|e| RuleError::BadRule(format!("field `{field_name}`: bad regex: {e}")))?;
        return Ok(FieldPattern::Regex(regex));
    }
    Ok(FieldPattern::Exact(TypedValue::String(raw.to_string())))
}

/// Recognizes the `R"(pattern)"` quoting convention used for string rule fields that carry a
/// regex rather than an exact match.
fn strip_regex_quoting(raw: &str) -> Option<&str> {
    let prefix = "R\"(";
    let suffix = ")\"";
    if raw.starts_with(prefix) && raw.ends_with(suffix) && raw.len() >= prefix.len() + suffix.len()
    {
        Some(&raw[prefix.len()..raw.len() - suffix.len()])
    } else {
        None
    }
}

/// Parses an `addr[/prefix]` cell for a field declared `declared` (always [`FieldKind::IpV4`] or
/// [`FieldKind::IpV6`]). The CSV `ipaddr` type token is a single family-agnostic type (spec §3's
/// `ip_addr_t`) that always resolves to [`FieldKind::IpV6`] at the schema level (matching the
/// sink's own `ipaddr -> IPv6` column mapping), so a plain v4 literal in such a field is valid
/// input: it is embedded into its IPv4-mapped IPv6 form (RFC 4291 §2.5.5.2) rather than rejected.
/// A field explicitly declared v4-only (constructed directly against [`FieldKind::IpV4`], not
/// through the CSV loader) still rejects a v6 literal outright.
fn parse_ip_prefix(raw: &str, declared: FieldKind, field_name: &str) -> Result<TypedValue, RuleError> {
    let (addr_part, prefix_part) = match raw.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (raw, None),
    };
    let parse_prefix = |default: u8| -> Result<u8, RuleError> {
        match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| RuleError::BadRule(format!("field `{field_name}`: bad prefix length"))),
            None => Ok(default),
        }
    };

    if let Ok(v4) = addr_part.parse::<Ipv4Addr>() {
        let prefix = parse_prefix(32)?;
        return Ok(match declared {
            FieldKind::IpV4 => TypedValue::IpV4 { addr: v4, prefix },
            FieldKind::IpV6 => TypedValue::IpV6 {
                addr: v4.to_ipv6_mapped(),
                prefix: 96 + prefix.min(32),
            },
            _ => unreachable!("parse_ip_prefix only called for ip-kind fields"),
        });
    }
    if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
        let prefix = parse_prefix(128)?;
        return match declared {
            FieldKind::IpV6 => Ok(TypedValue::IpV6 { addr: v6, prefix }),
            FieldKind::IpV4 => Err(RuleError::BadRule(format!(
                "field `{field_name}`: `{raw}` is an IPv6 address but this field is declared IPv4-only"
            ))),
            _ => unreachable!("parse_ip_prefix only called for ip-kind fields"),
        };
    }
    Err(RuleError::BadRule(format!(
        "field `{field_name}`: `{raw}` is not a valid IP address"
    )))
}

fn parse_scalar(raw: &str, kind: FieldKind, field_name: &str) -> Result<TypedValue, RuleError> {
    let bad = || RuleError::BadRule(format!("field `{field_name}`: `{raw}` is not a valid {kind}"));

    Ok(match kind {
        FieldKind::I8 => TypedValue::I8(raw.parse().map_err(|_| bad())?),
        FieldKind::I16 => TypedValue::I16(raw.parse().map_err(|_| bad())?),
        FieldKind::I32 => TypedValue::I32(raw.parse().map_err(|_| bad())?),
        FieldKind::I64 => TypedValue::I64(raw.parse().map_err(|_| bad())?),
        FieldKind::U8 => TypedValue::U8(raw.parse().map_err(|_| bad())?),
        FieldKind::U16 => TypedValue::U16(raw.parse().map_err(|_| bad())?),
        FieldKind::U32 => TypedValue::U32(raw.parse().map_err(|_| bad())?),
        FieldKind::U64 => TypedValue::U64(raw.parse().map_err(|_| bad())?),
        FieldKind::F32 => TypedValue::F32(raw.parse().map_err(|_| bad())?),
        FieldKind::F64 => TypedValue::F64(raw.parse().map_err(|_| bad())?),
        FieldKind::Char => TypedValue::Char(raw.chars().next().ok_or_else(bad)?),
        FieldKind::TimeNs => TypedValue::TimeNs(raw.parse().map_err(|_| bad())?),
        FieldKind::Mac => TypedValue::Mac(parse_mac(raw).ok_or_else(bad)?),
        FieldKind::Bytes => TypedValue::Bytes(parse_hex(raw).ok_or_else(bad)?),
        FieldKind::String | FieldKind::IpV4 | FieldKind::IpV6 | FieldKind::Array => {
            unreachable!("handled above")
        }
    })
}

fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

fn parse_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cell_is_wildcard() {
        matches!(
            parse_cell("", FieldKind::U16, None, "PORT").unwrap(),
            FieldPattern::Wildcard
        );
    }

    #[test]
    fn quoted_string_becomes_regex() {
        let pattern = parse_cell("R\"(^/admin)\"", FieldKind::String, None, "URL").unwrap();
        assert!(matches!(pattern, FieldPattern::Regex(_)));
    }

    #[test]
    fn bare_string_is_exact() {
        let pattern = parse_cell("GET", FieldKind::String, None, "METHOD").unwrap();
        assert!(matches!(pattern, FieldPattern::Exact(TypedValue::String(_))));
    }

    #[test]
    fn ip_without_prefix_defaults_to_host_route() {
        let pattern = parse_cell("10.0.0.1", FieldKind::IpV4, None, "SRC_IP").unwrap();
        match pattern {
            FieldPattern::IpPrefix {
                addr: TypedValue::IpV4 { prefix, .. },
            } => assert_eq!(prefix, 32),
            _ => panic!("expected ipv4 prefix pattern"),
        }
    }

    #[test]
    fn v6_declared_field_rejects_neither_v4_nor_v6_literal() {
        let v4 = parse_cell("10.0.0.0/8", FieldKind::IpV6, None, "SRC_IP").unwrap();
        match v4 {
            FieldPattern::IpPrefix {
                addr: TypedValue::IpV6 { addr, prefix },
            } => {
                assert_eq!(addr, "::ffff:10.0.0.0".parse::<Ipv6Addr>().unwrap());
                assert_eq!(prefix, 104);
            }
            _ => panic!("expected ipv4 literal embedded into an ipv6 prefix pattern"),
        }

        let v6 = parse_cell("2001:db8::/32", FieldKind::IpV6, None, "SRC_IP").unwrap();
        match v6 {
            FieldPattern::IpPrefix {
                addr: TypedValue::IpV6 { prefix, .. },
            } => assert_eq!(prefix, 32),
            _ => panic!("expected ipv6 prefix pattern"),
        }
    }

    #[test]
    fn v4_declared_field_rejects_v6_literal() {
        let err = parse_cell("2001:db8::1", FieldKind::IpV4, None, "SRC_IP").unwrap_err();
        assert!(matches!(err, RuleError::BadRule(_)));
    }

    #[test]
    fn array_cell_parses_elements_as_declared_kind() {
        let pattern = parse_cell("80;443;8080", FieldKind::Array, Some(FieldKind::U16), "PORTS").unwrap();
        match pattern {
            FieldPattern::Exact(TypedValue::Array(items)) => {
                assert_eq!(
                    items,
                    vec![
                        TypedValue::U16(80),
                        TypedValue::U16(443),
                        TypedValue::U16(8080),
                    ]
                );
            }
            _ => panic!("expected an exact array pattern"),
        }
    }

    #[test]
    fn array_cell_with_bad_element_errors() {
        let err = parse_cell("80;not-a-port", FieldKind::Array, Some(FieldKind::U16), "PORTS")
            .unwrap_err();
        assert!(matches!(err, RuleError::BadRule(_)));
    }

    #[test]
    fn array_cell_without_declared_element_kind_errors() {
        let err = parse_cell("a;b", FieldKind::Array, None, "TAGS").unwrap_err();
        assert!(matches!(err, RuleError::ConfigInvalid(_)));
    }
}
