//! Recursive-descent parser for the scatter rule DSL.
//!
//! Grammar: `rule ::= branch ("|" branch)*`, `branch ::= "<" field_name? ">" ":" "("
//! field_name ("," field_name)* ")"`. An empty rule string parses to zero branches, which
//! [`crate::FlowScatter`] treats as "always round-robin".

use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0};
use nom::combinator::{all_consuming, cut, opt};
use nom::multi::separated_list1;
use nom::IResult;

use crate::ScatterError;

/// One `<guard>:(field,...)` branch of a parsed rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Branch {
    /// The field tested for non-zero-ness, or `None` for an unconditional branch.
    pub guard: Option<String>,
    /// Fields whose binary representation is concatenated and hashed when this branch fires.
    pub fields: Vec<String>,
}

/// A fully parsed scatter rule: an ordered list of branches, first match wins.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ScatterRule {
    pub branches: Vec<Branch>,
}

fn ws<'a, F, O>(mut inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    move |input: &'a str| {
        let (input, _) = multispace0(input)?;
        let (input, out) = inner(input)?;
        let (input, _) = multispace0(input)?;
        Ok((input, out))
    }
}

fn field_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn branch(input: &str) -> IResult<&str, Branch> {
    let (input, _) = ws(char('<'))(input)?;
    let (input, guard) = opt(field_name)(input)?;
    let (input, _) = ws(char('>'))(input)?;
    let (input, _) = cut(ws(char(':')))(input)?;
    let (input, _) = cut(ws(char('(')))(input)?;
    let (input, fields) = cut(separated_list1(ws(char(',')), field_name))(input)?;
    let (input, _) = cut(ws(char(')')))(input)?;
    Ok((
        input,
        Branch {
            guard: guard.map(str::to_string),
            fields: fields.into_iter().map(str::to_string).collect(),
        },
    ))
}

fn rule(input: &str) -> IResult<&str, Vec<Branch>> {
    separated_list1(ws(char('|')), branch)(input)
}

/// Parses a scatter rule string. An empty (or all-whitespace) string is valid and parses to no
/// branches.
pub fn parse_rule(input: &str) -> Result<ScatterRule, ScatterError> {
    if input.trim().is_empty() {
        return Ok(ScatterRule::default());
    }
    match all_consuming(ws(rule))(input) {
        Ok((_, branches)) => Ok(ScatterRule { branches }),
        Err(e) => Err(ScatterError::BadRule(format!("{e:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_rule_has_no_branches() {
        assert_eq!(parse_rule("").unwrap(), ScatterRule::default());
        assert_eq!(parse_rule("   ").unwrap(), ScatterRule::default());
    }

    #[test]
    fn single_unconditional_branch() {
        let parsed = parse_rule("<>:(SRC_IP,DST_IP)").unwrap();
        assert_eq!(parsed.branches.len(), 1);
        assert_eq!(parsed.branches[0].guard, None);
        assert_eq!(
            parsed.branches[0].fields,
            vec!["SRC_IP".to_string(), "DST_IP".to_string()]
        );
    }

    #[test]
    fn multiple_guarded_branches() {
        let parsed = parse_rule("<VLAN_ID>:(VLAN_ID)|<>:(SRC_IP,DST_IP)").unwrap();
        assert_eq!(parsed.branches.len(), 2);
        assert_eq!(parsed.branches[0].guard, Some("VLAN_ID".to_string()));
        assert_eq!(parsed.branches[1].guard, None);
    }

    #[test]
    fn missing_colon_is_bad_rule() {
        assert!(parse_rule("<>(SRC_IP)").is_err());
    }

    #[test]
    fn empty_tuple_is_bad_rule() {
        assert!(parse_rule("<>:()").is_err());
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        let parsed = parse_rule("  < VLAN_ID > : ( VLAN_ID , SRC_IP )  ").unwrap();
        assert_eq!(parsed.branches[0].guard, Some("VLAN_ID".to_string()));
        assert_eq!(
            parsed.branches[0].fields,
            vec!["VLAN_ID".to_string(), "SRC_IP".to_string()]
        );
    }
}
