//! Filter expression tree and evaluation against a document's attribute
//! map (component C6).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use marrow_model::{Value, get_path};
use regex::Regex;

#[derive(Debug, Clone)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    In(String, Vec<Value>),
    Nin(String, Vec<Value>),
    Exists(String, bool),
    Regex(String, Regex),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Evaluate this filter against a document's flattened attribute map
    /// (spec §4.5). A field that is absent, or whose value's kind is
    /// incompatible with the comparison's operand, simply fails to match —
    /// filter evaluation never errors.
    pub fn evaluate(&self, attrs: &BTreeMap<String, Value>) -> bool {
        match self {
            Filter::Eq(field, want) => get_path(attrs, field)
                .map(|v| v.values_equal(want))
                .unwrap_or(false),
            Filter::Ne(field, want) => !get_path(attrs, field)
                .map(|v| v.values_equal(want))
                .unwrap_or(false),
            Filter::Lt(field, want) => compare(attrs, field, want, |o| o == Ordering::Less),
            Filter::Lte(field, want) => {
                compare(attrs, field, want, |o| o != Ordering::Greater)
            }
            Filter::Gt(field, want) => compare(attrs, field, want, |o| o == Ordering::Greater),
            Filter::Gte(field, want) => compare(attrs, field, want, |o| o != Ordering::Less),
            Filter::In(field, options) => get_path(attrs, field)
                .map(|v| options.iter().any(|o| v.values_equal(o)))
                .unwrap_or(false),
            Filter::Nin(field, options) => !get_path(attrs, field)
                .map(|v| options.iter().any(|o| v.values_equal(o)))
                .unwrap_or(false),
            Filter::Exists(field, want) => get_path(attrs, field).is_some() == *want,
            Filter::Regex(field, re) => get_path(attrs, field)
                .and_then(|v| v.as_str())
                .map(|s| re.is_match(s))
                .unwrap_or(false),
            Filter::And(children) => children.iter().all(|c| c.evaluate(attrs)),
            Filter::Or(children) => children.iter().any(|c| c.evaluate(attrs)),
            Filter::Not(inner) => !inner.evaluate(attrs),
        }
    }
}

fn compare(
    attrs: &BTreeMap<String, Value>,
    field: &str,
    want: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    get_path(attrs, field)
        .and_then(|v| v.partial_compare(want))
        .map(accept)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn eq_matches_equal_value() {
        let a = attrs(&[("status", Value::String("active".into()))]);
        assert!(Filter::Eq("status".into(), Value::String("active".into())).evaluate(&a));
    }

    #[test]
    fn eq_on_absent_field_is_false() {
        let a = attrs(&[]);
        assert!(!Filter::Eq("status".into(), Value::String("active".into())).evaluate(&a));
    }

    #[test]
    fn gt_promotes_int_and_float() {
        let a = attrs(&[("score", Value::Int(10))]);
        assert!(Filter::Gt("score".into(), Value::Float(9.5)).evaluate(&a));
    }

    #[test]
    fn gt_across_incompatible_kinds_is_false() {
        let a = attrs(&[("score", Value::String("ten".into()))]);
        assert!(!Filter::Gt("score".into(), Value::Int(5)).evaluate(&a));
    }

    #[test]
    fn exists_false_matches_absent_field() {
        let a = attrs(&[]);
        assert!(Filter::Exists("deleted_at".into(), false).evaluate(&a));
    }

    #[test]
    fn in_matches_any_option() {
        let a = attrs(&[("status", Value::String("pending".into()))]);
        let f = Filter::In(
            "status".into(),
            vec![Value::String("active".into()), Value::String("pending".into())],
        );
        assert!(f.evaluate(&a));
    }

    #[test]
    fn and_requires_all_children() {
        let a = attrs(&[("status", Value::String("active".into())), ("score", Value::Int(5))]);
        let f = Filter::And(vec![
            Filter::Eq("status".into(), Value::String("active".into())),
            Filter::Gt("score".into(), Value::Int(10)),
        ]);
        assert!(!f.evaluate(&a));
    }

    #[test]
    fn not_inverts_inner_result() {
        let a = attrs(&[("status", Value::String("active".into()))]);
        let f = Filter::Not(Box::new(Filter::Eq("status".into(), Value::String("active".into()))));
        assert!(!f.evaluate(&a));
    }

    #[test]
    fn regex_matches_against_string_field() {
        let a = attrs(&[("email", Value::String("admin@example.com".into()))]);
        let f = Filter::Regex("email".into(), Regex::new("^admin@").unwrap());
        assert!(f.evaluate(&a));
    }
}
