//! Parse a JSON filter/sort specification into `Filter`/`SortKey` trees.
//!
//! Follows the same query-document shape the reference parser accepts for
//! BSON: a top-level object is an implicit AND of its entries, `{field:
//! value}` is an implicit `$eq`, `{field: {$gt: v}}` uses operator
//! sub-documents, and `$and`/`$or`/`$not` nest sub-filters explicitly.

use std::collections::BTreeMap;

use marrow_model::{Error, Value};
use regex::Regex;
use serde_json::{Map, Value as Json};

use crate::filter::Filter;
use crate::sort::{SortDirection, SortKey};

pub fn parse_filter(json: &Json) -> Result<Filter, Error> {
    let obj = json
        .as_object()
        .ok_or_else(|| Error::InvalidArgument("filter must be a JSON object".into()))?;

    let mut children = Vec::new();
    for (key, value) in obj {
        match key.as_str() {
            "$and" => children.push(parse_logical_array(value, Filter::And)?),
            "$or" => children.push(parse_logical_array(value, Filter::Or)?),
            "$not" => children.push(Filter::Not(Box::new(parse_filter(value)?))),
            k if k.starts_with('$') => {
                return Err(Error::InvalidArgument(format!("unknown top-level operator: {k}")));
            }
            _ => children.push(parse_field_condition(key, value)?),
        }
    }

    if children.is_empty() {
        return Err(Error::InvalidArgument("empty filter document".into()));
    }
    if children.len() == 1 {
        Ok(children.into_iter().next().unwrap())
    } else {
        Ok(Filter::And(children))
    }
}

fn parse_logical_array(value: &Json, make: fn(Vec<Filter>) -> Filter) -> Result<Filter, Error> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::InvalidArgument("$and/$or value must be an array".into()))?;

    let children = arr.iter().map(parse_filter).collect::<Result<Vec<_>, _>>()?;
    if children.is_empty() {
        return Err(Error::InvalidArgument("$and/$or array must not be empty".into()));
    }
    Ok(make(children))
}

fn parse_field_condition(field: &str, value: &Json) -> Result<Filter, Error> {
    if let Some(obj) = value.as_object() {
        if obj.keys().next().is_some_and(|k| k.starts_with('$')) {
            return parse_operator_doc(field, obj);
        }
    }
    Ok(Filter::Eq(field.to_string(), json_to_value(value)?))
}

fn parse_operator_doc(field: &str, obj: &Map<String, Json>) -> Result<Filter, Error> {
    if obj.contains_key("$regex") {
        return parse_regex(field, obj);
    }

    let mut conditions = Vec::new();
    for (op_key, op_value) in obj {
        let expr = match op_key.as_str() {
            "$eq" => Filter::Eq(field.to_string(), json_to_value(op_value)?),
            "$ne" => Filter::Ne(field.to_string(), json_to_value(op_value)?),
            "$gt" => Filter::Gt(field.to_string(), json_to_value(op_value)?),
            "$gte" => Filter::Gte(field.to_string(), json_to_value(op_value)?),
            "$lt" => Filter::Lt(field.to_string(), json_to_value(op_value)?),
            "$lte" => Filter::Lte(field.to_string(), json_to_value(op_value)?),
            "$in" => Filter::In(field.to_string(), parse_value_array(op_value)?),
            "$nin" => Filter::Nin(field.to_string(), parse_value_array(op_value)?),
            "$exists" => match op_value.as_bool() {
                Some(b) => Filter::Exists(field.to_string(), b),
                None => return Err(Error::InvalidArgument("$exists value must be a boolean".into())),
            },
            "$options" => return Err(Error::InvalidArgument("$options without $regex".into())),
            other => return Err(Error::InvalidArgument(format!("unknown field operator: {other}"))),
        };
        conditions.push(expr);
    }

    match conditions.len() {
        0 => Err(Error::InvalidArgument("empty operator document".into())),
        1 => Ok(conditions.into_iter().next().unwrap()),
        _ => Ok(Filter::And(conditions)),
    }
}

fn parse_regex(field: &str, obj: &Map<String, Json>) -> Result<Filter, Error> {
    let pattern = obj
        .get("$regex")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidArgument("$regex value must be a string".into()))?;
    let options = obj.get("$options").and_then(|v| v.as_str());

    for key in obj.keys() {
        if key != "$regex" && key != "$options" {
            return Err(Error::InvalidArgument(format!("unexpected key alongside $regex: {key}")));
        }
    }

    let full_pattern = match options {
        Some(opts) => {
            let mut prefix = String::from("(?");
            for ch in opts.chars() {
                match ch {
                    'i' | 's' | 'm' | 'x' => prefix.push(ch),
                    c => return Err(Error::InvalidArgument(format!("unknown regex option: {c}"))),
                }
            }
            prefix.push(')');
            prefix.push_str(pattern);
            prefix
        }
        None => pattern.to_string(),
    };

    let re = Regex::new(&full_pattern)
        .map_err(|e| Error::InvalidArgument(format!("invalid regex pattern: {e}")))?;
    Ok(Filter::Regex(field.to_string(), re))
}

fn parse_value_array(value: &Json) -> Result<Vec<Value>, Error> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::InvalidArgument("$in/$nin value must be an array".into()))?;
    arr.iter().map(json_to_value).collect()
}

/// Convert a JSON literal to a `Value`. `{"$timestamp": millis}` is the
/// escape hatch for expressing a `Value::Timestamp` literal, since JSON has
/// no native timestamp type.
pub fn json_to_value(json: &Json) -> Result<Value, Error> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(Error::InvalidArgument("number out of range".into()))
            }
        }
        Json::String(s) => Ok(Value::String(s.clone())),
        Json::Array(items) => items.iter().map(json_to_value).collect::<Result<_, _>>().map(Value::List),
        Json::Object(map) => {
            if let Some(ts) = map.get("$timestamp") {
                let ms = ts
                    .as_i64()
                    .ok_or_else(|| Error::InvalidArgument("$timestamp must be an integer".into()))?;
                return Ok(Value::Timestamp(ms));
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), json_to_value(v)?);
            }
            Ok(Value::Map(out))
        }
    }
}

pub fn parse_sort(json: &Json) -> Result<Vec<SortKey>, Error> {
    let arr = json
        .as_array()
        .ok_or_else(|| Error::InvalidArgument("sort must be a JSON array".into()))?;

    arr.iter()
        .map(|item| {
            let obj = item
                .as_object()
                .ok_or_else(|| Error::InvalidArgument("sort entry must be an object".into()))?;
            let field = obj
                .get("field")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidArgument("sort entry missing field".into()))?
                .to_string();
            let direction = match obj.get("direction").and_then(|v| v.as_str()) {
                Some("desc") => SortDirection::Desc,
                Some("asc") | None => SortDirection::Asc,
                Some(other) => {
                    return Err(Error::InvalidArgument(format!("unknown sort direction: {other}")));
                }
            };
            Ok(SortKey { field, direction })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_field_is_implicit_eq() {
        let filter = parse_filter(&json!({ "status": "active" })).unwrap();
        assert!(matches!(filter, Filter::Eq(f, Value::String(s)) if f == "status" && s == "active"));
    }

    #[test]
    fn multiple_fields_become_and() {
        let filter = parse_filter(&json!({ "status": "active", "age": 30 })).unwrap();
        match filter {
            Filter::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn operator_doc_gte() {
        let filter = parse_filter(&json!({ "age": { "$gte": 21 } })).unwrap();
        assert!(matches!(filter, Filter::Gte(f, Value::Int(21)) if f == "age"));
    }

    #[test]
    fn multiple_operators_same_field_become_and() {
        let filter = parse_filter(&json!({ "score": { "$gt": 50, "$lte": 100 } })).unwrap();
        match filter {
            Filter::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn explicit_or_and_and() {
        let or_filter =
            parse_filter(&json!({ "$or": [{ "status": "active" }, { "status": "pending" }] })).unwrap();
        assert!(matches!(or_filter, Filter::Or(children) if children.len() == 2));

        let and_filter = parse_filter(&json!({ "$and": [{ "a": 1 }, { "b": 2 }] })).unwrap();
        assert!(matches!(and_filter, Filter::And(children) if children.len() == 2));
    }

    #[test]
    fn not_wraps_inner_filter() {
        let filter = parse_filter(&json!({ "$not": { "status": "active" } })).unwrap();
        assert!(matches!(filter, Filter::Not(_)));
    }

    #[test]
    fn regex_with_options() {
        let filter = parse_filter(&json!({ "name": { "$regex": "^john", "$options": "i" } })).unwrap();
        match filter {
            Filter::Regex(f, re) => {
                assert_eq!(f, "name");
                assert_eq!(re.as_str(), "(?i)^john");
            }
            other => panic!("expected Regex, got {other:?}"),
        }
    }

    #[test]
    fn exists_false() {
        let filter = parse_filter(&json!({ "deleted_at": { "$exists": false } })).unwrap();
        assert!(matches!(filter, Filter::Exists(f, false) if f == "deleted_at"));
    }

    #[test]
    fn unknown_top_level_operator_errors() {
        let err = parse_filter(&json!({ "$nor": [{ "a": 1 }] })).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(msg) if msg.contains("unknown top-level operator")));
    }

    #[test]
    fn unknown_field_operator_errors() {
        let err = parse_filter(&json!({ "age": { "$between": 10 } })).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(msg) if msg.contains("unknown field operator")));
    }

    #[test]
    fn empty_document_errors() {
        let err = parse_filter(&json!({})).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(msg) if msg.contains("empty")));
    }

    #[test]
    fn invalid_regex_pattern_errors() {
        let err = parse_filter(&json!({ "name": { "$regex": "[invalid" } })).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(msg) if msg.contains("invalid regex")));
    }

    #[test]
    fn timestamp_literal_parses() {
        let value = json_to_value(&json!({ "$timestamp": 12345 })).unwrap();
        assert_eq!(value, Value::Timestamp(12345));
    }

    #[test]
    fn sort_defaults_to_ascending() {
        let keys = parse_sort(&json!([{ "field": "age" }])).unwrap();
        assert_eq!(keys[0].direction, SortDirection::Asc);
    }
}
