//! Multi-field stable sort over attribute maps.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use marrow_model::{Value, get_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Sort rows by successive `SortKey`s, each breaking ties left by the
/// previous one. A field absent on a row sorts before any present value
/// (spec §4.5); the sort is stable so rows tying on every key keep their
/// relative order.
pub fn apply_sort(rows: &mut [BTreeMap<String, Value>], keys: &[SortKey]) {
    rows.sort_by(|a, b| {
        for key in keys {
            let ordering = match (get_path(a, &key.field), get_path(b, &key.field)) {
                (Some(x), Some(y)) => x.partial_compare(y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            let ordering = match key.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn sorts_ascending_by_single_key() {
        let mut rows = vec![
            row(&[("age", Value::Int(30))]),
            row(&[("age", Value::Int(10))]),
            row(&[("age", Value::Int(20))]),
        ];
        apply_sort(
            &mut rows,
            &[SortKey { field: "age".into(), direction: SortDirection::Asc }],
        );
        let ages: Vec<i64> = rows
            .iter()
            .map(|r| match r.get("age") {
                Some(Value::Int(i)) => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ages, vec![10, 20, 30]);
    }

    #[test]
    fn secondary_key_breaks_ties() {
        let mut rows = vec![
            row(&[("team", Value::String("b".into())), ("score", Value::Int(1))]),
            row(&[("team", Value::String("a".into())), ("score", Value::Int(2))]),
            row(&[("team", Value::String("a".into())), ("score", Value::Int(1))]),
        ];
        apply_sort(
            &mut rows,
            &[
                SortKey { field: "team".into(), direction: SortDirection::Asc },
                SortKey { field: "score".into(), direction: SortDirection::Asc },
            ],
        );
        let order: Vec<(String, i64)> = rows
            .iter()
            .map(|r| {
                let team = match r.get("team") {
                    Some(Value::String(s)) => s.clone(),
                    _ => unreachable!(),
                };
                let score = match r.get("score") {
                    Some(Value::Int(i)) => *i,
                    _ => unreachable!(),
                };
                (team, score)
            })
            .collect();
        assert_eq!(
            order,
            vec![("a".to_string(), 1), ("a".to_string(), 2), ("b".to_string(), 1)]
        );
    }

    #[test]
    fn missing_field_sorts_before_present_values() {
        let mut rows = vec![row(&[("age", Value::Int(5))]), row(&[])];
        apply_sort(
            &mut rows,
            &[SortKey { field: "age".into(), direction: SortDirection::Asc }],
        );
        assert!(rows[0].get("age").is_none());
    }
}
