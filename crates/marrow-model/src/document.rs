use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Pseudo-field under which a document's id is exposed when its attribute
/// map is flattened for filter evaluation or aggregation (spec §4.7's
/// `_id` output field).
pub const ID_FIELD: &str = "_id";

/// An entity in a collection: a unique id, a heterogeneous attribute map,
/// and version/timestamp metadata bumped on every successful mutation
/// (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: BTreeMap<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: u64,
}

impl Document {
    pub fn new(id: impl Into<String>, data: BTreeMap<String, Value>, now: i64) -> Self {
        Self {
            id: id.into(),
            data,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Bump version and `updated_at` as part of a successful `update`
    /// (spec §4.1 / invariant: `Version` strictly increases, `UpdatedAt >=
    /// CreatedAt`).
    pub fn bump(&mut self, now: i64) {
        self.version += 1;
        self.updated_at = now.max(self.created_at);
    }

    /// The document's attribute map with `_id` injected, used as the input
    /// row for the filter engine, sort, and the aggregation pipeline — all
    /// three operate over a plain attribute map rather than a full
    /// `Document` so that synthetic rows produced mid-pipeline (e.g. a
    /// `Group` stage's output) share the same evaluation machinery.
    pub fn to_attrs(&self) -> BTreeMap<String, Value> {
        let mut attrs = self.data.clone();
        attrs.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        attrs
    }
}

/// Resolve a dotted field path (`"address.city"`) against an attribute map.
/// Traversal only descends through `Value::Map`; an intermediate non-map
/// value yields `None` (spec §4.5: "an intermediate non-map yields absent").
pub fn get_path<'a>(attrs: &'a BTreeMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = attrs.get(first)?;
    for seg in segments {
        match current {
            Value::Map(m) => current = m.get(seg)?,
            _ => return None,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        let mut data = BTreeMap::new();
        let mut address = BTreeMap::new();
        address.insert("city".to_string(), Value::String("Austin".into()));
        data.insert("address".to_string(), Value::Map(address));
        data.insert("age".to_string(), Value::Int(30));
        Document::new("doc1", data, 1000)
    }

    #[test]
    fn path_resolves_nested_field() {
        let d = doc();
        let attrs = d.to_attrs();
        assert_eq!(get_path(&attrs, "address.city"), Some(&Value::String("Austin".into())));
    }

    #[test]
    fn path_through_non_map_is_absent() {
        let d = doc();
        let attrs = d.to_attrs();
        assert_eq!(get_path(&attrs, "age.sub"), None);
    }

    #[test]
    fn to_attrs_injects_id() {
        let d = doc();
        let attrs = d.to_attrs();
        assert_eq!(attrs.get(ID_FIELD), Some(&Value::String("doc1".into())));
    }

    #[test]
    fn bump_increments_version_and_clamps_updated_at() {
        let mut d = doc();
        d.bump(500); // earlier than created_at
        assert_eq!(d.version, 2);
        assert!(d.updated_at >= d.created_at);
    }
}
