//! Typed B-tree secondary index and index manager (component C4).
//!
//! Each index is an ordered map from a typed key to the set of document ids
//! holding that key. A unique index collapses the set to at most one id and
//! rejects a second insertion with `DuplicateKey`. The manager keeps a
//! keyed registry of `(collection, field) -> index` plus the declared key
//! kind used to resolve the key-selector's sentinel when a document is
//! missing the indexed field (spec §4.3).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use marrow_model::{Document, Error, Value, ValueKind, get_path};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub field: String,
    pub kind: ValueKind,
    pub unique: bool,
}

struct Index {
    kind: ValueKind,
    unique: bool,
    entries: BTreeMap<Value, BTreeSet<String>>,
}

impl Index {
    fn new(kind: ValueKind, unique: bool) -> Self {
        Self {
            kind,
            unique,
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, key: Value, id: &str) -> Result<(), Error> {
        let ids = self.entries.entry(key.clone()).or_default();
        if self.unique && !ids.is_empty() && !ids.contains(id) {
            return Err(Error::DuplicateKey(format!("{key:?}")));
        }
        ids.insert(id.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &Value, id: &str) {
        if let Some(ids) = self.entries.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    fn range_query(&self, low: Bound<Value>, high: Bound<Value>) -> Vec<(Value, Vec<String>)> {
        self.entries
            .range((low, high))
            .map(|(k, ids)| (k.clone(), ids.iter().cloned().collect()))
            .collect()
    }

    fn contains_key(&self, key: &Value) -> bool {
        self.entries.contains_key(key)
    }

    fn count(&self) -> usize {
        self.entries.values().map(|ids| ids.len()).sum()
    }
}

/// Resolve the key a document contributes to an index of the given kind:
/// the actual field value when present and non-null, numerically promoted
/// to the index's declared kind if both are numeric; otherwise the kind's
/// zero sentinel (spec §4.3 / §9's Open Question, resolved in favor of
/// "index at zero" for total range scans).
fn select_key(doc: &Document, field: &str, kind: ValueKind) -> Value {
    match get_path(&doc.data, field) {
        None | Some(Value::Null) => Value::zero_of_kind(kind),
        Some(v) => match (kind, v) {
            (ValueKind::Float, Value::Int(i)) => Value::Float(*i as f64),
            (ValueKind::Int, Value::Float(f)) => Value::Int(*f as i64),
            _ => v.clone(),
        },
    }
}

pub struct IndexManager {
    indexes: RwLock<HashMap<(String, String), Index>>,
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
        }
    }

    pub fn create_index(
        &self,
        collection: &str,
        field: &str,
        kind: ValueKind,
        unique: bool,
    ) -> Result<(), Error> {
        let mut indexes = self.indexes.write().unwrap();
        indexes
            .entry((collection.to_string(), field.to_string()))
            .or_insert_with(|| Index::new(kind, unique));
        Ok(())
    }

    pub fn drop_index(&self, collection: &str, field: &str) {
        self.indexes
            .write()
            .unwrap()
            .remove(&(collection.to_string(), field.to_string()));
    }

    pub fn list_indexes(&self, collection: &str) -> Vec<IndexDescriptor> {
        self.indexes
            .read()
            .unwrap()
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, field), idx)| IndexDescriptor {
                field: field.clone(),
                kind: idx.kind,
                unique: idx.unique,
            })
            .collect()
    }

    /// Index a freshly inserted document across every index on its
    /// collection. If any unique index rejects the key, prior insertions
    /// from this call are unwound and the whole operation fails (spec
    /// §4.3: "the whole insert unwinds").
    pub fn on_insert(&self, collection: &str, doc: &Document) -> Result<(), Error> {
        let mut indexes = self.indexes.write().unwrap();
        let mut applied: Vec<(&str, Value)> = Vec::new();

        for ((c, field), index) in indexes.iter_mut() {
            if c != collection {
                continue;
            }
            let key = select_key(doc, field, index.kind);
            match index.insert(key.clone(), &doc.id) {
                Ok(()) => applied.push((field.as_str(), key)),
                Err(e) => {
                    for (applied_field, applied_key) in &applied {
                        if let Some(idx) =
                            indexes.get_mut(&(collection.to_string(), applied_field.to_string()))
                        {
                            idx.remove(applied_key, &doc.id);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn on_update(
        &self,
        collection: &str,
        old_doc: &Document,
        new_doc: &Document,
    ) -> Result<(), Error> {
        let mut indexes = self.indexes.write().unwrap();
        let mut changed: Vec<(String, Value, Value)> = Vec::new();

        for ((c, field), index) in indexes.iter_mut() {
            if c != collection {
                continue;
            }
            let old_key = select_key(old_doc, field, index.kind);
            let new_key = select_key(new_doc, field, index.kind);
            if old_key == new_key {
                continue;
            }
            index.remove(&old_key, &old_doc.id);
            if let Err(e) = index.insert(new_key.clone(), &new_doc.id) {
                // Unwind this field and every field already swapped in this call.
                index.insert(old_key, &old_doc.id).ok();
                for (f, old_k, new_k) in changed {
                    if let Some(idx) = indexes.get_mut(&(collection.to_string(), f)) {
                        idx.remove(&new_k, &new_doc.id);
                        idx.insert(old_k, &old_doc.id).ok();
                    }
                }
                return Err(e);
            }
            changed.push((field.clone(), old_key, new_key));
        }
        Ok(())
    }

    pub fn on_delete(&self, collection: &str, doc: &Document) {
        let mut indexes = self.indexes.write().unwrap();
        for ((c, field), index) in indexes.iter_mut() {
            if c != collection {
                continue;
            }
            let key = select_key(doc, field, index.kind);
            index.remove(&key, &doc.id);
        }
    }

    pub fn on_drop_collection(&self, collection: &str) {
        self.indexes
            .write()
            .unwrap()
            .retain(|(c, _), _| c != collection);
    }

    pub fn range_query(
        &self,
        collection: &str,
        field: &str,
        low: Bound<Value>,
        high: Bound<Value>,
    ) -> Result<Vec<(Value, Vec<String>)>, Error> {
        let indexes = self.indexes.read().unwrap();
        let key = (collection.to_string(), field.to_string());
        let index = indexes
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("index {collection}.{field}")))?;
        Ok(index.range_query(low, high))
    }

    pub fn contains_key(&self, collection: &str, field: &str, key: &Value) -> Result<bool, Error> {
        let indexes = self.indexes.read().unwrap();
        let idx_key = (collection.to_string(), field.to_string());
        let index = indexes
            .get(&idx_key)
            .ok_or_else(|| Error::NotFound(format!("index {collection}.{field}")))?;
        Ok(index.contains_key(key))
    }

    pub fn count(&self, collection: &str, field: &str) -> Result<usize, Error> {
        let indexes = self.indexes.read().unwrap();
        let key = (collection.to_string(), field.to_string());
        let index = indexes
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("index {collection}.{field}")))?;
        Ok(index.count())
    }
}
