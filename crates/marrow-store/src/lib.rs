//! In-memory document store (component C3): wires file persistence (C2),
//! secondary indexes (C4) and TTL tracking (C5) behind one write-through
//! API. Each collection keeps its documents in a `BTreeMap` guarded by its
//! own lock so unrelated collections never contend (spec §5).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use marrow_index::IndexManager;
pub use marrow_index::IndexDescriptor;
use marrow_model::{Document, Error, Value, ValueKind, now_millis};
use marrow_storage::FileStorage;
pub use marrow_ttl::{TtlEvent, TtlHandle, TtlPolicy, TtlStats};
use marrow_ttl::TtlService;

type CollectionMap = BTreeMap<String, Document>;

pub struct DocumentStore {
    storage: FileStorage,
    indexes: IndexManager,
    ttl: TtlService,
    collections: RwLock<HashMap<String, Arc<RwLock<CollectionMap>>>>,
    drop_observers: Mutex<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl DocumentStore {
    /// Open (or create) a store rooted at `base_dir`, rediscovering any
    /// collections and documents already on disk (spec §6).
    pub fn open(base_dir: impl AsRef<Path>) -> Result<Arc<Self>, Error> {
        let storage = FileStorage::new(base_dir.as_ref());

        let store = Arc::new_cyclic(|weak: &std::sync::Weak<DocumentStore>| {
            let weak = weak.clone();
            let ttl = TtlService::new(move |collection, id| match weak.upgrade() {
                Some(store) => store.delete_internal(collection, id).unwrap_or(false),
                None => false,
            });

            DocumentStore {
                storage,
                indexes: IndexManager::new(),
                ttl,
                collections: RwLock::new(HashMap::new()),
                drop_observers: Mutex::new(Vec::new()),
            }
        });

        for collection in store.storage.list_collections()? {
            let map = store.ensure_collection(&collection);
            let mut guard = map.write().unwrap();
            for id in store.storage.list_documents(&collection)? {
                if let Some(doc) = store.storage.read_document(&collection, &id)? {
                    store.ttl.register(&collection, &doc)?;
                    guard.insert(doc.id.clone(), doc);
                }
            }
        }

        Ok(store)
    }

    fn ensure_collection(&self, collection: &str) -> Arc<RwLock<CollectionMap>> {
        let mut collections = self.collections.write().unwrap();
        collections
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone()
    }

    fn get_collection(&self, collection: &str) -> Option<Arc<RwLock<CollectionMap>>> {
        self.collections.read().unwrap().get(collection).cloned()
    }

    /// Declare a collection so it shows up in `list_collections` even
    /// before its first document is written. Idempotent.
    pub fn create_collection(&self, collection: &str) {
        self.ensure_collection(collection);
    }

    pub fn list_collections(&self) -> Vec<String> {
        self.collections.read().unwrap().keys().cloned().collect()
    }

    pub fn drop_collection(&self, collection: &str) -> Result<(), Error> {
        self.collections.write().unwrap().remove(collection);
        self.indexes.on_drop_collection(collection);
        self.ttl.on_drop_collection(collection);
        self.storage.drop_collection(collection)?;
        for observer in self.drop_observers.lock().unwrap().iter() {
            observer(collection);
        }
        Ok(())
    }

    /// Register a callback invoked whenever a collection is dropped, so
    /// the cursor manager can kill cursors scoped to it (spec §4.6).
    pub fn on_collection_dropped(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.drop_observers.lock().unwrap().push(Box::new(callback));
    }

    pub fn insert(
        &self,
        collection: &str,
        id: Option<String>,
        data: BTreeMap<String, Value>,
    ) -> Result<Document, Error> {
        let map = self.ensure_collection(collection);
        let mut guard = map.write().unwrap();

        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if guard.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }

        let doc = Document::new(id, data, now_millis());
        self.indexes.on_insert(collection, &doc)?;
        if let Err(e) = self.storage.write_document(collection, &doc) {
            self.indexes.on_delete(collection, &doc);
            return Err(e);
        }
        self.ttl.register(collection, &doc)?;

        guard.insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.get_collection(collection)?.read().unwrap().get(id).cloned()
    }

    pub fn exists(&self, collection: &str, id: &str) -> bool {
        self.get(collection, id).is_some()
    }

    pub fn scan(&self, collection: &str) -> Vec<Document> {
        match self.get_collection(collection) {
            Some(map) => map.read().unwrap().values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn count(&self, collection: &str) -> usize {
        match self.get_collection(collection) {
            Some(map) => map.read().unwrap().len(),
            None => 0,
        }
    }

    /// Merge `patch` into the existing document's attributes (fields not
    /// present in `patch` are left untouched) and bump its version.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        patch: BTreeMap<String, Value>,
    ) -> Result<Document, Error> {
        let map = self
            .get_collection(collection)
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;
        let mut guard = map.write().unwrap();

        let old_doc = guard
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;

        let mut new_doc = old_doc.clone();
        for (field, value) in patch {
            new_doc.data.insert(field, value);
        }
        new_doc.bump(now_millis());

        self.indexes.on_update(collection, &old_doc, &new_doc)?;
        if let Err(e) = self.storage.write_document(collection, &new_doc) {
            self.indexes.on_update(collection, &new_doc, &old_doc).ok();
            return Err(e);
        }
        self.ttl.register(collection, &new_doc)?;

        guard.insert(new_doc.id.clone(), new_doc.clone());
        Ok(new_doc)
    }

    /// Replace a document's entire attribute map (id, `created_at` and
    /// version lineage are preserved; `updated_at`/`version` bump as for
    /// `update`).
    pub fn replace(
        &self,
        collection: &str,
        id: &str,
        data: BTreeMap<String, Value>,
    ) -> Result<Document, Error> {
        let map = self
            .get_collection(collection)
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;
        let mut guard = map.write().unwrap();

        let old_doc = guard
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{collection}/{id}")))?;

        let mut new_doc = old_doc.clone();
        new_doc.data = data;
        new_doc.bump(now_millis());

        self.indexes.on_update(collection, &old_doc, &new_doc)?;
        if let Err(e) = self.storage.write_document(collection, &new_doc) {
            self.indexes.on_update(collection, &new_doc, &old_doc).ok();
            return Err(e);
        }
        self.ttl.register(collection, &new_doc)?;

        guard.insert(new_doc.id.clone(), new_doc.clone());
        Ok(new_doc)
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<bool, Error> {
        self.delete_internal(collection, id)
    }

    fn delete_internal(&self, collection: &str, id: &str) -> Result<bool, Error> {
        let Some(map) = self.get_collection(collection) else {
            return Ok(false);
        };
        let mut guard = map.write().unwrap();

        let Some(doc) = guard.get(id).cloned() else {
            return Ok(false);
        };

        self.storage.delete_document(collection, id)?;
        self.indexes.on_delete(collection, &doc);
        self.ttl.unregister(collection, id)?;
        guard.remove(id);
        Ok(true)
    }

    pub fn create_index(
        &self,
        collection: &str,
        field: &str,
        kind: ValueKind,
        unique: bool,
    ) -> Result<(), Error> {
        self.indexes.create_index(collection, field, kind, unique)?;
        for doc in self.scan(collection) {
            self.indexes.on_insert(collection, &doc)?;
        }
        Ok(())
    }

    pub fn drop_index(&self, collection: &str, field: &str) {
        self.indexes.drop_index(collection, field);
    }

    pub fn list_indexes(&self, collection: &str) -> Vec<IndexDescriptor> {
        self.indexes.list_indexes(collection)
    }

    pub fn set_ttl_policy(&self, collection: &str, policy: TtlPolicy) -> Result<(), Error> {
        self.ttl.set_policy(collection, policy)
    }

    pub fn remove_ttl_policy(&self, collection: &str) -> Result<(), Error> {
        self.ttl.remove_policy(collection)
    }

    pub fn ttl_stats(&self) -> TtlStats {
        self.ttl.stats()
    }

    pub fn on_ttl_event(&self, callback: impl Fn(TtlEvent) + Send + Sync + 'static) {
        self.ttl.on_event(callback);
    }

    pub fn spawn_ttl_sweeper(&self, interval: std::time::Duration) -> TtlHandle {
        self.ttl.spawn_background(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let doc = store
            .insert("users", Some("u1".into()), attrs(&[("name", Value::String("Ana".into()))]))
            .unwrap();
        assert_eq!(doc.id, "u1");
        assert_eq!(store.get("users", "u1"), Some(doc));
    }

    #[test]
    fn insert_without_id_generates_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        let doc = store.insert("users", None, BTreeMap::new()).unwrap();
        assert_eq!(doc.id.len(), 36);
    }

    #[test]
    fn duplicate_id_insert_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store.insert("users", Some("u1".into()), BTreeMap::new()).unwrap();
        let err = store.insert("users", Some("u1".into()), BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[test]
    fn update_merges_fields_and_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store
            .insert("users", Some("u1".into()), attrs(&[("age", Value::Int(20))]))
            .unwrap();
        let updated = store
            .update("users", "u1", attrs(&[("age", Value::Int(21))]))
            .unwrap();
        assert_eq!(updated.data.get("age"), Some(&Value::Int(21)));
        assert_eq!(updated.version, 2);
    }

    #[test]
    fn delete_removes_document_and_storage_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store.insert("users", Some("u1".into()), BTreeMap::new()).unwrap();
        assert!(store.delete("users", "u1").unwrap());
        assert!(!store.delete("users", "u1").unwrap());
        assert_eq!(store.get("users", "u1"), None);
    }

    #[test]
    fn reopen_rediscovers_collections_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DocumentStore::open(dir.path()).unwrap();
            store.insert("users", Some("u1".into()), BTreeMap::new()).unwrap();
        }
        let reopened = DocumentStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("users", "u1").map(|d| d.id), Some("u1".to_string()));
    }

    #[test]
    fn create_index_backfills_existing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store
            .insert("users", Some("u1".into()), attrs(&[("email", Value::String("a@x.com".into()))]))
            .unwrap();
        store.create_index("users", "email", ValueKind::String, true).unwrap();

        let err = store
            .insert("users", Some("u2".into()), attrs(&[("email", Value::String("a@x.com".into()))]))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[test]
    fn drop_collection_notifies_observers() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store.insert("sessions", Some("s1".into()), BTreeMap::new()).unwrap();

        let dropped = Arc::new(Mutex::new(Vec::new()));
        let dropped2 = dropped.clone();
        store.on_collection_dropped(move |c| dropped2.lock().unwrap().push(c.to_string()));

        store.drop_collection("sessions").unwrap();
        assert_eq!(*dropped.lock().unwrap(), vec!["sessions".to_string()]);
        assert_eq!(store.count("sessions"), 0);
    }

    #[test]
    fn ttl_policy_expires_document_on_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path()).unwrap();
        store
            .set_ttl_policy(
                "sessions",
                TtlPolicy {
                    field: "expire_at".to_string(),
                    default_expire_after: None,
                    immediate_deletion: false,
                    cleanup_interval: std::time::Duration::from_secs(60),
                },
            )
            .unwrap();

        let past = now_millis() - 1000;
        store
            .insert("sessions", Some("s1".into()), attrs(&[("expire_at", Value::Timestamp(past))]))
            .unwrap();

        assert_eq!(store.ttl_stats().documents_tracked, 1);
        let removed = store.ttl.sweep_once();
        assert_eq!(removed, 1);
        assert_eq!(store.get("sessions", "s1"), None);
    }
}
