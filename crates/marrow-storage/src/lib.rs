//! Per-document file storage manager (component C2).
//!
//! Layout: `<base>/<collection>/<documentId>.json`, one file per document.
//! Writes are atomic via temp-file-then-rename; reads deserialize directly.
//! Missing documents are `Ok(None)`, never an error — only genuine I/O
//! failures propagate as `Error::StorageIoError`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use marrow_model::{Document, Error};
use rand::Rng;

pub struct FileStorage {
    base_dir: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.base_dir.join(collection)
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection).join(format!("{id}.json"))
    }

    /// Acquire (creating if needed) the exclusive lock guarding a single
    /// document path, so two concurrent writers targeting the same document
    /// serialize rather than race on the temp-file rename (spec §4.2 /
    /// §5: "a per-path exclusive lock guards concurrent writes to the same
    /// document").
    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn write_document(&self, collection: &str, doc: &Document) -> Result<(), Error> {
        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir)?;

        let path = self.document_path(collection, &doc.id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().unwrap();

        let suffix: u64 = rand::thread_rng().r#gen();
        let tmp_path = dir.join(format!("{}.json.tmp-{suffix:016x}", doc.id));

        let bytes = serde_json::to_vec_pretty(doc)?;
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn read_document(&self, collection: &str, id: &str) -> Result<Option<Document>, Error> {
        let path = self.document_path(collection, id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_document(&self, collection: &str, id: &str) -> Result<bool, Error> {
        let path = self.document_path(collection, id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().unwrap();

        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Filename stems (document ids) present for a collection. An absent
    /// collection directory yields an empty list, not an error.
    pub fn list_documents(&self, collection: &str) -> Result<Vec<String>, Error> {
        let dir = self.collection_dir(collection);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }

    /// Rediscover collections present on disk (spec §6: "Collections are
    /// rediscovered on startup by directory enumeration").
    pub fn list_collections(&self) -> Result<Vec<String>, Error> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('_') {
                        names.push(name.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    pub fn drop_collection(&self, collection: &str) -> Result<(), Error> {
        let dir = self.collection_dir(collection);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_model::Value;
    use std::collections::BTreeMap;

    fn doc(id: &str) -> Document {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), Value::String("Alice".into()));
        data.insert("age".to_string(), Value::Int(30));
        Document::new(id, data, 1000)
    }

    #[test]
    fn write_then_read_round_trips_types() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write_document("users", &doc("u1")).unwrap();

        let loaded = storage.read_document("users", "u1").unwrap().unwrap();
        assert_eq!(loaded, doc("u1"));
    }

    #[test]
    fn missing_document_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert_eq!(storage.read_document("users", "ghost").unwrap(), None);
    }

    #[test]
    fn delete_reports_whether_something_was_removed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write_document("users", &doc("u1")).unwrap();
        assert!(storage.delete_document("users", "u1").unwrap());
        assert!(!storage.delete_document("users", "u1").unwrap());
    }

    #[test]
    fn list_documents_returns_stems() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write_document("users", &doc("u1")).unwrap();
        storage.write_document("users", &doc("u2")).unwrap();

        let mut ids = storage.list_documents("users").unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn list_documents_for_absent_collection_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        assert_eq!(storage.list_documents("ghost").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn drop_collection_removes_all_documents() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write_document("users", &doc("u1")).unwrap();
        storage.drop_collection("users").unwrap();
        assert_eq!(storage.list_documents("users").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn list_collections_enumerates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.write_document("users", &doc("u1")).unwrap();
        storage.write_document("orders", &doc("o1")).unwrap();

        let mut cols = storage.list_collections().unwrap();
        cols.sort();
        assert_eq!(cols, vec!["orders".to_string(), "users".to_string()]);
    }
}
