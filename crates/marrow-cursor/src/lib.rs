//! Server-side cursor manager (component C7): materializes a query result
//! set once, then hands it out in batches across `get_more` calls, with an
//! idle timeout and an opaque resume token for reconnecting clients.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use marrow_model::{Error, ID_FIELD, Value, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;

pub const MIN_TIMEOUT_MINUTES: u32 = 1;
pub const MAX_TIMEOUT_MINUTES: u32 = 60;
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 10;

#[derive(Debug, Clone)]
pub struct CursorOptions {
    pub batch_size: usize,
    pub timeout_minutes: u32,
    pub include_total_count: bool,
    pub resume_token: Option<String>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            include_total_count: false,
            resume_token: None,
        }
    }
}

impl CursorOptions {
    fn validate(&self) -> Result<(), Error> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(Error::InvalidArgument(format!(
                "batch_size must be between {MIN_BATCH_SIZE} and {MAX_BATCH_SIZE}"
            )));
        }
        if !(MIN_TIMEOUT_MINUTES..=MAX_TIMEOUT_MINUTES).contains(&self.timeout_minutes) {
            return Err(Error::InvalidArgument(format!(
                "timeout_minutes must be between {MIN_TIMEOUT_MINUTES} and {MAX_TIMEOUT_MINUTES}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResumeToken {
    cursor_id: String,
    last_document_id: Option<String>,
    created_at: i64,
    filter_json: Json,
    sort_json: Json,
}

pub fn encode_resume_token(token: &ResumeTokenInfo) -> String {
    let payload = ResumeToken {
        cursor_id: token.cursor_id.clone(),
        last_document_id: token.last_document_id.clone(),
        created_at: token.created_at,
        filter_json: token.filter_json.clone(),
        sort_json: token.sort_json.clone(),
    };
    let bytes = serde_json::to_vec(&payload).expect("resume token is always serializable");
    BASE64.encode(bytes)
}

/// Decode a resume token. Malformed or tampered tokens decode to `None`
/// rather than an error — a resume attempt against a token that no longer
/// matches anything is just treated as "start fresh" by the caller.
pub fn decode_resume_token(token: &str) -> Option<ResumeTokenInfo> {
    let bytes = BASE64.decode(token).ok()?;
    let parsed: ResumeToken = serde_json::from_slice(&bytes).ok()?;
    Some(ResumeTokenInfo {
        cursor_id: parsed.cursor_id,
        last_document_id: parsed.last_document_id,
        created_at: parsed.created_at,
        filter_json: parsed.filter_json,
        sort_json: parsed.sort_json,
    })
}

#[derive(Debug, Clone)]
pub struct ResumeTokenInfo {
    pub cursor_id: String,
    pub last_document_id: Option<String>,
    pub created_at: i64,
    pub filter_json: Json,
    pub sort_json: Json,
}

struct CursorState {
    collection: String,
    documents: Vec<BTreeMap<String, Value>>,
    position: usize,
    batch_size: usize,
    timeout_minutes: u32,
    created_at: i64,
    last_accessed_at: i64,
    total_count: Option<usize>,
    filter_json: Json,
    sort_json: Json,
}

impl CursorState {
    fn is_expired(&self, now: i64) -> bool {
        let timeout_ms = self.timeout_minutes as i64 * 60_000;
        now - self.last_accessed_at > timeout_ms
    }
}

pub struct CursorBatch {
    pub cursor_id: Option<String>,
    pub documents: Vec<BTreeMap<String, Value>>,
    pub done: bool,
    pub total_count: Option<usize>,
}

pub struct CursorManager {
    cursors: RwLock<HashMap<String, Mutex<CursorState>>>,
}

impl Default for CursorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorManager {
    pub fn new() -> Self {
        Self { cursors: RwLock::new(HashMap::new()) }
    }

    /// Materialize a result set behind a new cursor and return its first
    /// batch. If the whole result set fits in one batch, the cursor is
    /// consumed immediately and `cursor_id` comes back `None`.
    ///
    /// If `options.resume_token` decodes to a cursor that is still live, the
    /// freshly supplied `documents` are discarded and the remainder of the
    /// live cursor is returned instead (spec §4.6 "Resume"). If the token is
    /// well-formed but its cursor has been reaped, the new cursor starts
    /// immediately after `last_document_id` within the re-executed snapshot
    /// (or at the first id greater than it, lexicographically, if that
    /// document is no longer present). A malformed token is treated as no
    /// token at all — never an error.
    pub fn create_cursor(
        &self,
        collection: &str,
        documents: Vec<BTreeMap<String, Value>>,
        filter_json: Json,
        sort_json: Json,
        options: CursorOptions,
    ) -> Result<CursorBatch, Error> {
        options.validate()?;

        let mut start_position = 0;
        if let Some(token) = &options.resume_token {
            if let Some(info) = decode_resume_token(token) {
                if let Some(batch) = self.try_resume_live(&info.cursor_id, options.batch_size) {
                    return batch;
                }
                start_position = position_after(&documents, info.last_document_id.as_deref());
            }
        }

        let now = now_millis();
        let total_count = options.include_total_count.then(|| documents.len());

        let mut state = CursorState {
            collection: collection.to_string(),
            documents,
            position: start_position,
            batch_size: options.batch_size,
            timeout_minutes: options.timeout_minutes,
            created_at: now,
            last_accessed_at: now,
            total_count,
            filter_json,
            sort_json,
        };

        let batch = take_batch(&mut state);
        if state.position >= state.documents.len() {
            return Ok(CursorBatch { cursor_id: None, documents: batch, done: true, total_count });
        }

        let cursor_id = uuid::Uuid::new_v4().to_string();
        self.cursors.write().unwrap().insert(cursor_id.clone(), Mutex::new(state));
        Ok(CursorBatch { cursor_id: Some(cursor_id), documents: batch, done: false, total_count })
    }

    /// `Some(result)` iff `cursor_id` is still tracked; the remainder comes
    /// back the same way `get_more` would return it.
    fn try_resume_live(&self, cursor_id: &str, batch_size: usize) -> Option<Result<CursorBatch, Error>> {
        if !self.cursors.read().unwrap().contains_key(cursor_id) {
            return None;
        }
        Some(self.get_more(cursor_id, Some(batch_size)))
    }

    pub fn get_more(&self, cursor_id: &str, batch_size_override: Option<usize>) -> Result<CursorBatch, Error> {
        let cursors = self.cursors.read().unwrap();
        let entry = cursors
            .get(cursor_id)
            .ok_or_else(|| Error::CursorNotFound(cursor_id.to_string()))?;
        let mut state = entry.lock().unwrap();

        let now = now_millis();
        if state.is_expired(now) {
            drop(state);
            drop(cursors);
            self.cursors.write().unwrap().remove(cursor_id);
            return Err(Error::CursorExpired(cursor_id.to_string()));
        }
        state.last_accessed_at = now;
        if let Some(size) = batch_size_override {
            state.batch_size = size;
        }

        let total_count = state.total_count;
        let batch = take_batch(&mut state);
        let done = state.position >= state.documents.len();
        drop(state);
        drop(cursors);

        if done {
            self.cursors.write().unwrap().remove(cursor_id);
            Ok(CursorBatch { cursor_id: None, documents: batch, done: true, total_count })
        } else {
            Ok(CursorBatch { cursor_id: Some(cursor_id.to_string()), documents: batch, done: false, total_count })
        }
    }

    pub fn kill(&self, cursor_id: &str) -> bool {
        self.cursors.write().unwrap().remove(cursor_id).is_some()
    }

    pub fn kill_cursors_for_collection(&self, collection: &str) -> usize {
        let mut cursors = self.cursors.write().unwrap();
        let to_remove: Vec<String> = cursors
            .iter()
            .filter(|(_, state)| state.lock().unwrap().collection == collection)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &to_remove {
            cursors.remove(id);
        }
        to_remove.len()
    }

    pub fn resume_token_for(&self, cursor_id: &str) -> Option<String> {
        let cursors = self.cursors.read().unwrap();
        let state = cursors.get(cursor_id)?.lock().unwrap();
        let last_document_id = state
            .documents
            .get(state.position.saturating_sub(1))
            .and_then(|row| row.get(ID_FIELD))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Some(encode_resume_token(&ResumeTokenInfo {
            cursor_id: cursor_id.to_string(),
            last_document_id,
            created_at: state.created_at,
            filter_json: state.filter_json.clone(),
            sort_json: state.sort_json.clone(),
        }))
    }

    pub fn active_count(&self) -> usize {
        self.cursors.read().unwrap().len()
    }

    fn reap_expired(&self) -> usize {
        let now = now_millis();
        let mut cursors = self.cursors.write().unwrap();
        let expired: Vec<String> = cursors
            .iter()
            .filter(|(_, state)| state.lock().unwrap().is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            cursors.remove(id);
        }
        expired.len()
    }

    /// Spawn the background reaper thread, grounded on the same
    /// thread+condvar shutdown pattern used by the TTL sweeper.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> CursorReaperHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new((Mutex::new(()), Condvar::new()));
        let manager = Arc::clone(self);
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_notify = Arc::clone(&notify);

        let handle = thread::spawn(move || {
            loop {
                let (lock, cvar) = &*thread_notify;
                let guard = lock.lock().unwrap();
                let _ = cvar.wait_timeout(guard, interval).unwrap();
                if thread_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                manager.reap_expired();
            }
        });

        CursorReaperHandle { shutdown, notify, handle: Some(handle) }
    }
}

fn position_after(documents: &[BTreeMap<String, Value>], last_document_id: Option<&str>) -> usize {
    let Some(last_id) = last_document_id else {
        return 0;
    };
    if let Some(idx) = documents
        .iter()
        .position(|d| d.get(ID_FIELD).and_then(|v| v.as_str()) == Some(last_id))
    {
        return idx + 1;
    }
    documents
        .iter()
        .position(|d| d.get(ID_FIELD).and_then(|v| v.as_str()).is_some_and(|id| id > last_id))
        .unwrap_or(documents.len())
}

fn take_batch(state: &mut CursorState) -> Vec<BTreeMap<String, Value>> {
    let end = (state.position + state.batch_size).min(state.documents.len());
    let batch = state.documents[state.position..end].to_vec();
    state.position = end;
    batch
}

pub struct CursorReaperHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<(Mutex<()>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CursorReaperHandle {
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.1.notify_one();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for CursorReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
