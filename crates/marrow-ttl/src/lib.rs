//! TTL service (component C5): tracks per-document expiration derived from
//! a per-collection policy, and runs a background sweeper that deletes
//! expired documents via a caller-supplied callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use marrow_model::{Document, Error, Value, get_path, now_millis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlPolicy {
    pub field: String,
    pub default_expire_after: Option<Duration>,
    pub immediate_deletion: bool,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtlStats {
    pub documents_tracked: u64,
    pub documents_expired: u64,
    pub cleanup_runs: u64,
    pub average_cleanup_time_ms: f64,
    pub last_cleanup_time: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum TtlEvent {
    DocumentsExpired { collection: String, ids: Vec<String> },
    PolicyChanged { collection: String },
}

type DeleteCallback = dyn Fn(&str, &str) -> bool + Send + Sync;
type EventCallback = dyn Fn(TtlEvent) + Send + Sync;

struct Inner {
    policies: RwLock<HashMap<String, TtlPolicy>>,
    tracked: RwLock<HashMap<(String, String), i64>>,
    stats: Mutex<TtlStats>,
    disposed: AtomicBool,
    delete_cb: Box<DeleteCallback>,
    events: Mutex<Vec<Box<EventCallback>>>,
}

/// Shared handle for the TTL service. Cheap to clone; the background
/// sweeper holds its own clone so the service outlives individual callers.
#[derive(Clone)]
pub struct TtlService(Arc<Inner>);

impl TtlService {
    pub fn new(delete_cb: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(Inner {
            policies: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashMap::new()),
            stats: Mutex::new(TtlStats::default()),
            disposed: AtomicBool::new(false),
            delete_cb: Box::new(delete_cb),
            events: Mutex::new(Vec::new()),
        }))
    }

    fn check_disposed(&self) -> Result<(), Error> {
        if self.0.disposed.load(Ordering::Relaxed) {
            Err(Error::AlreadyDisposed)
        } else {
            Ok(())
        }
    }

    pub fn on_event(&self, callback: impl Fn(TtlEvent) + Send + Sync + 'static) {
        self.0.events.lock().unwrap().push(Box::new(callback));
    }

    fn fire(&self, event: TtlEvent) {
        for cb in self.0.events.lock().unwrap().iter() {
            cb(event.clone());
        }
    }

    pub fn set_policy(&self, collection: &str, policy: TtlPolicy) -> Result<(), Error> {
        self.check_disposed()?;
        self.0
            .policies
            .write()
            .unwrap()
            .insert(collection.to_string(), policy);
        self.fire(TtlEvent::PolicyChanged {
            collection: collection.to_string(),
        });
        Ok(())
    }

    pub fn remove_policy(&self, collection: &str) -> Result<(), Error> {
        self.check_disposed()?;
        self.0.policies.write().unwrap().remove(collection);
        self.0
            .tracked
            .write()
            .unwrap()
            .retain(|(c, _), _| c != collection);
        self.fire(TtlEvent::PolicyChanged {
            collection: collection.to_string(),
        });
        Ok(())
    }

    fn derive_expiry(policy: &TtlPolicy, doc: &Document) -> Option<i64> {
        let value = get_path(&doc.data, &policy.field);
        let from_field = match value {
            Some(Value::Timestamp(ms)) => Some(*ms),
            Some(Value::Int(ms)) => Some(*ms),
            Some(Value::String(s)) => parse_timestamp_str(s),
            _ => None,
        };
        from_field.or_else(|| {
            policy
                .default_expire_after
                .map(|d| doc.created_at + d.as_millis() as i64)
        })
    }

    /// Register (or update the registration of) a document against its
    /// collection's TTL policy, if any. Documents whose collection has no
    /// policy, or whose field yields no parseable/derivable expiration, are
    /// left untracked (spec §4.4).
    pub fn register(&self, collection: &str, doc: &Document) -> Result<(), Error> {
        self.check_disposed()?;
        let policy = self.0.policies.read().unwrap().get(collection).cloned();
        let Some(policy) = policy else {
            self.unregister(collection, &doc.id)?;
            return Ok(());
        };

        match Self::derive_expiry(&policy, doc) {
            Some(expires_at) => {
                self.0
                    .tracked
                    .write()
                    .unwrap()
                    .insert((collection.to_string(), doc.id.clone()), expires_at);

                if policy.immediate_deletion && expires_at <= now_millis() {
                    self.sweep_once();
                }
            }
            None => {
                self.0
                    .tracked
                    .write()
                    .unwrap()
                    .remove(&(collection.to_string(), doc.id.clone()));
            }
        }
        Ok(())
    }

    pub fn unregister(&self, collection: &str, id: &str) -> Result<(), Error> {
        self.check_disposed()?;
        self.0
            .tracked
            .write()
            .unwrap()
            .remove(&(collection.to_string(), id.to_string()));
        Ok(())
    }

    pub fn on_drop_collection(&self, collection: &str) {
        self.0.policies.write().unwrap().remove(collection);
        self.0
            .tracked
            .write()
            .unwrap()
            .retain(|(c, _), _| c != collection);
    }

    /// Run one sweep pass synchronously (usable from tests, and from the
    /// background thread spawned by `spawn_background`). The delete
    /// callback is invoked outside the tracked-entries lock to avoid
    /// reentrancy into the document store (spec §5).
    pub fn sweep_once(&self) -> usize {
        let start = now_millis();
        let now = now_millis();

        let expired: Vec<(String, String)> = {
            let tracked = self.0.tracked.read().unwrap();
            tracked
                .iter()
                .filter(|(_, expires_at)| **expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect()
        };

        let mut by_collection: HashMap<String, Vec<String>> = HashMap::new();
        let mut deleted = 0usize;
        for (collection, id) in &expired {
            if (self.0.delete_cb)(collection, id) {
                deleted += 1;
                by_collection.entry(collection.clone()).or_default().push(id.clone());
            }
        }

        {
            let mut tracked = self.0.tracked.write().unwrap();
            for (collection, id) in &expired {
                tracked.remove(&(collection.clone(), id.clone()));
            }
        }

        for (collection, ids) in by_collection {
            self.fire(TtlEvent::DocumentsExpired { collection, ids });
        }

        {
            let mut stats = self.0.stats.lock().unwrap();
            stats.documents_expired += deleted as u64;
            stats.cleanup_runs += 1;
            let elapsed = (now_millis() - start).max(0) as f64;
            let n = stats.cleanup_runs as f64;
            stats.average_cleanup_time_ms += (elapsed - stats.average_cleanup_time_ms) / n;
            stats.last_cleanup_time = Some(now_millis());
        }

        deleted
    }

    pub fn stats(&self) -> TtlStats {
        let mut stats = self.0.stats.lock().unwrap().clone();
        stats.documents_tracked = self.0.tracked.read().unwrap().len() as u64;
        stats
    }

    pub fn dispose(&self) {
        self.0.disposed.store(true, Ordering::Relaxed);
    }

    /// Spawn the background sweep thread. Mirrors the reference's TTL
    /// sweep thread (`slate-db::sweep`): a condvar-gated loop that wakes on
    /// `cleanup_interval` or on `stop()`/drop, whichever comes first.
    pub fn spawn_background(&self, cleanup_interval: Duration) -> TtlHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new((Mutex::new(()), Condvar::new()));
        let service = self.clone();
        let thread_shutdown = Arc::clone(&shutdown);
        let thread_notify = Arc::clone(&notify);

        let handle = thread::spawn(move || {
            loop {
                let (lock, cvar) = &*thread_notify;
                let guard = lock.lock().unwrap();
                let _ = cvar.wait_timeout(guard, cleanup_interval).unwrap();
                if thread_shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if service.check_disposed().is_err() {
                    break;
                }
                service.sweep_once();
            }
        });

        TtlHandle {
            shutdown,
            notify,
            handle: Some(handle),
        }
    }
}

fn parse_timestamp_str(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|ndt| ndt.and_utc().timestamp_millis())
}

pub struct TtlHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<(Mutex<()>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TtlHandle {
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.1.notify_one();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for TtlHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
