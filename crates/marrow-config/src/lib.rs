//! Configuration surface and hot-reload notification contract.
//!
//! `marrow-config` only defines the shape of the config object and the
//! subscriber mechanism an external loader (file watcher, admin RPC) would
//! drive; it does not itself watch anything on disk.

use std::sync::Arc;

use arc_swap::ArcSwap;
use marrow_model::Error;
use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    27080
}
fn default_max_concurrent_connections() -> u32 {
    100
}
fn default_connection_timeout_secs() -> u64 {
    30
}
fn default_keep_alive_interval_secs() -> u64 {
    15
}
fn default_receive_buffer_size() -> u32 {
    65536
}
fn default_send_buffer_size() -> u32 {
    65536
}
fn default_token_expiration_hours() -> u32 {
    24
}
fn default_max_cache_item_count() -> u32 {
    10_000
}

/// Mirrors `spec.md` §6's configuration object field-for-field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: u32,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: u32,
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: u32,
    #[serde(default)]
    pub require_authentication: bool,
    #[serde(default = "default_token_expiration_hours")]
    pub token_expiration_hours: u32,
    #[serde(default = "default_max_cache_item_count")]
    pub max_cache_item_count: u32,
    #[serde(default)]
    pub enable_detailed_logging: bool,
    pub data_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            port: default_port(),
            max_concurrent_connections: default_max_concurrent_connections(),
            connection_timeout_secs: default_connection_timeout_secs(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            receive_buffer_size: default_receive_buffer_size(),
            send_buffer_size: default_send_buffer_size(),
            require_authentication: false,
            token_expiration_hours: default_token_expiration_hours(),
            max_cache_item_count: default_max_cache_item_count(),
            enable_detailed_logging: false,
            data_path: "./data".to_string(),
        }
    }
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Config, Error> {
        let cfg: Config = serde_json::from_str(s)?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path)?;
        Config::from_json_str(&contents)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Fields an external loader may apply without a process restart.
    pub fn hot_reloadable_diff(&self, other: &Config) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.max_cache_item_count != other.max_cache_item_count {
            changed.push("max_cache_item_count");
        }
        if self.enable_detailed_logging != other.enable_detailed_logging {
            changed.push("enable_detailed_logging");
        }
        changed
    }
}

/// Fired by an external configuration loader when the on-disk config changes.
#[derive(Debug, Clone)]
pub struct ConfigurationChanged {
    pub old: Config,
    pub new: Config,
    pub change_time: i64,
    pub source: String,
}

type ChangeCallback = dyn Fn(&ConfigurationChanged) + Send + Sync;

/// Holds the live config behind an `ArcSwap` so readers never block on a
/// reload, and fans `ConfigurationChanged` out to subscribers synchronously.
pub struct ConfigWatcher {
    current: ArcSwap<Config>,
    subscribers: std::sync::Mutex<Vec<Arc<ChangeCallback>>>,
}

impl ConfigWatcher {
    pub fn new(initial: Config) -> Self {
        ConfigWatcher {
            current: ArcSwap::new(Arc::new(initial)),
            subscribers: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&ConfigurationChanged) + Send + Sync + 'static,
    {
        self.subscribers.lock().unwrap().push(Arc::new(callback));
    }

    /// Applies a new config and notifies every subscriber outside the
    /// subscriber-list lock, so a callback may re-enter `subscribe` without
    /// deadlocking.
    pub fn notify_changed(&self, new: Config, change_time: i64, source: impl Into<String>) {
        let old = self.current.load_full();
        self.current.store(Arc::new(new.clone()));

        let event = ConfigurationChanged {
            old: (*old).clone(),
            new,
            change_time,
            source: source.into(),
        };

        let callbacks: Vec<Arc<ChangeCallback>> = self.subscribers.lock().unwrap().clone();
        for cb in callbacks {
            cb(&event);
        }
    }
}
